//! Folder watcher trigger.
//!
//! Polls a directory for created or modified files matching a glob.
//! Matching events are debounced: the trigger fires only after
//! `debounce_ms` of quiet time, and events inside the window collapse to
//! one firing carrying the last matching path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use tokio_util::sync::CancellationToken;

use crate::adapters::os::glob_matches;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub path: PathBuf,
    pub pattern: String,
    pub debounce_ms: u64,
    pub poll_interval_ms: u64,
}

impl WatcherConfig {
    pub fn new(path: impl Into<PathBuf>, pattern: &str) -> Self {
        WatcherConfig {
            path: path.into(),
            pattern: pattern.to_string(),
            debounce_ms: 500,
            poll_interval_ms: 100,
        }
    }
}

/// Pure debounce state machine, driven by the watcher loop and tested
/// directly with synthetic clocks.
pub struct Debouncer {
    quiet: Duration,
    pending: Option<(Instant, String)>,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Debouncer {
            quiet,
            pending: None,
        }
    }

    /// Record a matching event. Later events replace earlier ones and
    /// restart the quiet window.
    pub fn observe(&mut self, path: String, now: Instant) {
        self.pending = Some((now, path));
    }

    /// Fire if the quiet window has elapsed since the last event.
    pub fn poll(&mut self, now: Instant) -> Option<String> {
        match &self.pending {
            Some((last, _)) if now.duration_since(*last) >= self.quiet => {
                self.pending.take().map(|(_, path)| path)
            }
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

pub struct FolderWatcher {
    config: WatcherConfig,
    seen: HashMap<PathBuf, SystemTime>,
    debouncer: Debouncer,
    primed: bool,
}

impl FolderWatcher {
    pub fn new(config: WatcherConfig) -> Self {
        let debouncer = Debouncer::new(Duration::from_millis(config.debounce_ms));
        FolderWatcher {
            config,
            seen: HashMap::new(),
            debouncer,
            primed: false,
        }
    }

    /// One poll pass: scan the directory, feed new/modified matches into
    /// the debouncer, and return a fired path if the window closed. The
    /// first scan only primes the baseline.
    pub fn scan(&mut self, now: Instant) -> Option<String> {
        let entries = std::fs::read_dir(&self.config.path).ok();
        if let Some(entries) = entries {
            for entry in entries.filter_map(Result::ok) {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if !glob_matches(&self.config.pattern, &name) {
                    continue;
                }
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                let changed = match self.seen.get(&path) {
                    Some(previous) => modified > *previous,
                    None => true,
                };
                self.seen.insert(path.clone(), modified);
                if changed && self.primed {
                    self.debouncer
                        .observe(path.to_string_lossy().into_owned(), now);
                }
            }
        }
        self.primed = true;
        self.debouncer.poll(now)
    }

    /// Poll until cancelled, invoking `on_fire` for each debounced path.
    pub async fn run<F>(mut self, on_fire: F, cancel: CancellationToken)
    where
        F: Fn(String) + Send,
    {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {
                    if let Some(path) = self.scan(Instant::now()) {
                        tracing::info!(%path, "folder watcher fired");
                        on_fire(path);
                    }
                }
            }
        }
    }
}
