//! Cron schedule runner.
//!
//! Ticks once per interval, fires every schedule whose cron expression
//! matches the current minute in its timezone, and deduplicates so each
//! minute fires at most once per schedule.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::ScheduleEntry;

use super::cron::CronExpr;

pub struct ScheduleRunner {
    entries: Vec<(ScheduleEntry, CronExpr, Tz)>,
    last_fired: HashMap<String, DateTime<Utc>>,
}

impl ScheduleRunner {
    pub fn new(entries: Vec<ScheduleEntry>) -> Result<Self, String> {
        let mut parsed = Vec::with_capacity(entries.len());
        for entry in entries {
            let cron = CronExpr::parse(&entry.cron)
                .map_err(|e| format!("schedule '{}': {e}", entry.id))?;
            let tz: Tz = entry
                .timezone
                .parse()
                .map_err(|_| format!("schedule '{}': unknown timezone {}", entry.id, entry.timezone))?;
            parsed.push((entry, cron, tz));
        }
        Ok(ScheduleRunner {
            entries: parsed,
            last_fired: HashMap::new(),
        })
    }

    /// Schedules due at `now`: cron matches the containing minute and
    /// the schedule has not already fired this minute (at-most-once per
    /// fire).
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<ScheduleEntry> {
        let minute = now.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(now);
        let mut fired = Vec::new();
        for (entry, cron, tz) in &self.entries {
            if !cron.matches(minute, tz) {
                continue;
            }
            if self.last_fired.get(&entry.id) == Some(&minute) {
                continue;
            }
            self.last_fired.insert(entry.id.clone(), minute);
            fired.push(entry.clone());
        }
        fired
    }

    /// Tick until cancelled, invoking `on_fire` for each due schedule.
    pub async fn run<F>(mut self, on_fire: F, cancel: CancellationToken)
    where
        F: Fn(ScheduleEntry) + Send,
    {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(20)) => {
                    for entry in self.due(Utc::now()) {
                        tracing::info!(schedule = %entry.id, "cron schedule fired");
                        on_fire(entry);
                    }
                }
            }
        }
    }
}
