//! Rolling metrics and failure clustering.
//!
//! Events are appended by the executor, verifier, monitor, and policy
//! engine as a side effect of their transitions; snapshots aggregate the
//! trailing 24-hour and 7-day windows. Snapshots are read-only.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ErrorCode;
use crate::store::RunState;
use crate::verifier::VerifierOutcome;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetricEvent {
    RunFinished {
        state: RunState,
        duration_ms: u64,
        queue: String,
    },
    StepExecuted,
    StepRetried,
    ApprovalRequired,
    ApprovalGranted,
    Verifier {
        outcome: VerifierOutcome,
    },
    SchemaCaptured,
    WebUpload {
        success: bool,
    },
    OsCapabilityMiss,
    L4Autorun,
    PolicyBlock,
    DeviationStop,
    PatchProposed,
    PatchAutoAdopted,
    QueueDepth {
        depth: usize,
    },
    Failure {
        code: ErrorCode,
        message: String,
    },
}

/// Aggregates over one trailing window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowStats {
    pub total_runs: u64,
    pub completed_runs: u64,
    pub failed_runs: u64,
    pub success_rate: f64,
    pub median_duration_ms: u64,
    pub p95_duration_ms: u64,
    pub approvals_required: u64,
    pub approvals_granted: u64,
    pub verifier_checks: u64,
    /// RETRY counts as a pass.
    pub verifier_pass_rate: f64,
    pub schema_captures: u64,
    pub web_uploads: u64,
    pub web_upload_success_rate: f64,
    pub os_capability_misses: u64,
    pub l4_autoruns: u64,
    pub policy_blocks: u64,
    pub deviation_stops: u64,
    pub patches_proposed: u64,
    pub patches_auto_adopted: u64,
    pub queue_depth_peak: usize,
    pub steps_executed: u64,
    pub retry_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureCluster {
    pub code: ErrorCode,
    pub count: u64,
    pub sample_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    /// Runs finished in the trailing hour.
    pub runs_last_hour: u64,
    pub last_24h: WindowStats,
    pub last_7d: WindowStats,
    /// Top-K failure clusters over 7 days, largest first.
    pub failure_clusters: Vec<FailureCluster>,
}

const CLUSTER_TOP_K: usize = 5;

pub struct MetricsHub {
    events: Mutex<Vec<(DateTime<Utc>, MetricEvent)>>,
}

impl MetricsHub {
    pub fn new() -> Self {
        MetricsHub {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, event: MetricEvent) {
        self.record_at(Utc::now(), event);
    }

    /// Timestamped insert; tests use this to stage window boundaries.
    pub fn record_at(&self, at: DateTime<Utc>, event: MetricEvent) {
        let mut events = self.events.lock();
        events.push((at, event));
        // Prune anything past the widest window we report.
        if events.len() % 256 == 0 {
            let horizon = Utc::now() - Duration::days(7);
            events.retain(|(t, _)| *t >= horizon);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Utc::now();
        let events = self.events.lock();
        let runs_last_hour = aggregate(&events, now - Duration::hours(1), now).total_runs;
        let last_24h = aggregate(&events, now - Duration::hours(24), now);
        let last_7d = aggregate(&events, now - Duration::days(7), now);
        let failure_clusters = cluster_failures(&events, now - Duration::days(7));
        MetricsSnapshot {
            generated_at: now,
            runs_last_hour,
            last_24h,
            last_7d,
            failure_clusters,
        }
    }
}

impl Default for MetricsHub {
    fn default() -> Self {
        Self::new()
    }
}

fn aggregate(
    events: &[(DateTime<Utc>, MetricEvent)],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> WindowStats {
    let mut stats = WindowStats::default();
    let mut durations = Vec::new();
    let mut verifier_passes = 0u64;
    let mut upload_successes = 0u64;
    let mut retries = 0u64;

    for (at, event) in events {
        if *at < from || *at >= to {
            continue;
        }
        match event {
            MetricEvent::RunFinished {
                state, duration_ms, ..
            } => {
                stats.total_runs += 1;
                durations.push(*duration_ms);
                match state {
                    RunState::Completed => stats.completed_runs += 1,
                    RunState::Failed => stats.failed_runs += 1,
                    _ => {}
                }
            }
            MetricEvent::StepExecuted => stats.steps_executed += 1,
            MetricEvent::StepRetried => retries += 1,
            MetricEvent::ApprovalRequired => stats.approvals_required += 1,
            MetricEvent::ApprovalGranted => stats.approvals_granted += 1,
            MetricEvent::Verifier { outcome } => {
                stats.verifier_checks += 1;
                if matches!(outcome, VerifierOutcome::Pass | VerifierOutcome::Retry) {
                    verifier_passes += 1;
                }
            }
            MetricEvent::SchemaCaptured => stats.schema_captures += 1,
            MetricEvent::WebUpload { success } => {
                stats.web_uploads += 1;
                if *success {
                    upload_successes += 1;
                }
            }
            MetricEvent::OsCapabilityMiss => stats.os_capability_misses += 1,
            MetricEvent::L4Autorun => stats.l4_autoruns += 1,
            MetricEvent::PolicyBlock => stats.policy_blocks += 1,
            MetricEvent::DeviationStop => stats.deviation_stops += 1,
            MetricEvent::PatchProposed => stats.patches_proposed += 1,
            MetricEvent::PatchAutoAdopted => stats.patches_auto_adopted += 1,
            MetricEvent::QueueDepth { depth } => {
                stats.queue_depth_peak = stats.queue_depth_peak.max(*depth);
            }
            MetricEvent::Failure { .. } => {}
        }
    }

    durations.sort_unstable();
    stats.median_duration_ms = percentile(&durations, 50);
    stats.p95_duration_ms = percentile(&durations, 95);
    stats.success_rate = ratio(stats.completed_runs, stats.total_runs);
    stats.verifier_pass_rate = ratio(verifier_passes, stats.verifier_checks);
    stats.web_upload_success_rate = ratio(upload_successes, stats.web_uploads);
    stats.retry_rate = ratio(retries, stats.steps_executed);
    stats
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn percentile(sorted: &[u64], pct: u64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (pct as usize * sorted.len()).div_ceil(100);
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

fn cluster_failures(
    events: &[(DateTime<Utc>, MetricEvent)],
    from: DateTime<Utc>,
) -> Vec<FailureCluster> {
    let mut clusters: HashMap<ErrorCode, (u64, String)> = HashMap::new();
    for (at, event) in events {
        if *at < from {
            continue;
        }
        if let MetricEvent::Failure { code, message } = event {
            let entry = clusters.entry(*code).or_insert_with(|| (0, message.clone()));
            entry.0 += 1;
        }
    }
    let mut out: Vec<FailureCluster> = clusters
        .into_iter()
        .map(|(code, (count, sample_message))| FailureCluster {
            code,
            count,
            sample_message,
        })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then(a.code.as_str().cmp(b.code.as_str())));
    out.truncate(CLUSTER_TOP_K);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate_and_percentiles() {
        let hub = MetricsHub::new();
        for duration in [100u64, 200, 300, 400, 1000] {
            hub.record(MetricEvent::RunFinished {
                state: RunState::Completed,
                duration_ms: duration,
                queue: "default".into(),
            });
        }
        hub.record(MetricEvent::RunFinished {
            state: RunState::Failed,
            duration_ms: 50,
            queue: "default".into(),
        });

        let snap = hub.snapshot();
        assert_eq!(snap.last_24h.total_runs, 6);
        assert_eq!(snap.last_24h.completed_runs, 5);
        assert!((snap.last_24h.success_rate - 5.0 / 6.0).abs() < 1e-9);
        assert_eq!(snap.last_24h.p95_duration_ms, 1000);
        assert!(snap.last_24h.median_duration_ms <= 300);
    }

    #[test]
    fn test_verifier_retry_counts_as_pass() {
        let hub = MetricsHub::new();
        hub.record(MetricEvent::Verifier {
            outcome: VerifierOutcome::Pass,
        });
        hub.record(MetricEvent::Verifier {
            outcome: VerifierOutcome::Retry,
        });
        hub.record(MetricEvent::Verifier {
            outcome: VerifierOutcome::Fail,
        });
        let snap = hub.snapshot();
        assert!((snap.last_24h.verifier_pass_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_old_events_fall_out_of_24h_window() {
        let hub = MetricsHub::new();
        hub.record_at(
            Utc::now() - Duration::days(2),
            MetricEvent::PolicyBlock,
        );
        hub.record(MetricEvent::PolicyBlock);

        let snap = hub.snapshot();
        assert_eq!(snap.last_24h.policy_blocks, 1);
        assert_eq!(snap.last_7d.policy_blocks, 2);
    }

    #[test]
    fn test_failure_clusters_top_k() {
        let hub = MetricsHub::new();
        for _ in 0..4 {
            hub.record(MetricEvent::Failure {
                code: ErrorCode::WebElementNotFound,
                message: "no element '送信'".into(),
            });
        }
        hub.record(MetricEvent::Failure {
            code: ErrorCode::Timeout,
            message: "step timed out".into(),
        });

        let snap = hub.snapshot();
        assert_eq!(snap.failure_clusters[0].code, ErrorCode::WebElementNotFound);
        assert_eq!(snap.failure_clusters[0].count, 4);
        assert_eq!(snap.failure_clusters.len(), 2);
    }

    #[test]
    fn test_queue_depth_peak_and_retry_rate() {
        let hub = MetricsHub::new();
        hub.record(MetricEvent::QueueDepth { depth: 3 });
        hub.record(MetricEvent::QueueDepth { depth: 9 });
        hub.record(MetricEvent::QueueDepth { depth: 1 });
        for _ in 0..4 {
            hub.record(MetricEvent::StepExecuted);
        }
        hub.record(MetricEvent::StepRetried);

        let snap = hub.snapshot();
        assert_eq!(snap.last_24h.queue_depth_peak, 9);
        assert!((snap.last_24h.retry_rate - 0.25).abs() < 1e-9);
    }
}
