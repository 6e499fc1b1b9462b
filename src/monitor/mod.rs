//! L4 autopilot monitor.
//!
//! Active only when the policy gate passed with `autopilot: true`. The
//! monitor observes step outcomes, accumulates a weighted deviation
//! score, and requests a safe-fail (pause + checkpoint + HITL handoff)
//! when the score crosses the threshold or a single high-severity
//! deviation fires. It never mutates step outputs.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::policy::PenaltyWeights;
use crate::store::{Deviation, DeviationKind, DeviationSeverity};

/// What the orchestrator should do after an observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorVerdict {
    Continue,
    /// Pause the run, write a checkpoint, create a handoff record.
    SafeFail { reason: String },
}

/// Handoff record created when the monitor stops a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub run_id: u64,
    pub step_index: usize,
    pub score: u32,
    pub threshold: u32,
    pub reason: String,
}

pub struct L4Monitor {
    enabled: bool,
    threshold: u32,
    penalties: PenaltyWeights,
    deviations: Vec<Deviation>,
    score: u32,
}

impl L4Monitor {
    pub fn new(enabled: bool, threshold: u32, penalties: PenaltyWeights) -> Self {
        L4Monitor {
            enabled,
            threshold,
            penalties,
            deviations: Vec::new(),
            score: 0,
        }
    }

    pub fn disabled() -> Self {
        L4Monitor::new(false, u32::MAX, PenaltyWeights::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn deviations(&self) -> &[Deviation] {
        &self.deviations
    }

    fn severity_of(kind: DeviationKind) -> DeviationSeverity {
        match kind {
            DeviationKind::DomainDrift
            | DeviationKind::DownloadFail
            | DeviationKind::RiskEscalation => DeviationSeverity::High,
            DeviationKind::UnexpectedElement | DeviationKind::VerifierFail => {
                DeviationSeverity::Medium
            }
            DeviationKind::Timing | DeviationKind::RetryCap => DeviationSeverity::Low,
        }
    }

    fn penalty_of(&self, kind: DeviationKind, step_has_risk: bool) -> u32 {
        match kind {
            DeviationKind::VerifierFail => {
                self.penalties.verifier_fail
                    + if step_has_risk {
                        self.penalties.risk_penalty
                    } else {
                        0
                    }
            }
            DeviationKind::UnexpectedElement => self.penalties.unexpected_element,
            DeviationKind::Timing => self.penalties.timing,
            DeviationKind::DomainDrift => self.penalties.domain_drift,
            DeviationKind::DownloadFail => self.penalties.download_fail,
            DeviationKind::RetryCap => self.penalties.retry_cap,
            DeviationKind::RiskEscalation => self.penalties.domain_drift,
        }
    }

    /// Record one deviation and decide whether to safe-fail. Returns the
    /// recorded deviation (for persistence) and the verdict. When the
    /// monitor is disabled the deviation is still recorded with score 0
    /// and the verdict is always `Continue`.
    pub fn observe(
        &mut self,
        run_id: u64,
        step_index: usize,
        kind: DeviationKind,
        reason: impl Into<String>,
        step_has_risk: bool,
    ) -> (Deviation, MonitorVerdict) {
        let severity = Self::severity_of(kind);
        let penalty = if self.enabled {
            self.penalty_of(kind, step_has_risk)
        } else {
            0
        };
        self.score += penalty;

        let deviation = Deviation {
            run_id,
            step_index,
            kind,
            severity,
            score: penalty,
            reason: reason.into(),
            detected_at: Utc::now(),
        };
        self.deviations.push(deviation.clone());

        if !self.enabled {
            return (deviation, MonitorVerdict::Continue);
        }

        if severity == DeviationSeverity::High {
            tracing::warn!(run_id, step_index, ?kind, "high-severity deviation, safe-fail");
            return (
                deviation.clone(),
                MonitorVerdict::SafeFail {
                    reason: format!("high-severity deviation: {}", deviation.reason),
                },
            );
        }
        if self.score >= self.threshold {
            tracing::warn!(
                run_id,
                step_index,
                score = self.score,
                threshold = self.threshold,
                "deviation score crossed threshold, safe-fail"
            );
            return (
                deviation,
                MonitorVerdict::SafeFail {
                    reason: format!(
                        "deviation score {} reached threshold {}",
                        self.score, self.threshold
                    ),
                },
            );
        }
        (deviation, MonitorVerdict::Continue)
    }

    pub fn handoff(&self, run_id: u64, step_index: usize, reason: &str) -> HandoffRecord {
        HandoffRecord {
            run_id,
            step_index,
            score: self.score,
            threshold: self.threshold,
            reason: reason.to_string(),
        }
    }
}

/// Insertion-aware alignment of the executed action sequence against the
/// plan's declared sequence. An inserted action reports one unexpected
/// deviation without cascading reorder reports; simple shifts re-align.
pub fn sequence_deviations(expected: &[String], actual: &[String]) -> Vec<(usize, String)> {
    let mut deviations = Vec::new();
    let mut e = 0;
    let mut a = 0;
    while a < actual.len() && e < expected.len() {
        if actual[a] == expected[e] {
            a += 1;
            e += 1;
            continue;
        }
        if !expected.contains(&actual[a]) {
            deviations.push((a, format!("unexpected action '{}'", actual[a])));
            a += 1;
            // Do not advance the expected cursor; re-align on the next
            // actual entry.
            continue;
        }
        // Reordering: consume both sides.
        deviations.push((a, format!("expected '{}' but got '{}'", expected[e], actual[a])));
        a += 1;
        e += 1;
    }
    while a < actual.len() {
        if !expected.contains(&actual[a]) {
            deviations.push((a, format!("unexpected action '{}'", actual[a])));
        }
        a += 1;
    }
    deviations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> L4Monitor {
        L4Monitor::new(true, 3, PenaltyWeights::default())
    }

    #[test]
    fn test_score_accumulates_to_threshold() {
        let mut m = monitor();
        // Two unexpected elements at penalty 2 each: second crosses 3.
        let (_, verdict) = m.observe(1, 2, DeviationKind::UnexpectedElement, "popup", false);
        assert_eq!(verdict, MonitorVerdict::Continue);
        assert_eq!(m.score(), 2);

        let (_, verdict) = m.observe(1, 4, DeviationKind::UnexpectedElement, "banner", false);
        assert!(matches!(verdict, MonitorVerdict::SafeFail { .. }));
        assert_eq!(m.score(), 4);
    }

    #[test]
    fn test_high_severity_fires_immediately() {
        let mut m = monitor();
        let (deviation, verdict) =
            m.observe(1, 0, DeviationKind::DomainDrift, "left allowlist", false);
        assert_eq!(deviation.severity, DeviationSeverity::High);
        assert!(matches!(verdict, MonitorVerdict::SafeFail { .. }));
    }

    #[test]
    fn test_verifier_fail_risk_penalty() {
        let mut m = monitor();
        let (d, _) = m.observe(1, 1, DeviationKind::VerifierFail, "assert failed", true);
        assert_eq!(d.score, 2); // 1 + risk penalty 1

        let mut m = monitor();
        let (d, _) = m.observe(1, 1, DeviationKind::VerifierFail, "assert failed", false);
        assert_eq!(d.score, 1);
    }

    #[test]
    fn test_disabled_monitor_records_but_never_stops() {
        let mut m = L4Monitor::disabled();
        for _ in 0..10 {
            let (_, verdict) = m.observe(1, 0, DeviationKind::DomainDrift, "x", false);
            assert_eq!(verdict, MonitorVerdict::Continue);
        }
        assert_eq!(m.score(), 0);
        assert_eq!(m.deviations().len(), 10);
    }

    #[test]
    fn test_timing_and_retry_cap_are_low_weight() {
        let mut m = monitor();
        let (_, v1) = m.observe(1, 0, DeviationKind::Timing, "slow", false);
        let (_, v2) = m.observe(1, 1, DeviationKind::RetryCap, "retries exhausted", false);
        assert_eq!(v1, MonitorVerdict::Continue);
        assert_eq!(v2, MonitorVerdict::Continue);
        assert_eq!(m.score(), 2);
    }

    #[test]
    fn test_sequence_alignment_insertion() {
        let expected = vec!["open_browser".into(), "fill_by_label".into(), "click_by_text".into()];
        let actual = vec![
            "open_browser".to_string(),
            "dismiss_popup".to_string(),
            "fill_by_label".to_string(),
            "click_by_text".to_string(),
        ];
        let deviations = sequence_deviations(&expected, &actual);
        assert_eq!(deviations.len(), 1);
        assert!(deviations[0].1.contains("dismiss_popup"));
    }

    #[test]
    fn test_sequence_alignment_reorder() {
        let expected = vec!["a".to_string(), "b".to_string()];
        let actual = vec!["b".to_string(), "a".to_string()];
        let deviations = sequence_deviations(&expected, &actual);
        assert!(!deviations.is_empty());
    }

    #[test]
    fn test_sequence_trailing_insertions() {
        let expected = vec!["a".to_string()];
        let actual = vec!["a".to_string(), "z".to_string()];
        let deviations = sequence_deviations(&expected, &actual);
        assert_eq!(deviations.len(), 1);
    }
}
