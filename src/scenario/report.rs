use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ScenarioKind;
use crate::lb::Counters;
use crate::topology::TeardownSummary;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Running,
    Passed,
    Failed { reason: String },
    Skipped { reason: String },
}

/// Counters of one probe batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    pub label: String,
    pub counters: Counters,
}

/// What happened in one scenario run for one tenant
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: ScenarioKind,
    pub tenant: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Outcome,
    pub batches: Vec<BatchRecord>,
    pub checks: Vec<String>,
    pub teardown: Option<TeardownSummary>,
}

impl ScenarioReport {
    pub fn new(scenario: ScenarioKind, tenant: &str) -> Self {
        Self {
            scenario,
            tenant: tenant.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: Outcome::Running,
            batches: Vec::new(),
            checks: Vec::new(),
            teardown: None,
        }
    }

    pub fn record_batch(&mut self, label: &str, counters: &Counters) {
        self.batches.push(BatchRecord {
            label: label.to_string(),
            counters: counters.clone(),
        });
    }

    pub fn record_check(&mut self, check: impl Into<String>) {
        self.checks.push(check.into());
    }

    pub fn finish(&mut self, result: Result<(), String>) {
        self.finished_at = Some(Utc::now());
        self.outcome = match result {
            Ok(()) => Outcome::Passed,
            Err(reason) => Outcome::Failed { reason },
        };
    }

    /// Close the run without judging it
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.finished_at = Some(Utc::now());
        self.outcome = Outcome::Skipped {
            reason: reason.into(),
        };
    }

    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }

    pub fn skipped(&self) -> bool {
        matches!(self.outcome, Outcome::Skipped { .. })
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_serializes_outcome() {
        let mut report = ScenarioReport::new(ScenarioKind::LbaasRoundRobin, "demo");
        report.record_batch("round-robin", &Counters::from_pairs([("a", 13), ("b", 12)]));
        report.finish(Err("backend b received no traffic".to_string()));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["scenario"], "lbaas-round-robin");
        assert_eq!(json["outcome"]["status"], "failed");
        assert_eq!(json["batches"][0]["counters"]["a"], 13);
        assert!(!report.passed());
        assert!(report.duration_secs().is_some());
    }

    #[test]
    fn test_skipped_report_is_not_a_failure() {
        let mut report = ScenarioReport::new(ScenarioKind::LiveMigrate, "demo");
        report.skip("1 compute host(s), live migration needs 2");

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["scenario"], "live-migrate");
        assert_eq!(json["outcome"]["status"], "skipped");
        assert!(report.skipped());
        assert!(!report.passed());
        assert!(report.finished_at.is_some());
    }
}
