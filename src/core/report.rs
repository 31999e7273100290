use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::comparator::ComparisonResult;
use crate::core::matcher::MatchResult;
use crate::core::resolver::Conflict;

/// What caused a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Cron,
    Interval,
    OnDemand,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Cron => "cron",
            TriggerKind::Interval => "interval",
            TriggerKind::OnDemand => "on_demand",
        }
    }
}

/// Why a work item ended in the skipped bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Confirmed applied by an earlier attempt of this run.
    AlreadyApplied,
    /// The conflict strategy decided to keep the stored value.
    StrategySkip,
    /// No meeting or entry hours were attributed to the item.
    NothingToApply,
    DryRun,
    Cancelled,
    /// Abort-on-first-failure stopped the run before this item.
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedItem {
    pub work_item_id: i64,
    pub hours: f64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedItem {
    pub work_item_id: i64,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedItem {
    pub work_item_id: i64,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportTotals {
    pub meetings_considered: usize,
    pub entries_considered: usize,
    pub work_items_in_scope: usize,
    pub total_meeting_hours: f64,
    pub total_manual_hours: f64,
}

/// Overall verdict of a run, derived from the buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

/// Complete result of one reconciliation run.
///
/// Every work item in scope lands in exactly one of the four buckets;
/// silent partial success is not possible by construction of the apply
/// stage. Unmatched records and excluded meetings are carried so nothing
/// disappears from view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub trigger: TriggerKind,
    pub resumed: bool,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: Vec<AppliedItem>,
    pub skipped: Vec<SkippedItem>,
    /// Conflicts queued for human review; their items did not apply.
    pub conflicted: Vec<Conflict>,
    pub failed: Vec<FailedItem>,
    /// All conflicts observed this run, including auto-resolved ones.
    pub conflicts: Vec<Conflict>,
    pub comparisons: Vec<ComparisonResult>,
    pub unmatched: Vec<MatchResult>,
    pub excluded_meetings: usize,
    pub totals: ReportTotals,
    pub cancelled: bool,
}

impl RunReport {
    pub fn outcome(&self) -> RunOutcome {
        if self.cancelled {
            RunOutcome::Cancelled
        } else if self.failed.is_empty() {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Failed
        }
    }

    /// One-line summary for logs and execution history.
    pub fn summary(&self) -> String {
        format!(
            "{} succeeded, {} skipped, {} conflicted, {} failed ({} unmatched records)",
            self.succeeded.len(),
            self.skipped.len(),
            self.conflicted.len(),
            self.failed.len(),
            self.unmatched.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_report() -> RunReport {
        RunReport {
            run_id: "r1".to_string(),
            trigger: TriggerKind::OnDemand,
            resumed: false,
            dry_run: false,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            succeeded: vec![],
            skipped: vec![],
            conflicted: vec![],
            failed: vec![],
            conflicts: vec![],
            comparisons: vec![],
            unmatched: vec![],
            excluded_meetings: 0,
            totals: ReportTotals::default(),
            cancelled: false,
        }
    }

    #[test]
    fn outcome_reflects_buckets() {
        let mut report = empty_report();
        assert_eq!(report.outcome(), RunOutcome::Succeeded);

        report.failed.push(FailedItem {
            work_item_id: 1,
            error: "timeout".to_string(),
            attempts: 3,
        });
        assert_eq!(report.outcome(), RunOutcome::Failed);

        report.cancelled = true;
        assert_eq!(report.outcome(), RunOutcome::Cancelled);
    }
}
