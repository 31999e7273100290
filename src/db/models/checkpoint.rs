use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Pipeline stages of one reconciliation run.
///
/// `Done` and `Failed` are terminal. A checkpoint left in any non-`Done`
/// stage is eligible for resume; resumed runs re-fetch source data and only
/// reuse the durable applied set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Fetching,
    Matching,
    Comparing,
    Resolving,
    Applying,
    Reporting,
    Done,
    Failed,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Fetching => "fetching",
            RunStage::Matching => "matching",
            RunStage::Comparing => "comparing",
            RunStage::Resolving => "resolving",
            RunStage::Applying => "applying",
            RunStage::Reporting => "reporting",
            RunStage::Done => "done",
            RunStage::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<RunStage> {
        match s {
            "fetching" => Some(RunStage::Fetching),
            "matching" => Some(RunStage::Matching),
            "comparing" => Some(RunStage::Comparing),
            "resolving" => Some(RunStage::Resolving),
            "applying" => Some(RunStage::Applying),
            "reporting" => Some(RunStage::Reporting),
            "done" => Some(RunStage::Done),
            "failed" => Some(RunStage::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStage::Done | RunStage::Failed)
    }
}

/// Durable per-run progress marker. The stage column holds a `RunStage`
/// string; the applied set lives in `checkpoint_applied`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub stage: String,
    pub trigger_kind: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Checkpoint {
    pub fn stage(&self) -> Option<RunStage> {
        RunStage::parse(&self.stage)
    }
}

/// One confirmed work-item patch within a run. Presence of a row means the
/// external service acknowledged the write; retries of the run skip it.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AppliedUpdate {
    pub run_id: String,
    pub work_item_id: i64,
    pub applied_hours: f64,
    pub applied_at: NaiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_round_trip() {
        for stage in [
            RunStage::Fetching,
            RunStage::Matching,
            RunStage::Comparing,
            RunStage::Resolving,
            RunStage::Applying,
            RunStage::Reporting,
            RunStage::Done,
            RunStage::Failed,
        ] {
            assert_eq!(RunStage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(RunStage::parse("bogus"), None);
    }

    #[test]
    fn terminal_stages() {
        assert!(RunStage::Done.is_terminal());
        assert!(RunStage::Failed.is_terminal());
        assert!(!RunStage::Applying.is_terminal());
    }
}
