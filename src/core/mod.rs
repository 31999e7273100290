//! Decision logic and control flow of the reconciliation pipeline.
//!
//! The records here are ephemeral: fetched fresh each run, discarded when the
//! run's report is assembled. Durable state (checkpoints, manual entries)
//! lives under `crate::db`.

pub mod comparator;
pub mod matcher;
pub mod orchestrator;
pub mod report;
pub mod resolver;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One calendar event instance for one user, as returned by the calendar
/// source. Immutable once fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingRecord {
    pub id: String,
    pub subject: String,
    pub organizer: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attendees: Vec<String>,
    pub is_cancelled: bool,
}

impl MeetingRecord {
    pub fn duration_hours(&self) -> f64 {
        let seconds = (self.end - self.start).num_seconds();
        if seconds <= 0 {
            return 0.0;
        }
        seconds as f64 / 3600.0
    }
}

/// External task reference owned by the work-tracking service. The core only
/// reads it and proposes patches through the work-item source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub title: String,
    pub tags: Vec<String>,
    /// People associated with the item (assignee plus any recorded
    /// contributors); used for attendee-overlap matching.
    pub team: Vec<String>,
    pub estimated_hours: f64,
    /// Previously recorded actual effort, if any.
    pub completed_hours: Option<f64>,
    pub changed_at: Option<DateTime<Utc>>,
    pub state: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn duration_is_hours_between_start_and_end() {
        let m = MeetingRecord {
            id: "m1".into(),
            subject: "Sync".into(),
            organizer: "lead@example.com".into(),
            start: Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 3, 3, 10, 30, 0).unwrap(),
            attendees: vec![],
            is_cancelled: false,
        };
        assert!((m.duration_hours() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn inverted_times_yield_zero_duration() {
        let m = MeetingRecord {
            id: "m2".into(),
            subject: "Broken".into(),
            organizer: "lead@example.com".into(),
            start: Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap(),
            attendees: vec![],
            is_cancelled: false,
        };
        assert_eq!(m.duration_hours(), 0.0);
    }
}
