use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{AppError, AppResult};

/// User-submitted record of non-meeting work attributed to a work item.
///
/// Entries are an audit trail: the service never deletes them, and the only
/// mutation it performs is flipping `synced` after the owning work item's
/// update was confirmed applied.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ManualTimeEntry {
    pub id: String,
    pub work_item_id: i64,
    pub entry_date: NaiveDate,
    pub hours: f64,
    pub description: String,
    pub submitted_by: String,
    pub synced: bool,
    pub synced_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateManualTimeEntry {
    pub work_item_id: i64,
    pub entry_date: NaiveDate,
    pub hours: f64,
    pub description: String,
    pub submitted_by: String,
}

impl CreateManualTimeEntry {
    pub fn validate(&self) -> AppResult<()> {
        if self.hours <= 0.0 {
            return Err(AppError::Validation("Hours must be positive".to_string()));
        }
        if self.hours > 24.0 {
            return Err(AppError::Validation(
                "Hours cannot exceed 24 per entry".to_string(),
            ));
        }
        if self.work_item_id <= 0 {
            return Err(AppError::Validation("Invalid work item id".to_string()));
        }
        if self.description.trim().is_empty() {
            return Err(AppError::Validation("Description is required".to_string()));
        }
        if self.submitted_by.trim().is_empty() {
            return Err(AppError::Validation("Submitter is required".to_string()));
        }
        Ok(())
    }
}
