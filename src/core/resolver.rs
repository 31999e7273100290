use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Two completed-work values closer than this are the same value; guards
/// against floating-point noise masquerading as a conflict.
pub const CONFLICT_TOLERANCE_HOURS: f64 = 0.01;

/// How a disagreement between the stored and the freshly computed value is
/// settled. Selected per run via configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Freshly computed value always wins.
    Override,
    /// Existing value plus the newly computed delta is written.
    Add,
    /// Existing value is preserved; the computed value only reaches the report.
    Skip,
    /// No write; the conflict is queued for a human decision.
    ManualReview,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::Override => "override",
            ConflictStrategy::Add => "add",
            ConflictStrategy::Skip => "skip",
            ConflictStrategy::ManualReview => "manual_review",
        }
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "override" => Ok(ConflictStrategy::Override),
            "add" => Ok(ConflictStrategy::Add),
            "skip" => Ok(ConflictStrategy::Skip),
            "manual_review" => Ok(ConflictStrategy::ManualReview),
            other => Err(format!("unknown conflict strategy: {}", other)),
        }
    }
}

/// A detected disagreement plus how the configured strategy settled it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub work_item_id: i64,
    pub existing_hours: f64,
    pub computed_hours: f64,
    pub strategy: ConflictStrategy,
    /// Value the strategy decided to write, if any.
    pub resolved_hours: Option<f64>,
    /// True when the conflict awaits a human decision.
    pub requires_review: bool,
}

/// What the orchestrator should do for one work item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApplyDecision {
    Write { hours: f64 },
    NoWrite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub decision: ApplyDecision,
    /// Present when a Conflict record must be logged.
    pub conflict: Option<Conflict>,
}

/// Decide how to merge a freshly computed value with a pre-existing one.
///
/// Pure function of its inputs; never performs the write itself. Without a
/// pre-existing value, or with one inside the tolerance, the computed value
/// passes through untouched and no conflict is raised.
pub fn resolve(
    work_item_id: i64,
    existing_hours: Option<f64>,
    computed_hours: f64,
    strategy: ConflictStrategy,
) -> Resolution {
    let existing = match existing_hours {
        Some(v) if (v - computed_hours).abs() > CONFLICT_TOLERANCE_HOURS => v,
        _ => {
            return Resolution {
                decision: ApplyDecision::Write {
                    hours: computed_hours,
                },
                conflict: None,
            };
        }
    };

    let (decision, resolved_hours, requires_review) = match strategy {
        ConflictStrategy::Override => (
            ApplyDecision::Write {
                hours: computed_hours,
            },
            Some(computed_hours),
            false,
        ),
        ConflictStrategy::Add => {
            let total = existing + computed_hours;
            (ApplyDecision::Write { hours: total }, Some(total), false)
        }
        ConflictStrategy::Skip => (ApplyDecision::NoWrite, None, false),
        ConflictStrategy::ManualReview => (ApplyDecision::NoWrite, None, true),
    };

    Resolution {
        decision,
        conflict: Some(Conflict {
            work_item_id,
            existing_hours: existing,
            computed_hours,
            strategy,
            resolved_hours,
            requires_review,
        }),
    }
}
