use serde::{Deserialize, Serialize};

use crate::config::DeviationConfig;
use crate::core::WorkItem;

/// Severity bucket for the gap between estimated and real effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviationCategory {
    None,
    Low,
    Moderate,
    High,
}

impl DeviationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviationCategory::None => "none",
            DeviationCategory::Low => "low",
            DeviationCategory::Moderate => "moderate",
            DeviationCategory::High => "high",
        }
    }
}

/// Estimated-vs-real comparison for one work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub work_item_id: i64,
    pub work_item_title: String,
    pub estimated_hours: f64,
    pub meeting_hours: f64,
    pub manual_hours: f64,
    pub real_hours: f64,
    pub variance_hours: f64,
    /// Variance as a percentage of the estimate. `None` when the estimate is
    /// zero; the category is forced to High in that case to force review
    /// instead of dividing by zero.
    pub variance_percentage: Option<f64>,
    pub category: DeviationCategory,
}

/// Pure estimated-vs-real comparison with configurable thresholds.
pub struct TimeComparator {
    acceptable: f64,
    low: f64,
    moderate: f64,
}

impl TimeComparator {
    pub fn from_config(cfg: &DeviationConfig) -> Self {
        TimeComparator {
            acceptable: cfg.acceptable,
            low: cfg.low,
            moderate: cfg.moderate,
        }
    }

    pub fn compare(
        &self,
        work_item: &WorkItem,
        meeting_hours: f64,
        manual_hours: f64,
    ) -> ComparisonResult {
        let real_hours = meeting_hours + manual_hours;
        let estimated = work_item.estimated_hours;
        let variance_hours = real_hours - estimated;

        let (variance_percentage, category) = if estimated == 0.0 {
            (None, DeviationCategory::High)
        } else {
            let fraction = variance_hours / estimated;
            (Some(fraction * 100.0), self.categorize(fraction.abs()))
        };

        tracing::debug!(
            work_item_id = work_item.id,
            estimated,
            real = real_hours,
            category = category.as_str(),
            "compared effort"
        );

        ComparisonResult {
            work_item_id: work_item.id,
            work_item_title: work_item.title.clone(),
            estimated_hours: estimated,
            meeting_hours,
            manual_hours,
            real_hours,
            variance_hours,
            variance_percentage,
            category,
        }
    }

    fn categorize(&self, abs_fraction: f64) -> DeviationCategory {
        if abs_fraction <= self.acceptable {
            DeviationCategory::None
        } else if abs_fraction <= self.low {
            DeviationCategory::Low
        } else if abs_fraction <= self.moderate {
            DeviationCategory::Moderate
        } else {
            DeviationCategory::High
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comparator() -> TimeComparator {
        TimeComparator::from_config(&DeviationConfig {
            acceptable: 0.10,
            low: 0.25,
            moderate: 0.50,
        })
    }

    fn item(estimated: f64) -> WorkItem {
        WorkItem {
            id: 101,
            title: "Checkout rework".to_string(),
            tags: vec![],
            team: vec![],
            estimated_hours: estimated,
            completed_hours: None,
            changed_at: None,
            state: "Active".to_string(),
        }
    }

    #[test]
    fn meetings_plus_manual_entries_within_threshold() {
        // 8h estimated, 6h of meetings and 1.5h of entries: -0.5h, -6.25%.
        let result = comparator().compare(&item(8.0), 6.0, 1.5);
        assert!((result.real_hours - 7.5).abs() < 1e-9);
        assert!((result.variance_hours + 0.5).abs() < 1e-9);
        assert!((result.variance_percentage.unwrap() + 6.25).abs() < 1e-9);
        assert_eq!(result.category, DeviationCategory::None);
    }

    #[test]
    fn zero_estimate_always_forces_high() {
        let c = comparator();
        for real in [0.0, 0.1, 8.0, 100.0] {
            let result = c.compare(&item(0.0), real, 0.0);
            assert_eq!(result.category, DeviationCategory::High);
            assert!(result.variance_percentage.is_none());
        }
    }

    #[test]
    fn categories_follow_configured_thresholds() {
        let c = comparator();
        assert_eq!(c.compare(&item(10.0), 10.5, 0.0).category, DeviationCategory::None);
        assert_eq!(c.compare(&item(10.0), 12.0, 0.0).category, DeviationCategory::Low);
        assert_eq!(c.compare(&item(10.0), 14.0, 0.0).category, DeviationCategory::Moderate);
        assert_eq!(c.compare(&item(10.0), 16.0, 0.0).category, DeviationCategory::High);
    }

    #[test]
    fn underruns_categorize_by_magnitude() {
        let c = comparator();
        let result = c.compare(&item(10.0), 4.0, 0.0);
        assert!(result.variance_hours < 0.0);
        assert_eq!(result.category, DeviationCategory::High);
    }

    #[test]
    fn custom_thresholds_are_respected() {
        let c = TimeComparator::from_config(&DeviationConfig {
            acceptable: 0.10,
            low: 0.30,
            moderate: 0.60,
        });
        // +30% is still Low under a 30% low threshold.
        assert_eq!(c.compare(&item(10.0), 13.0, 0.0).category, DeviationCategory::Low);
    }
}
