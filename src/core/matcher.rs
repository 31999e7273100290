use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::MatchingConfig;
use crate::core::{MeetingRecord, WorkItem};
use crate::db::models::ManualTimeEntry;
use crate::error::{AppError, AppResult};

/// Which rule produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchBasis {
    ManualOverride,
    TagMatch,
    AttendeeMatch,
    TitleMatch,
}

impl MatchBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchBasis::ManualOverride => "manual_override",
            MatchBasis::TagMatch => "tag_match",
            MatchBasis::AttendeeMatch => "attendee_match",
            MatchBasis::TitleMatch => "title_match",
        }
    }
}

/// Tagged match outcome. Downstream consumers must handle `Unmatched`
/// explicitly; there is no nullable work-item reference to forget about.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched { work_item_id: i64, basis: MatchBasis },
    Unmatched,
}

/// The record a match result refers to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordRef {
    Meeting { id: String, subject: String },
    ManualEntry { id: String, work_item_id: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub record: RecordRef,
    pub hours: f64,
    pub outcome: MatchOutcome,
}

/// Result of matching one run's records. Cancelled and zero-duration
/// meetings never reach the rules; they are counted here so the report can
/// surface them instead of dropping them silently.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchBatch {
    pub results: Vec<MatchResult>,
    pub excluded_meetings: usize,
}

impl MatchBatch {
    pub fn matched(&self) -> impl Iterator<Item = &MatchResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, MatchOutcome::Matched { .. }))
    }

    pub fn unmatched(&self) -> impl Iterator<Item = &MatchResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, MatchOutcome::Unmatched))
    }
}

/// Deterministic matcher from meeting/entry records to work items.
///
/// Rules run in fixed priority order: operator override patterns, exact
/// tag-in-subject, attendee overlap, fuzzy title similarity. The first rule
/// that produces a candidate wins; within a rule the most recently changed
/// work item wins, ties broken by lowest id.
pub struct MeetingMatcher {
    overrides: Vec<(Regex, i64)>,
    attendee_overlap_threshold: f64,
    title_similarity_threshold: f64,
}

impl MeetingMatcher {
    pub fn from_config(cfg: &MatchingConfig) -> AppResult<Self> {
        let mut overrides = Vec::with_capacity(cfg.override_rules.len());
        for rule in &cfg.override_rules {
            let re = Regex::new(&rule.pattern).map_err(|e| {
                AppError::Config(format!("invalid override pattern '{}': {}", rule.pattern, e))
            })?;
            overrides.push((re, rule.work_item_id));
        }
        Ok(MeetingMatcher {
            overrides,
            attendee_overlap_threshold: cfg.attendee_overlap_threshold,
            title_similarity_threshold: cfg.title_similarity_threshold,
        })
    }

    /// Match every usable record. Pure: no side effects, absence of a match
    /// is a valid outcome.
    pub fn match_records(
        &self,
        meetings: &[MeetingRecord],
        entries: &[ManualTimeEntry],
        work_items: &[WorkItem],
    ) -> MatchBatch {
        let mut batch = MatchBatch::default();
        let known_ids: HashSet<i64> = work_items.iter().map(|w| w.id).collect();

        for meeting in meetings {
            if meeting.is_cancelled || meeting.duration_hours() <= 0.0 {
                batch.excluded_meetings += 1;
                continue;
            }

            let outcome = self.match_meeting(meeting, work_items);
            if let MatchOutcome::Matched { work_item_id, basis } = &outcome {
                tracing::debug!(
                    meeting_id = %meeting.id,
                    work_item_id,
                    basis = basis.as_str(),
                    "matched meeting '{}'",
                    meeting.subject
                );
            }
            batch.results.push(MatchResult {
                record: RecordRef::Meeting {
                    id: meeting.id.clone(),
                    subject: meeting.subject.clone(),
                },
                hours: meeting.duration_hours(),
                outcome,
            });
        }

        for entry in entries {
            // Entries carry an explicit work-item reference; one pointing
            // outside the run's scope surfaces as unmatched.
            let outcome = if known_ids.contains(&entry.work_item_id) {
                MatchOutcome::Matched {
                    work_item_id: entry.work_item_id,
                    basis: MatchBasis::ManualOverride,
                }
            } else {
                MatchOutcome::Unmatched
            };
            batch.results.push(MatchResult {
                record: RecordRef::ManualEntry {
                    id: entry.id.clone(),
                    work_item_id: entry.work_item_id,
                },
                hours: entry.hours,
                outcome,
            });
        }

        tracing::info!(
            matched = batch.matched().count(),
            unmatched = batch.unmatched().count(),
            excluded = batch.excluded_meetings,
            "matching complete"
        );

        batch
    }

    fn match_meeting(&self, meeting: &MeetingRecord, work_items: &[WorkItem]) -> MatchOutcome {
        if let Some(id) = self.match_by_override(meeting, work_items) {
            return MatchOutcome::Matched {
                work_item_id: id,
                basis: MatchBasis::ManualOverride,
            };
        }
        if let Some(id) = self.match_by_tag(meeting, work_items) {
            return MatchOutcome::Matched {
                work_item_id: id,
                basis: MatchBasis::TagMatch,
            };
        }
        if let Some(id) = self.match_by_attendees(meeting, work_items) {
            return MatchOutcome::Matched {
                work_item_id: id,
                basis: MatchBasis::AttendeeMatch,
            };
        }
        if let Some(id) = self.match_by_title(meeting, work_items) {
            return MatchOutcome::Matched {
                work_item_id: id,
                basis: MatchBasis::TitleMatch,
            };
        }
        MatchOutcome::Unmatched
    }

    fn match_by_override(&self, meeting: &MeetingRecord, work_items: &[WorkItem]) -> Option<i64> {
        for (re, work_item_id) in &self.overrides {
            if re.is_match(&meeting.subject) && work_items.iter().any(|w| w.id == *work_item_id) {
                return Some(*work_item_id);
            }
        }
        None
    }

    fn match_by_tag(&self, meeting: &MeetingRecord, work_items: &[WorkItem]) -> Option<i64> {
        let subject = meeting.subject.to_lowercase();
        let candidates: Vec<&WorkItem> = work_items
            .iter()
            .filter(|w| {
                w.tags
                    .iter()
                    .any(|t| !t.trim().is_empty() && subject.contains(&t.trim().to_lowercase()))
            })
            .collect();
        best_candidate(&candidates)
    }

    fn match_by_attendees(&self, meeting: &MeetingRecord, work_items: &[WorkItem]) -> Option<i64> {
        if meeting.attendees.is_empty() && meeting.organizer.is_empty() {
            return None;
        }
        // The organizer is in the room too.
        let mut attendees: HashSet<String> =
            meeting.attendees.iter().map(|a| a.to_lowercase()).collect();
        if !meeting.organizer.is_empty() {
            attendees.insert(meeting.organizer.to_lowercase());
        }

        let candidates: Vec<&WorkItem> = work_items
            .iter()
            .filter(|w| {
                if w.team.is_empty() {
                    return false;
                }
                let hits = w
                    .team
                    .iter()
                    .filter(|member| attendees.contains(&member.to_lowercase()))
                    .count();
                hits as f64 / w.team.len() as f64 >= self.attendee_overlap_threshold
            })
            .collect();
        best_candidate(&candidates)
    }

    fn match_by_title(&self, meeting: &MeetingRecord, work_items: &[WorkItem]) -> Option<i64> {
        let subject = meeting.subject.to_lowercase();
        if subject.trim().is_empty() {
            return None;
        }
        let candidates: Vec<&WorkItem> = work_items
            .iter()
            .filter(|w| {
                title_similarity(&subject, &w.title.to_lowercase())
                    >= self.title_similarity_threshold
            })
            .collect();
        best_candidate(&candidates)
    }
}

/// Pick one work item from a rule's candidates: most recently changed wins,
/// ties broken by lowest id for determinism.
fn best_candidate(candidates: &[&WorkItem]) -> Option<i64> {
    candidates
        .iter()
        .max_by(|a, b| {
            a.changed_at
                .cmp(&b.changed_at)
                .then_with(|| b.id.cmp(&a.id))
        })
        .map(|w| w.id)
}

/// Bigram Dice similarity between two strings (0.0 to 1.0).
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a_grams = bigrams(a);
    let b_grams = bigrams(b);
    if a_grams.is_empty() || b_grams.is_empty() {
        return if a == b { 1.0 } else { 0.0 };
    }
    let overlap = a_grams.intersection(&b_grams).count();
    (2.0 * overlap as f64) / (a_grams.len() + b_grams.len()) as f64
}

fn bigrams(s: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = s.chars().filter(|c| !c.is_whitespace()).collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}
