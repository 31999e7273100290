use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rand::Rng;
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::{ApplyConfig, Config, RetryConfig};
use crate::core::comparator::TimeComparator;
use crate::core::matcher::{MatchOutcome, MeetingMatcher, RecordRef};
use crate::core::report::{
    AppliedItem, FailedItem, ReportTotals, RunReport, SkipReason, SkippedItem, TriggerKind,
};
use crate::core::resolver::{self, ApplyDecision, Conflict, ConflictStrategy};
use crate::core::{MeetingRecord, WorkItem};
use crate::db::repository::{CheckpointRepository, ManualEntryRepository};
use crate::db::models::RunStage;
use crate::error::{AppError, AppResult};

// ============================================================================
// Collaborator seams
// ============================================================================

/// Calendar collaborator: list events for one user in [start, end).
#[async_trait]
pub trait CalendarSource: Send + Sync {
    async fn list_meetings(
        &self,
        user: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<MeetingRecord>>;
}

/// Work-item collaborator: scope query plus an idempotent effort patch.
#[async_trait]
pub trait WorkItemSource: Send + Sync {
    async fn list_work_items(&self) -> AppResult<Vec<WorkItem>>;

    async fn update_completed_work(
        &self,
        work_item_id: i64,
        hours: f64,
        comment: &str,
    ) -> AppResult<()>;
}

/// Injected sleep so retry/backoff is deterministic under test.
#[async_trait]
pub trait Sleep: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleep;

#[async_trait]
impl Sleep for TokioSleep {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Driving seam for the scheduler.
#[async_trait]
pub trait RunDriver: Send + Sync {
    async fn execute(&self, trigger: TriggerKind) -> AppResult<RunReport>;
}

// ============================================================================
// Checkpoint store
// ============================================================================

#[derive(Debug, Clone)]
pub struct ResumableRun {
    pub run_id: String,
    pub stage: RunStage,
}

/// Durable record of pipeline progress keyed by run id. The sqlite
/// implementation backs normal runs; dry runs get the in-memory one so they
/// are side-effect-free on external state by construction, not convention.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn find_resumable(&self) -> AppResult<Option<ResumableRun>>;
    async fn create(&self, run_id: &str, trigger: TriggerKind) -> AppResult<()>;
    async fn set_stage(&self, run_id: &str, stage: RunStage) -> AppResult<()>;
    async fn mark_applied(&self, run_id: &str, work_item_id: i64, hours: f64) -> AppResult<()>;
    async fn applied_set(&self, run_id: &str) -> AppResult<HashSet<i64>>;
    async fn remove(&self, run_id: &str) -> AppResult<()>;
}

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteCheckpointStore { pool }
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn find_resumable(&self) -> AppResult<Option<ResumableRun>> {
        let row = CheckpointRepository::find_resumable(&self.pool).await?;
        Ok(row.and_then(|cp| {
            cp.stage().map(|stage| ResumableRun {
                run_id: cp.run_id,
                stage,
            })
        }))
    }

    async fn create(&self, run_id: &str, trigger: TriggerKind) -> AppResult<()> {
        CheckpointRepository::create(&self.pool, run_id, trigger.as_str()).await?;
        Ok(())
    }

    async fn set_stage(&self, run_id: &str, stage: RunStage) -> AppResult<()> {
        CheckpointRepository::set_stage(&self.pool, run_id, stage).await
    }

    async fn mark_applied(&self, run_id: &str, work_item_id: i64, hours: f64) -> AppResult<()> {
        CheckpointRepository::mark_applied(&self.pool, run_id, work_item_id, hours).await
    }

    async fn applied_set(&self, run_id: &str) -> AppResult<HashSet<i64>> {
        CheckpointRepository::applied_set(&self.pool, run_id).await
    }

    async fn remove(&self, run_id: &str) -> AppResult<()> {
        CheckpointRepository::delete(&self.pool, run_id).await
    }
}

#[derive(Default)]
struct MemoryRun {
    stage: Option<RunStage>,
    applied: HashMap<i64, f64>,
}

/// In-memory checkpoint marker for dry runs and tests.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    runs: Mutex<HashMap<String, MemoryRun>>,
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn find_resumable(&self) -> AppResult<Option<ResumableRun>> {
        let runs = self.runs.lock().unwrap();
        Ok(runs
            .iter()
            .find(|(_, run)| run.stage != Some(RunStage::Done))
            .map(|(run_id, run)| ResumableRun {
                run_id: run_id.clone(),
                stage: run.stage.unwrap_or(RunStage::Fetching),
            }))
    }

    async fn create(&self, run_id: &str, _trigger: TriggerKind) -> AppResult<()> {
        let mut runs = self.runs.lock().unwrap();
        runs.insert(
            run_id.to_string(),
            MemoryRun {
                stage: Some(RunStage::Fetching),
                applied: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn set_stage(&self, run_id: &str, stage: RunStage) -> AppResult<()> {
        let mut runs = self.runs.lock().unwrap();
        if let Some(run) = runs.get_mut(run_id) {
            run.stage = Some(stage);
        }
        Ok(())
    }

    async fn mark_applied(&self, run_id: &str, work_item_id: i64, hours: f64) -> AppResult<()> {
        let mut runs = self.runs.lock().unwrap();
        if let Some(run) = runs.get_mut(run_id) {
            run.applied.insert(work_item_id, hours);
        }
        Ok(())
    }

    async fn applied_set(&self, run_id: &str) -> AppResult<HashSet<i64>> {
        let runs = self.runs.lock().unwrap();
        Ok(runs
            .get(run_id)
            .map(|r| r.applied.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn remove(&self, run_id: &str) -> AppResult<()> {
        self.runs.lock().unwrap().remove(run_id);
        Ok(())
    }
}

// ============================================================================
// Run handles shared with the HTTP surface
// ============================================================================

/// Cross-cutting handles for the active run: the latest finished report and
/// the cooperative cancellation flag. Cancellation takes effect between
/// work-item apply steps, never mid-write.
#[derive(Clone)]
pub struct RunHandles {
    pub last_report: Arc<RwLock<Option<RunReport>>>,
    pub cancel: Arc<AtomicBool>,
}

impl RunHandles {
    pub fn new() -> Self {
        RunHandles {
            last_report: Arc::new(RwLock::new(None)),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub async fn latest_report(&self) -> Option<RunReport> {
        self.last_report.read().await.clone()
    }
}

impl Default for RunHandles {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Delay before retrying `attempt` (1-based): capped exponential plus jitter.
pub(crate) fn backoff_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
    let mut delay = cfg.initial_backoff_ms as u128;
    for _ in 1..attempt {
        delay = delay.saturating_mul(2);
        if delay >= cfg.max_backoff_ms as u128 {
            delay = cfg.max_backoff_ms as u128;
            break;
        }
    }
    let base = delay.min(cfg.max_backoff_ms as u128) as u64;

    let jitter_max = (base as f64 * cfg.jitter_fraction) as u64;
    let jitter = if jitter_max > 0 {
        rand::thread_rng().gen_range(0..=jitter_max)
    } else {
        0
    };

    Duration::from_millis(base + jitter)
}

// ============================================================================
// Orchestrator
// ============================================================================

struct ApplyPlan {
    work_item_id: i64,
    hours: f64,
}

enum ApplyResult {
    Applied { work_item_id: i64, hours: f64, attempts: u32 },
    Skipped { work_item_id: i64, reason: SkipReason },
    Failed { work_item_id: i64, error: String, attempts: u32 },
}

/// Coordinates one end-to-end reconciliation run:
/// fetch -> match -> compare -> resolve -> apply -> report.
///
/// All run state lives in locals of `execute`; the only durable artifacts
/// are the checkpoint and the manual-entry synced flags.
pub struct Orchestrator {
    calendar: Arc<dyn CalendarSource>,
    work_items: Arc<dyn WorkItemSource>,
    pool: SqlitePool,
    checkpoints: Arc<dyn CheckpointStore>,
    matcher: MeetingMatcher,
    comparator: TimeComparator,
    strategy: ConflictStrategy,
    retry: RetryConfig,
    apply: ApplyConfig,
    users: Vec<String>,
    lookback_days: i64,
    sleeper: Arc<dyn Sleep>,
    handles: RunHandles,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        pool: SqlitePool,
        calendar: Arc<dyn CalendarSource>,
        work_items: Arc<dyn WorkItemSource>,
        sleeper: Arc<dyn Sleep>,
        handles: RunHandles,
    ) -> AppResult<Self> {
        let matcher = MeetingMatcher::from_config(&config.matching)?;
        let comparator = TimeComparator::from_config(&config.deviation);
        let checkpoints: Arc<dyn CheckpointStore> =
            Arc::new(SqliteCheckpointStore::new(pool.clone()));

        Ok(Orchestrator {
            calendar,
            work_items,
            pool,
            checkpoints,
            matcher,
            comparator,
            strategy: config.conflict.strategy,
            retry: config.retry.clone(),
            apply: config.apply.clone(),
            users: config.graph.users.clone(),
            lookback_days: config.graph.lookback_days,
            sleeper,
            handles,
        })
    }

    /// Run the pipeline once. Returns the report even for runs that end with
    /// per-item failures; only fatal errors surface as `Err`.
    pub async fn execute(&self, trigger: TriggerKind) -> AppResult<RunReport> {
        self.handles.cancel.store(false, Ordering::SeqCst);
        let started_at = Utc::now();
        let dry_run = self.apply.dry_run;

        let store: Arc<dyn CheckpointStore> = if dry_run {
            Arc::new(MemoryCheckpointStore::default())
        } else {
            self.checkpoints.clone()
        };

        let (run_id, resumed, applied_before) = if dry_run {
            let run_id = Uuid::new_v4().to_string();
            store.create(&run_id, trigger).await?;
            (run_id, false, HashSet::new())
        } else {
            match store.find_resumable().await? {
                Some(prev) => {
                    let applied = store.applied_set(&prev.run_id).await?;
                    if prev.stage.is_terminal() {
                        tracing::info!(
                            "[{}] retrying failed run ({} items already applied)",
                            prev.run_id,
                            applied.len()
                        );
                    } else {
                        tracing::info!(
                            "[{}] resuming interrupted run from stage {} ({} items already applied)",
                            prev.run_id,
                            prev.stage.as_str(),
                            applied.len()
                        );
                    }
                    (prev.run_id, true, applied)
                }
                None => {
                    let run_id = Uuid::new_v4().to_string();
                    store.create(&run_id, trigger).await?;
                    (run_id, false, HashSet::new())
                }
            }
        };

        // -- Fetching ------------------------------------------------------
        self.transition(&store, &run_id, RunStage::Fetching).await?;

        let mut work_items = match self.work_items.list_work_items().await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!("[{}] work item fetch failed, aborting run: {}", run_id, e);
                return Err(e);
            }
        };
        let fetched = work_items.len();
        work_items.retain(|w| w.state != "Removed" && w.state != "Deleted");
        if work_items.len() < fetched {
            tracing::debug!(
                "[{}] dropped {} removed/deleted work items from scope",
                run_id,
                fetched - work_items.len()
            );
        }

        let meetings = self.fetch_meetings(&run_id).await?;

        // -- Matching ------------------------------------------------------
        self.transition(&store, &run_id, RunStage::Matching).await?;

        let entries = ManualEntryRepository::list_all(&self.pool).await?;
        let batch = self.matcher.match_records(&meetings, &entries, &work_items);

        // -- Comparing -----------------------------------------------------
        self.transition(&store, &run_id, RunStage::Comparing).await?;

        // (meeting hours, manual hours) per work item.
        let mut hours_by_item: HashMap<i64, (f64, f64)> = HashMap::new();
        for result in batch.matched() {
            if let MatchOutcome::Matched { work_item_id, .. } = result.outcome {
                let slot = hours_by_item.entry(work_item_id).or_insert((0.0, 0.0));
                match result.record {
                    RecordRef::Meeting { .. } => slot.0 += result.hours,
                    RecordRef::ManualEntry { .. } => slot.1 += result.hours,
                }
            }
        }

        let items_by_id: HashMap<i64, &WorkItem> =
            work_items.iter().map(|w| (w.id, w)).collect();

        let mut comparisons = Vec::new();
        for (&item_id, &(meeting_hours, manual_hours)) in &hours_by_item {
            if let Some(item) = items_by_id.get(&item_id).copied() {
                comparisons.push(self.comparator.compare(item, meeting_hours, manual_hours));
            }
        }
        comparisons.sort_by_key(|c| c.work_item_id);

        // -- Resolving -----------------------------------------------------
        self.transition(&store, &run_id, RunStage::Resolving).await?;

        let mut conflicts: Vec<Conflict> = Vec::new();
        let mut conflicted: Vec<Conflict> = Vec::new();
        let mut skipped: Vec<SkippedItem> = Vec::new();
        let mut plans: Vec<ApplyPlan> = Vec::new();

        for comparison in &comparisons {
            let item = items_by_id[&comparison.work_item_id];
            let resolution = resolver::resolve(
                item.id,
                item.completed_hours,
                comparison.real_hours,
                self.strategy,
            );

            if let Some(conflict) = &resolution.conflict {
                tracing::warn!(
                    "[{}] conflict on work item {}: stored {:.2}h vs computed {:.2}h ({})",
                    run_id,
                    conflict.work_item_id,
                    conflict.existing_hours,
                    conflict.computed_hours,
                    conflict.strategy.as_str()
                );
                conflicts.push(conflict.clone());
                if conflict.requires_review {
                    conflicted.push(conflict.clone());
                    continue;
                }
            }

            match resolution.decision {
                ApplyDecision::Write { hours } => plans.push(ApplyPlan {
                    work_item_id: item.id,
                    hours,
                }),
                ApplyDecision::NoWrite => skipped.push(SkippedItem {
                    work_item_id: item.id,
                    reason: SkipReason::StrategySkip,
                }),
            }
        }

        // Items in scope with no attributed effort still need a bucket.
        let bucketed: HashSet<i64> = hours_by_item.keys().copied().collect();
        for item in &work_items {
            if !bucketed.contains(&item.id) {
                skipped.push(SkippedItem {
                    work_item_id: item.id,
                    reason: SkipReason::NothingToApply,
                });
            }
        }

        // -- Applying ------------------------------------------------------
        self.transition(&store, &run_id, RunStage::Applying).await?;

        let mut succeeded: Vec<AppliedItem> = Vec::new();
        let mut failed: Vec<FailedItem> = Vec::new();

        if dry_run {
            for plan in &plans {
                tracing::info!(
                    "[{}] dry run: would set work item {} to {:.2}h",
                    run_id,
                    plan.work_item_id,
                    plan.hours
                );
                skipped.push(SkippedItem {
                    work_item_id: plan.work_item_id,
                    reason: SkipReason::DryRun,
                });
            }
        } else {
            let results = self.apply_plans(&run_id, plans, &applied_before, &store).await;
            for result in results {
                match result {
                    ApplyResult::Applied {
                        work_item_id,
                        hours,
                        attempts,
                    } => succeeded.push(AppliedItem {
                        work_item_id,
                        hours,
                        attempts,
                    }),
                    ApplyResult::Skipped {
                        work_item_id,
                        reason,
                    } => skipped.push(SkippedItem {
                        work_item_id,
                        reason,
                    }),
                    ApplyResult::Failed {
                        work_item_id,
                        error,
                        attempts,
                    } => failed.push(FailedItem {
                        work_item_id,
                        error,
                        attempts,
                    }),
                }
            }

            // Audit trail: entries attributed to an applied item are now
            // reflected in the external value.
            for item in succeeded
                .iter()
                .map(|a| a.work_item_id)
                .chain(skipped.iter().filter_map(|s| {
                    (s.reason == SkipReason::AlreadyApplied).then_some(s.work_item_id)
                }))
            {
                let marked =
                    ManualEntryRepository::mark_synced_for_work_item(&self.pool, item).await?;
                if marked > 0 {
                    tracing::debug!("[{}] marked {} entries synced for item {}", run_id, marked, item);
                }
            }
        }

        let cancelled = self.handles.cancel.load(Ordering::SeqCst);

        // -- Reporting -----------------------------------------------------
        if !cancelled {
            self.transition(&store, &run_id, RunStage::Reporting).await?;
        }

        let totals = ReportTotals {
            meetings_considered: meetings.len(),
            entries_considered: entries.len(),
            work_items_in_scope: work_items.len(),
            total_meeting_hours: hours_by_item.values().map(|(m, _)| m).sum(),
            total_manual_hours: hours_by_item.values().map(|(_, e)| e).sum(),
        };

        succeeded.sort_by_key(|i| i.work_item_id);
        skipped.sort_by_key(|i| i.work_item_id);
        failed.sort_by_key(|i| i.work_item_id);

        let report = RunReport {
            run_id: run_id.clone(),
            trigger,
            resumed,
            dry_run,
            started_at,
            finished_at: Utc::now(),
            succeeded,
            skipped,
            conflicted,
            failed,
            conflicts,
            comparisons,
            unmatched: batch.unmatched().cloned().collect(),
            excluded_meetings: batch.excluded_meetings,
            totals,
            cancelled,
        };

        if cancelled {
            tracing::warn!(
                "[{}] run cancelled between apply steps; checkpoint retained for resume",
                run_id
            );
        } else if report.failed.is_empty() {
            self.transition(&store, &run_id, RunStage::Done).await?;
            store.remove(&run_id).await?;
            tracing::info!("[{}] run complete: {}", run_id, report.summary());
        } else {
            self.transition(&store, &run_id, RunStage::Failed).await?;
            tracing::warn!(
                "[{}] run finished with failures: {}",
                run_id,
                report.summary()
            );
        }

        *self.handles.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    async fn transition(
        &self,
        store: &Arc<dyn CheckpointStore>,
        run_id: &str,
        stage: RunStage,
    ) -> AppResult<()> {
        store.set_stage(run_id, stage).await?;
        tracing::info!("[{}] stage -> {}", run_id, stage.as_str());
        Ok(())
    }

    /// Fetch every configured user's calendar concurrently. One user's
    /// failure is contained unless it signals bad credentials.
    async fn fetch_meetings(&self, run_id: &str) -> AppResult<Vec<MeetingRecord>> {
        let end = Utc::now();
        let start = end - chrono::Duration::days(self.lookback_days);

        let fetches = self.users.iter().map(|user| {
            let calendar = self.calendar.clone();
            async move { (user.clone(), calendar.list_meetings(user, start, end).await) }
        });

        let mut meetings = Vec::new();
        for (user, result) in futures::future::join_all(fetches).await {
            match result {
                Ok(mut user_meetings) => {
                    tracing::debug!(
                        "[{}] fetched {} meetings for {}",
                        run_id,
                        user_meetings.len(),
                        user
                    );
                    meetings.append(&mut user_meetings);
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!("[{}] calendar fetch for {} is fatal: {}", run_id, user, e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        "[{}] calendar fetch for {} failed, continuing without it: {}",
                        run_id,
                        user,
                        e
                    );
                }
            }
        }
        Ok(meetings)
    }

    /// Dispatch planned writes with bounded concurrency. Each item is
    /// serialized internally (retry loop), and a durable applied mark
    /// precedes moving on, which is what makes resume idempotent.
    async fn apply_plans(
        &self,
        run_id: &str,
        plans: Vec<ApplyPlan>,
        applied_before: &HashSet<i64>,
        store: &Arc<dyn CheckpointStore>,
    ) -> Vec<ApplyResult> {
        let abort = AtomicBool::new(false);
        let abort_ref = &abort;
        let cancel = &self.handles.cancel;

        stream::iter(plans.into_iter().map(|plan| {
            let store = store.clone();
            async move {
                let id = plan.work_item_id;

                if cancel.load(Ordering::SeqCst) {
                    return ApplyResult::Skipped {
                        work_item_id: id,
                        reason: SkipReason::Cancelled,
                    };
                }
                if abort_ref.load(Ordering::SeqCst) {
                    return ApplyResult::Skipped {
                        work_item_id: id,
                        reason: SkipReason::Aborted,
                    };
                }
                if applied_before.contains(&id) {
                    tracing::info!(
                        "[{}] work item {} already applied in an earlier attempt; skipping",
                        run_id,
                        id
                    );
                    return ApplyResult::Skipped {
                        work_item_id: id,
                        reason: SkipReason::AlreadyApplied,
                    };
                }

                match self.apply_one(run_id, id, plan.hours).await {
                    Ok(attempts) => {
                        if let Err(e) = store.mark_applied(run_id, id, plan.hours).await {
                            // The write landed but the durable mark did not;
                            // surface it as a failure so the run is retried.
                            tracing::error!(
                                "[{}] applied item {} but failed to checkpoint it: {}",
                                run_id,
                                id,
                                e
                            );
                            return ApplyResult::Failed {
                                work_item_id: id,
                                error: format!("checkpoint write failed: {}", e),
                                attempts,
                            };
                        }
                        ApplyResult::Applied {
                            work_item_id: id,
                            hours: plan.hours,
                            attempts,
                        }
                    }
                    Err((attempts, e)) => {
                        if self.apply.abort_on_first_failure {
                            abort_ref.store(true, Ordering::SeqCst);
                        }
                        tracing::error!(
                            "[{}] giving up on work item {} after {} attempts: {}",
                            run_id,
                            id,
                            attempts,
                            e
                        );
                        ApplyResult::Failed {
                            work_item_id: id,
                            error: e.to_string(),
                            attempts,
                        }
                    }
                }
            }
        }))
        .buffer_unordered(self.apply.concurrency.max(1))
        .collect()
        .await
    }

    /// Bounded retry loop for one work-item patch. Explicit loop, not
    /// exception-driven: transient errors sleep and try again, anything else
    /// escalates immediately.
    async fn apply_one(
        &self,
        run_id: &str,
        work_item_id: i64,
        hours: f64,
    ) -> Result<u32, (u32, AppError)> {
        let comment = format!(
            "Completed work set to {:.2}h by time-reconciler run {}",
            hours, run_id
        );
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .work_items
                .update_completed_work(work_item_id, hours, &comment)
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        "[{}] applied {:.2}h to work item {} (attempt {})",
                        run_id,
                        hours,
                        work_item_id,
                        attempt
                    );
                    return Ok(attempt);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = backoff_delay(&self.retry, attempt);
                    tracing::warn!(
                        "[{}] transient failure on work item {} (attempt {}): {}; retrying in {:?}",
                        run_id,
                        work_item_id,
                        attempt,
                        e,
                        delay
                    );
                    self.sleeper.sleep(delay).await;
                }
                Err(e) => return Err((attempt, e)),
            }
        }
    }
}

#[async_trait]
impl RunDriver for Orchestrator {
    async fn execute(&self, trigger: TriggerKind) -> AppResult<RunReport> {
        Orchestrator::execute(self, trigger).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::report::RunOutcome;
    use crate::db::models::CreateManualTimeEntry;
    use crate::db::test_pool;
    use chrono::{NaiveDate, TimeZone};

    struct StaticCalendar {
        meetings: Vec<MeetingRecord>,
    }

    #[async_trait]
    impl CalendarSource for StaticCalendar {
        async fn list_meetings(
            &self,
            _user: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> AppResult<Vec<MeetingRecord>> {
            Ok(self.meetings.clone())
        }
    }

    #[derive(Default)]
    struct MockWorkItems {
        items: Vec<WorkItem>,
        /// Remaining transient failures per item before writes succeed.
        transient_failures: Mutex<HashMap<i64, u32>>,
        /// Items whose writes always fail with a transient error.
        always_fail: HashSet<i64>,
        applied: Mutex<Vec<(i64, f64)>>,
    }

    #[async_trait]
    impl WorkItemSource for MockWorkItems {
        async fn list_work_items(&self) -> AppResult<Vec<WorkItem>> {
            Ok(self.items.clone())
        }

        async fn update_completed_work(
            &self,
            work_item_id: i64,
            hours: f64,
            _comment: &str,
        ) -> AppResult<()> {
            let transient = AppError::WorkItemApi {
                status: 503,
                message: "service busy".to_string(),
            };
            if self.always_fail.contains(&work_item_id) {
                return Err(transient);
            }
            {
                let mut failures = self.transient_failures.lock().unwrap();
                if let Some(remaining) = failures.get_mut(&work_item_id) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(transient);
                    }
                }
            }
            self.applied.lock().unwrap().push((work_item_id, hours));
            Ok(())
        }
    }

    struct NoopSleep;

    #[async_trait]
    impl Sleep for NoopSleep {
        async fn sleep(&self, _duration: Duration) {}
    }

    fn meeting(id: &str, subject: &str, hours: i64) -> MeetingRecord {
        let start = Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap();
        MeetingRecord {
            id: id.to_string(),
            subject: subject.to_string(),
            organizer: "lead@example.com".to_string(),
            start,
            end: start + chrono::Duration::hours(hours),
            attendees: vec![],
            is_cancelled: false,
        }
    }

    fn work_item(id: i64, tag: &str, estimated: f64, completed: Option<f64>) -> WorkItem {
        WorkItem {
            id,
            title: format!("Item {}", id),
            tags: vec![tag.to_string()],
            team: vec![],
            estimated_hours: estimated,
            completed_hours: completed,
            changed_at: Some(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()),
            state: "Active".to_string(),
        }
    }

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.graph.users = vec!["dev@example.com".to_string()];
        cfg.conflict.strategy = ConflictStrategy::Override;
        cfg
    }

    async fn orchestrator_with(
        cfg: Config,
        pool: SqlitePool,
        calendar: StaticCalendar,
        work_items: Arc<MockWorkItems>,
    ) -> Orchestrator {
        Orchestrator::new(
            &cfg,
            pool,
            Arc::new(calendar),
            work_items,
            Arc::new(NoopSleep),
            RunHandles::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn full_run_applies_matched_hours_and_cleans_up() {
        let pool = test_pool().await;
        let source = Arc::new(MockWorkItems {
            items: vec![work_item(101, "payments", 8.0, None)],
            ..Default::default()
        });
        // 6h of meetings plus a 1.5h manual entry: 7.5h applied.
        ManualEntryRepository::create(
            &pool,
            CreateManualTimeEntry {
                work_item_id: 101,
                entry_date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
                hours: 1.5,
                description: "follow-up work".to_string(),
                submitted_by: "dev@example.com".to_string(),
            },
        )
        .await
        .unwrap();

        let orchestrator = orchestrator_with(
            test_config(),
            pool.clone(),
            StaticCalendar {
                meetings: vec![
                    meeting("m1", "payments review", 4),
                    meeting("m2", "payments deep dive", 2),
                ],
            },
            source.clone(),
        )
        .await;

        let report = orchestrator.execute(TriggerKind::OnDemand).await.unwrap();

        assert_eq!(report.outcome(), RunOutcome::Succeeded);
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.succeeded[0].work_item_id, 101);
        assert!((report.succeeded[0].hours - 7.5).abs() < 1e-9);

        let applied = source.applied.lock().unwrap().clone();
        assert_eq!(applied, vec![(101, 7.5)]);

        // Completed runs delete their checkpoint...
        assert!(CheckpointRepository::find_resumable(&pool)
            .await
            .unwrap()
            .is_none());
        // ...and the contributing entry is marked synced.
        let unsynced = ManualEntryRepository::list(&pool, None, true).await.unwrap();
        assert!(unsynced.is_empty());
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let pool = test_pool().await;
        let source = Arc::new(MockWorkItems {
            items: vec![work_item(101, "payments", 8.0, None)],
            transient_failures: Mutex::new(HashMap::from([(101, 2)])),
            ..Default::default()
        });

        let orchestrator = orchestrator_with(
            test_config(),
            pool.clone(),
            StaticCalendar {
                meetings: vec![meeting("m1", "payments review", 6)],
            },
            source.clone(),
        )
        .await;

        let report = orchestrator.execute(TriggerKind::Cron).await.unwrap();

        // Failed on attempts 1 and 2, succeeded on 3; applied exactly once.
        assert_eq!(report.outcome(), RunOutcome::Succeeded);
        assert_eq!(report.succeeded[0].attempts, 3);
        assert_eq!(source.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_contain_the_failure() {
        let pool = test_pool().await;
        let source = Arc::new(MockWorkItems {
            items: vec![
                work_item(101, "payments", 8.0, None),
                work_item(102, "search", 4.0, None),
            ],
            always_fail: HashSet::from([101]),
            ..Default::default()
        });

        let orchestrator = orchestrator_with(
            test_config(),
            pool.clone(),
            StaticCalendar {
                meetings: vec![
                    meeting("m1", "payments review", 6),
                    meeting("m2", "search tuning", 3),
                ],
            },
            source.clone(),
        )
        .await;

        let report = orchestrator.execute(TriggerKind::Cron).await.unwrap();

        // The run is failed overall, but item 102's update is preserved.
        assert_eq!(report.outcome(), RunOutcome::Failed);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].work_item_id, 101);
        assert_eq!(report.failed[0].attempts, 3);
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.succeeded[0].work_item_id, 102);

        // Checkpoint remains for resume, marked failed.
        let cp = CheckpointRepository::find_resumable(&pool).await.unwrap();
        assert_eq!(cp.unwrap().stage(), Some(RunStage::Failed));
    }

    #[tokio::test]
    async fn resume_skips_items_already_in_the_applied_set() {
        let pool = test_pool().await;

        // A prior interrupted run already applied item 101.
        CheckpointRepository::create(&pool, "run-prior", "cron")
            .await
            .unwrap();
        CheckpointRepository::set_stage(&pool, "run-prior", RunStage::Applying)
            .await
            .unwrap();
        CheckpointRepository::mark_applied(&pool, "run-prior", 101, 6.0)
            .await
            .unwrap();

        let source = Arc::new(MockWorkItems {
            items: vec![
                work_item(101, "payments", 8.0, None),
                work_item(102, "search", 4.0, None),
            ],
            ..Default::default()
        });

        let orchestrator = orchestrator_with(
            test_config(),
            pool.clone(),
            StaticCalendar {
                meetings: vec![
                    meeting("m1", "payments review", 6),
                    meeting("m2", "search tuning", 3),
                ],
            },
            source.clone(),
        )
        .await;

        let report = orchestrator.execute(TriggerKind::Cron).await.unwrap();

        assert!(report.resumed);
        assert_eq!(report.run_id, "run-prior");

        // 101 was not re-applied; 102 was applied fresh.
        let applied = source.applied.lock().unwrap().clone();
        assert_eq!(applied, vec![(102, 3.0)]);
        assert!(report
            .skipped
            .iter()
            .any(|s| s.work_item_id == 101 && s.reason == SkipReason::AlreadyApplied));
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.outcome(), RunOutcome::Succeeded);

        // The resumed run completed, so its checkpoint is gone.
        assert!(CheckpointRepository::find(&pool, "run-prior")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn dry_run_writes_nothing_durable() {
        let pool = test_pool().await;
        let source = Arc::new(MockWorkItems {
            items: vec![work_item(101, "payments", 8.0, Some(2.0))],
            ..Default::default()
        });
        ManualEntryRepository::create(
            &pool,
            CreateManualTimeEntry {
                work_item_id: 101,
                entry_date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
                hours: 1.0,
                description: "prep".to_string(),
                submitted_by: "dev@example.com".to_string(),
            },
        )
        .await
        .unwrap();

        let mut cfg = test_config();
        cfg.apply.dry_run = true;

        let orchestrator = orchestrator_with(
            cfg,
            pool.clone(),
            StaticCalendar {
                meetings: vec![meeting("m1", "payments review", 6)],
            },
            source.clone(),
        )
        .await;

        let report = orchestrator.execute(TriggerKind::OnDemand).await.unwrap();

        assert!(report.dry_run);
        // Full report computed through resolving...
        assert_eq!(report.comparisons.len(), 1);
        assert_eq!(report.conflicts.len(), 1);
        assert!(report
            .skipped
            .iter()
            .any(|s| s.reason == SkipReason::DryRun));
        // ...but zero external writes, no durable checkpoint, no synced flags.
        assert!(source.applied.lock().unwrap().is_empty());
        assert!(CheckpointRepository::find_resumable(&pool)
            .await
            .unwrap()
            .is_none());
        let unsynced = ManualEntryRepository::list(&pool, None, true).await.unwrap();
        assert_eq!(unsynced.len(), 1);
    }

    #[tokio::test]
    async fn idle_items_and_unmatched_meetings_are_surfaced() {
        let pool = test_pool().await;
        let source = Arc::new(MockWorkItems {
            items: vec![
                work_item(101, "payments", 8.0, None),
                work_item(102, "search", 4.0, None),
            ],
            ..Default::default()
        });

        let orchestrator = orchestrator_with(
            test_config(),
            pool.clone(),
            StaticCalendar {
                meetings: vec![
                    meeting("m1", "payments review", 6),
                    meeting("m2", "company all hands", 1),
                ],
            },
            source.clone(),
        )
        .await;

        let report = orchestrator.execute(TriggerKind::Interval).await.unwrap();

        // Every item in scope lands in exactly one bucket.
        let bucketed = report.succeeded.len() + report.skipped.len() + report.failed.len();
        assert_eq!(bucketed, 2);
        assert!(report
            .skipped
            .iter()
            .any(|s| s.work_item_id == 102 && s.reason == SkipReason::NothingToApply));
        assert_eq!(report.unmatched.len(), 1);
    }

    #[tokio::test]
    async fn manual_review_conflicts_block_the_write() {
        let pool = test_pool().await;
        let source = Arc::new(MockWorkItems {
            items: vec![work_item(101, "payments", 8.0, Some(2.0))],
            ..Default::default()
        });

        let mut cfg = test_config();
        cfg.conflict.strategy = ConflictStrategy::ManualReview;

        let orchestrator = orchestrator_with(
            cfg,
            pool.clone(),
            StaticCalendar {
                meetings: vec![meeting("m1", "payments review", 6)],
            },
            source.clone(),
        )
        .await;

        let report = orchestrator.execute(TriggerKind::OnDemand).await.unwrap();

        assert_eq!(report.conflicted.len(), 1);
        assert!(report.conflicted[0].requires_review);
        assert!(source.applied.lock().unwrap().is_empty());
        // The run itself is not failed by a queued conflict.
        assert_eq!(report.outcome(), RunOutcome::Succeeded);
    }

    #[test]
    fn backoff_grows_exponentially_and_respects_the_cap() {
        let cfg = RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            jitter_fraction: 0.0,
        };
        assert_eq!(backoff_delay(&cfg, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&cfg, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&cfg, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&cfg, 5), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&cfg, 12), Duration::from_millis(1000));
    }

    #[test]
    fn backoff_jitter_stays_within_the_configured_fraction() {
        let cfg = RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10_000,
            jitter_fraction: 0.5,
        };
        for _ in 0..50 {
            let d = backoff_delay(&cfg, 1);
            assert!(d >= Duration::from_millis(1000));
            assert!(d <= Duration::from_millis(1500));
        }
    }
}
