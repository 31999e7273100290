use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::{OverlapPolicy, SchedulerConfig};
use crate::core::orchestrator::RunDriver;
use crate::core::report::TriggerKind;
use crate::error::{AppError, AppResult};

/// One entry in the bounded run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Missing when the run aborted before a run id existed.
    pub run_id: Option<String>,
    pub trigger: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: String,
    pub error: Option<String>,
    pub succeeded: usize,
    pub skipped: usize,
    pub conflicted: usize,
    pub failed: usize,
}

/// What happened to a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerDecision {
    Started,
    Queued,
    Dropped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerHealth {
    pub status: String,
    pub run_active: bool,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_run: Option<ExecutionRecord>,
    pub runs_recorded: usize,
}

struct SchedulerInner {
    driver: Arc<dyn RunDriver>,
    cron: Option<Schedule>,
    interval: Option<Duration>,
    overlap_policy: OverlapPolicy,
    history_capacity: usize,
    run_active: AtomicBool,
    queued: Mutex<Option<TriggerKind>>,
    paused: AtomicBool,
    history: RwLock<VecDeque<ExecutionRecord>>,
}

/// Triggers reconciliation runs on a cron expression, a fixed interval, or
/// on demand, and guarantees at most one run is active at a time. A trigger
/// firing mid-run is queued for immediately-after execution or dropped with
/// a warning, per configuration; concurrent runs would race on the same
/// checkpoint and are never allowed.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(cfg: &SchedulerConfig, driver: Arc<dyn RunDriver>) -> AppResult<Scheduler> {
        let cron = match &cfg.cron {
            Some(expr) => Some(Schedule::from_str(expr).map_err(|e| {
                AppError::Config(format!("invalid cron expression '{}': {}", expr, e))
            })?),
            None => None,
        };
        let interval = cfg.interval_minutes.map(|m| Duration::from_secs(m * 60));

        Ok(Scheduler {
            inner: Arc::new(SchedulerInner {
                driver,
                cron,
                interval,
                overlap_policy: cfg.overlap_policy,
                history_capacity: cfg.history_capacity.max(1),
                run_active: AtomicBool::new(false),
                queued: Mutex::new(None),
                paused: AtomicBool::new(false),
                history: RwLock::new(VecDeque::new()),
            }),
        })
    }

    /// Handle one trigger. Returns immediately; the run itself executes on a
    /// spawned task. This is the single writer of the run-in-progress flag.
    pub async fn trigger(&self, kind: TriggerKind) -> TriggerDecision {
        if self
            .inner
            .run_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return match self.inner.overlap_policy {
                OverlapPolicy::Queue => {
                    tracing::info!(
                        "scheduler: {} trigger queued behind the active run",
                        kind.as_str()
                    );
                    *self.inner.queued.lock().unwrap() = Some(kind);
                    TriggerDecision::Queued
                }
                OverlapPolicy::Drop => {
                    tracing::warn!(
                        "scheduler: dropping {} trigger, a run is already active",
                        kind.as_str()
                    );
                    TriggerDecision::Dropped
                }
            };
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut next = Some(kind);
            while let Some(kind) = next {
                inner.run_once(kind).await;
                next = inner.queued.lock().unwrap().take();
                if next.is_some() {
                    tracing::info!("scheduler: running queued trigger");
                }
            }
            inner.run_active.store(false, Ordering::SeqCst);
        });

        TriggerDecision::Started
    }

    /// Background worker evaluating the cron/interval trigger. On-demand
    /// triggers keep working while this loop is absent or paused.
    pub fn spawn(
        &self,
        shutdown: tokio::sync::broadcast::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        let mut shutdown_rx = shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                let Some((delay, kind)) = scheduler.next_fire() else {
                    tracing::info!("scheduler: no cron or interval configured; on-demand only");
                    let _ = shutdown_rx.recv().await;
                    return;
                };

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("scheduler worker shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {
                        if scheduler.is_paused() {
                            tracing::debug!("scheduler: paused, skipping {} tick", kind.as_str());
                            continue;
                        }
                        scheduler.trigger(kind).await;
                    }
                }
            }
        })
    }

    fn next_fire(&self) -> Option<(Duration, TriggerKind)> {
        if let Some(schedule) = &self.inner.cron {
            let next = schedule.upcoming(Utc).next()?;
            let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            return Some((delay, TriggerKind::Cron));
        }
        if let Some(interval) = self.inner.interval {
            return Some((interval, TriggerKind::Interval));
        }
        None
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        tracing::info!("scheduler paused");
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        tracing::info!("scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_run_active(&self) -> bool {
        self.inner.run_active.load(Ordering::SeqCst)
    }

    /// Most-recent-first execution history.
    pub async fn history(&self) -> Vec<ExecutionRecord> {
        self.inner.history.read().await.iter().cloned().collect()
    }

    pub async fn health(&self) -> SchedulerHealth {
        let history = self.inner.history.read().await;
        let next_fire_at = self.next_fire().map(|(delay, _)| {
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
        });

        SchedulerHealth {
            status: if self.is_paused() { "paused" } else { "up" }.to_string(),
            run_active: self.is_run_active(),
            next_fire_at,
            last_run: history.front().cloned(),
            runs_recorded: history.len(),
        }
    }
}

impl SchedulerInner {
    async fn run_once(&self, kind: TriggerKind) {
        let started_at = Utc::now();
        tracing::info!("scheduler: starting {} run", kind.as_str());

        let record = match self.driver.execute(kind).await {
            Ok(report) => ExecutionRecord {
                run_id: Some(report.run_id.clone()),
                trigger: kind,
                started_at,
                finished_at: Utc::now(),
                outcome: report.outcome().as_str().to_string(),
                error: (!report.failed.is_empty())
                    .then(|| format!("{} work items failed", report.failed.len())),
                succeeded: report.succeeded.len(),
                skipped: report.skipped.len(),
                conflicted: report.conflicted.len(),
                failed: report.failed.len(),
            },
            Err(e) => {
                tracing::error!("scheduler: run aborted: {}", e);
                ExecutionRecord {
                    run_id: None,
                    trigger: kind,
                    started_at,
                    finished_at: Utc::now(),
                    outcome: "failed".to_string(),
                    error: Some(e.to_string()),
                    succeeded: 0,
                    skipped: 0,
                    conflicted: 0,
                    failed: 0,
                }
            }
        };

        let mut history = self.history.write().await;
        history.push_front(record);
        history.truncate(self.history_capacity);
    }
}
