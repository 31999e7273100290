use std::collections::HashSet;

use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::models::{AppliedUpdate, Checkpoint, RunStage};
use crate::error::{AppError, AppResult};

/// Repository for run checkpoints and their applied sets.
///
/// Mutations are keyed by run id (checkpoints) or (run id, work item id)
/// (applied set) and are last-writer-wins per key; only one run per schedule
/// is ever active, so this is sufficient.
pub struct CheckpointRepository;

impl CheckpointRepository {
    pub async fn create(
        pool: &SqlitePool,
        run_id: &str,
        trigger_kind: &str,
    ) -> AppResult<Checkpoint> {
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, Checkpoint>(
            r#"
            INSERT INTO checkpoints (run_id, stage, trigger_kind, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING run_id, stage, trigger_kind, created_at, updated_at
            "#,
        )
        .bind(run_id)
        .bind(RunStage::Fetching.as_str())
        .bind(trigger_kind)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    #[allow(dead_code)]
    pub async fn find(pool: &SqlitePool, run_id: &str) -> AppResult<Option<Checkpoint>> {
        let row = sqlx::query_as::<_, Checkpoint>(
            r#"
            SELECT run_id, stage, trigger_kind, created_at, updated_at
            FROM checkpoints
            WHERE run_id = ?
            "#,
        )
        .bind(run_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Most recent checkpoint that has not completed. Completed runs delete
    /// their checkpoint, so anything still here (including `failed`) is a
    /// candidate for resume.
    pub async fn find_resumable(pool: &SqlitePool) -> AppResult<Option<Checkpoint>> {
        let row = sqlx::query_as::<_, Checkpoint>(
            r#"
            SELECT run_id, stage, trigger_kind, created_at, updated_at
            FROM checkpoints
            WHERE stage != 'done'
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn set_stage(pool: &SqlitePool, run_id: &str, stage: RunStage) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            UPDATE checkpoints SET stage = ?, updated_at = ? WHERE run_id = ?
            "#,
        )
        .bind(stage.as_str())
        .bind(now)
        .bind(run_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Durably record that a work item's patch was confirmed by the external
    /// service. Must complete before the orchestrator treats the item as done.
    pub async fn mark_applied(
        pool: &SqlitePool,
        run_id: &str,
        work_item_id: i64,
        applied_hours: f64,
    ) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            INSERT INTO checkpoint_applied (run_id, work_item_id, applied_hours, applied_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (run_id, work_item_id)
            DO UPDATE SET applied_hours = excluded.applied_hours, applied_at = excluded.applied_at
            "#,
        )
        .bind(run_id)
        .bind(work_item_id)
        .bind(applied_hours)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn applied_set(pool: &SqlitePool, run_id: &str) -> AppResult<HashSet<i64>> {
        let rows = sqlx::query_as::<_, AppliedUpdate>(
            r#"
            SELECT run_id, work_item_id, applied_hours, applied_at
            FROM checkpoint_applied
            WHERE run_id = ?
            "#,
        )
        .bind(run_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows.into_iter().map(|r| r.work_item_id).collect())
    }

    /// Remove a completed run's checkpoint and applied set.
    pub async fn delete(pool: &SqlitePool, run_id: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM checkpoint_applied WHERE run_id = ?")
            .bind(run_id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        sqlx::query("DELETE FROM checkpoints WHERE run_id = ?")
            .bind(run_id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }
}
