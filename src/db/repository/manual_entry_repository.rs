use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateManualTimeEntry, ManualTimeEntry};
use crate::error::{AppError, AppResult};

/// Repository for manual time entries.
///
/// Entries are append-only from the service's point of view; the single
/// mutation is `mark_synced_for_work_item` after a confirmed apply.
pub struct ManualEntryRepository;

impl ManualEntryRepository {
    pub async fn create(
        pool: &SqlitePool,
        entry: CreateManualTimeEntry,
    ) -> AppResult<ManualTimeEntry> {
        entry.validate()?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, ManualTimeEntry>(
            r#"
            INSERT INTO manual_time_entries (
                id, work_item_id, entry_date, hours, description,
                submitted_by, synced, synced_at, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, 0, NULL, ?)
            RETURNING
                id, work_item_id, entry_date, hours, description,
                submitted_by, synced, synced_at, created_at
            "#,
        )
        .bind(id)
        .bind(entry.work_item_id)
        .bind(entry.entry_date)
        .bind(entry.hours)
        .bind(entry.description)
        .bind(entry.submitted_by)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn list(
        pool: &SqlitePool,
        work_item_id: Option<i64>,
        unsynced_only: bool,
    ) -> AppResult<Vec<ManualTimeEntry>> {
        let mut sql = String::from(
            r#"
            SELECT id, work_item_id, entry_date, hours, description,
                   submitted_by, synced, synced_at, created_at
            FROM manual_time_entries
            WHERE 1 = 1
            "#,
        );
        if work_item_id.is_some() {
            sql.push_str(" AND work_item_id = ?");
        }
        if unsynced_only {
            sql.push_str(" AND synced = 0");
        }
        sql.push_str(" ORDER BY entry_date ASC, created_at ASC");

        let mut query = sqlx::query_as::<_, ManualTimeEntry>(&sql);
        if let Some(id) = work_item_id {
            query = query.bind(id);
        }

        let rows = query.fetch_all(pool).await.map_err(AppError::Database)?;
        Ok(rows)
    }

    pub async fn list_all(pool: &SqlitePool) -> AppResult<Vec<ManualTimeEntry>> {
        Self::list(pool, None, false).await
    }

    /// Flip the synced flag for every unsynced entry of a work item.
    /// Returns how many entries were marked.
    pub async fn mark_synced_for_work_item(
        pool: &SqlitePool,
        work_item_id: i64,
    ) -> AppResult<u64> {
        let now = Utc::now().naive_utc();

        let result = sqlx::query(
            r#"
            UPDATE manual_time_entries
            SET synced = 1, synced_at = ?
            WHERE work_item_id = ? AND synced = 0
            "#,
        )
        .bind(now)
        .bind(work_item_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::NaiveDate;

    fn sample(work_item_id: i64, hours: f64) -> CreateManualTimeEntry {
        CreateManualTimeEntry {
            work_item_id,
            entry_date: NaiveDate::from_ymd_opt(2025, 3, 4).unwrap(),
            hours,
            description: "spike investigation".to_string(),
            submitted_by: "dev@example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn create_and_list() {
        let pool = test_pool().await;

        ManualEntryRepository::create(&pool, sample(101, 1.5))
            .await
            .unwrap();
        ManualEntryRepository::create(&pool, sample(102, 2.0))
            .await
            .unwrap();

        let all = ManualEntryRepository::list_all(&pool).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_101 = ManualEntryRepository::list(&pool, Some(101), false)
            .await
            .unwrap();
        assert_eq!(only_101.len(), 1);
        assert_eq!(only_101[0].hours, 1.5);
        assert!(!only_101[0].synced);
    }

    #[tokio::test]
    async fn create_rejects_invalid_entries() {
        let pool = test_pool().await;
        let err = ManualEntryRepository::create(&pool, sample(101, -1.0)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn mark_synced_only_touches_unsynced_rows_of_the_item() {
        let pool = test_pool().await;
        ManualEntryRepository::create(&pool, sample(101, 1.0))
            .await
            .unwrap();
        ManualEntryRepository::create(&pool, sample(101, 2.0))
            .await
            .unwrap();
        ManualEntryRepository::create(&pool, sample(102, 3.0))
            .await
            .unwrap();

        let marked = ManualEntryRepository::mark_synced_for_work_item(&pool, 101)
            .await
            .unwrap();
        assert_eq!(marked, 2);

        // Second pass has nothing left to mark.
        let marked = ManualEntryRepository::mark_synced_for_work_item(&pool, 101)
            .await
            .unwrap();
        assert_eq!(marked, 0);

        let unsynced = ManualEntryRepository::list(&pool, None, true).await.unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].work_item_id, 102);
    }
}
