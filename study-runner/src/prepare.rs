//! Backlog construction and its undo
//!
//! BUILD marks the scenarios a run will compute and returns them as the
//! backlog; RESTORE clears those marks again. Both run on background tasks
//! while the control loop keeps polling.

use async_trait::async_trait;
use sqlx::SqlitePool;
use study_types::{LockToken, StudyHandle, WorkItem};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, thiserror::Error, Clone)]
pub enum PrepareError {
    #[error("study build was cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for PrepareError {
    fn from(err: sqlx::Error) -> Self {
        PrepareError::Database(err.to_string())
    }
}

#[async_trait]
pub trait StudyPreparer: Send + Sync {
    /// Materialize the run under `lock` and return its backlog in claim order.
    async fn build(
        &self,
        study: &StudyHandle,
        lock: LockToken,
        cancel: &CancellationToken,
    ) -> Result<Vec<WorkItem>, PrepareError>;

    /// Undo whatever `build` materialized.
    async fn restore(&self, study: &StudyHandle) -> Result<(), PrepareError>;
}

/// Backlog from the `study_scenarios` table; cost is the source count.
#[derive(Debug, Clone)]
pub struct SqlitePreparer {
    pool: SqlitePool,
}

impl SqlitePreparer {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StudyPreparer for SqlitePreparer {
    async fn build(
        &self,
        study: &StudyHandle,
        lock: LockToken,
        cancel: &CancellationToken,
    ) -> Result<Vec<WorkItem>, PrepareError> {
        if cancel.is_cancelled() {
            return Err(PrepareError::Cancelled);
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE study_scenarios SET staged_count = ?
             WHERE study_key = ? AND needs_run = 1",
        )
        .bind(lock.counter)
        .bind(study.key.0)
        .execute(&mut *tx)
        .await?;

        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT scenario_key, source_count FROM study_scenarios
             WHERE study_key = ? AND staged_count = ?
             ORDER BY scenario_key",
        )
        .bind(study.key.0)
        .bind(lock.counter)
        .fetch_all(&mut *tx)
        .await?;

        if cancel.is_cancelled() {
            // Rolled back on drop; nothing was materialized.
            return Err(PrepareError::Cancelled);
        }
        tx.commit().await?;

        let items: Vec<WorkItem> = rows
            .into_iter()
            .map(|(key, sources)| WorkItem::new(key, sources.max(1) as u64))
            .collect();
        info!(study = %study.key, items = items.len(), "study backlog built");
        Ok(items)
    }

    async fn restore(&self, study: &StudyHandle) -> Result<(), PrepareError> {
        let cleared = sqlx::query(
            "UPDATE study_scenarios SET staged_count = NULL
             WHERE study_key = ? AND staged_count IS NOT NULL",
        )
        .bind(study.key.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        info!(study = %study.key, cleared, "study build restored");
        Ok(())
    }
}
