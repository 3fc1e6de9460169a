//! Optimistic locking on the persisted study record
//!
//! Every transition has the same shape: inside one `BEGIN IMMEDIATE`
//! transaction (so check-and-sets on the database never interleave) read the
//! stored token, compare it with the token the caller last observed, then
//! write the new `(lock_state, lock_count + 1)` guarded by the old values.
//! A mismatch is a [`LockError::Conflict`]; a missing row is
//! [`LockError::Deleted`].

use sqlx::{SqliteConnection, SqlitePool};
use study_types::{LockState, LockToken, StudyKey};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("study lock was modified by another process (expected {expected}, found {found})")]
    Conflict { expected: LockToken, found: LockToken },

    #[error("study {0} was deleted")]
    Deleted(StudyKey),

    #[error("cannot {op} study lock while it is {state}")]
    InvalidState { op: &'static str, state: LockState },

    #[error("study {key} has unknown lock state code {code}")]
    Corrupt { key: StudyKey, code: i64 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct LockManager {
    pool: SqlitePool,
}

impl LockManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Current stored token.
    pub async fn read_token(&self, key: StudyKey) -> Result<LockToken, LockError> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT lock_state, lock_count FROM studies WHERE study_key = ?")
                .bind(key.0)
                .fetch_optional(&self.pool)
                .await?;
        let (code, count) = row.ok_or(LockError::Deleted(key))?;
        let state = LockState::from_code(code).ok_or(LockError::Corrupt { key, code })?;
        Ok(LockToken::new(state, count))
    }

    /// Take the study for a run; nobody else may hold it.
    pub async fn acquire_exclusive(
        &self,
        key: StudyKey,
        expected: LockToken,
    ) -> Result<LockToken, LockError> {
        self.transition(
            key,
            expected,
            "acquire exclusive",
            &[LockState::None],
            LockState::RunExclusive,
            0,
        )
        .await
    }

    /// Downgrade an exclusive run lock so parallel workers can share it.
    pub async fn acquire_shared(
        &self,
        key: StudyKey,
        expected: LockToken,
    ) -> Result<LockToken, LockError> {
        self.transition(
            key,
            expected,
            "acquire shared",
            &[LockState::RunExclusive],
            LockState::RunShared,
            1,
        )
        .await
    }

    pub async fn release(&self, key: StudyKey, expected: LockToken) -> Result<LockToken, LockError> {
        self.transition(
            key,
            expected,
            "release",
            &[LockState::RunExclusive, LockState::RunShared],
            LockState::None,
            0,
        )
        .await
    }

    async fn transition(
        &self,
        key: StudyKey,
        expected: LockToken,
        op: &'static str,
        allowed_from: &[LockState],
        to: LockState,
        share_count: i64,
    ) -> Result<LockToken, LockError> {
        let mut conn = self.pool.acquire().await?;

        // IMMEDIATE takes the write lock before the read, so concurrent
        // transitions wait on the busy timeout instead of failing to upgrade.
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let result =
            check_and_set(&mut *conn, key, expected, op, allowed_from, to, share_count).await;
        let end = if result.is_ok() { "COMMIT" } else { "ROLLBACK" };
        if let Err(e) = sqlx::query(end).execute(&mut *conn).await {
            // Never hand a connection stuck inside a transaction back to the pool.
            drop(conn.detach());
            return Err(result.err().unwrap_or(LockError::Database(e)));
        }

        let (found, next) = result?;
        info!(study = %key, from = %found, to = %next, op, "study lock transition");
        Ok(next)
    }
}

/// Compare the stored token with `expected` and write the next one.
/// Runs inside the caller's transaction; returns `(found, next)`.
async fn check_and_set(
    conn: &mut SqliteConnection,
    key: StudyKey,
    expected: LockToken,
    op: &'static str,
    allowed_from: &[LockState],
    to: LockState,
    share_count: i64,
) -> Result<(LockToken, LockToken), LockError> {
    let row: Option<(i64, i64)> =
        sqlx::query_as("SELECT lock_state, lock_count FROM studies WHERE study_key = ?")
            .bind(key.0)
            .fetch_optional(&mut *conn)
            .await?;
    let (code, count) = row.ok_or(LockError::Deleted(key))?;
    let state = LockState::from_code(code).ok_or(LockError::Corrupt { key, code })?;
    let found = LockToken::new(state, count);

    if found != expected {
        debug!(study = %key, %expected, %found, op, "lock token mismatch");
        return Err(LockError::Conflict { expected, found });
    }
    if !allowed_from.contains(&state) {
        return Err(LockError::InvalidState { op, state });
    }

    let next = found.advance(to);
    let updated = sqlx::query(
        "UPDATE studies SET lock_state = ?, lock_count = ?, share_count = ?
         WHERE study_key = ? AND lock_state = ? AND lock_count = ?",
    )
    .bind(next.state.code())
    .bind(next.counter)
    .bind(share_count)
    .bind(key.0)
    .bind(found.state.code())
    .bind(found.counter)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if updated != 1 {
        return Err(LockError::Conflict { expected, found });
    }
    Ok((found, next))
}
