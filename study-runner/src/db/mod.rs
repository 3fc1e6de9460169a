use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use study_types::{LockState, LockToken, StudyHandle, StudyKey};

/// How long a lock transition waits for another process's write to finish.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    // Resolve the file path and ensure the parent directory exists.
    // Handles both "sqlite:./foo.db" and "sqlite:../foo.db" forms.
    let file_path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

    let abs_path = std::env::current_dir()?.join(file_path);
    if let Some(parent) = abs_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let pool = SqlitePool::connect_with(
        SqliteConnectOptions::new()
            .filename(&abs_path)
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT),
    )
    .await?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Single-connection in-memory database; the connection never idles out so
/// the schema lives as long as the pool.
pub async fn connect_in_memory() -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Create the study tables if they do not exist.
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS studies (
            study_key   INTEGER PRIMARY KEY,
            name        TEXT    NOT NULL,
            lock_state  INTEGER NOT NULL DEFAULT 0,
            lock_count  INTEGER NOT NULL DEFAULT 1,
            share_count INTEGER NOT NULL DEFAULT 0
        )",
    )
    .execute(pool)
    .await?;

    // staged_count holds the lock count of the build that materialized the
    // row for a run; NULL when no run owns it.
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS study_scenarios (
            study_key    INTEGER NOT NULL,
            scenario_key INTEGER NOT NULL,
            source_count INTEGER NOT NULL DEFAULT 1,
            needs_run    INTEGER NOT NULL DEFAULT 1,
            staged_count INTEGER,
            PRIMARY KEY (study_key, scenario_key)
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Insert a new unlocked study record.
pub async fn create_study(
    pool: &SqlitePool,
    key: StudyKey,
    name: &str,
) -> Result<StudyHandle, sqlx::Error> {
    sqlx::query("INSERT INTO studies (study_key, name, lock_state, lock_count, share_count) VALUES (?, ?, ?, 1, 0)")
        .bind(key.0)
        .bind(name)
        .bind(LockState::None.code())
        .execute(pool)
        .await?;

    Ok(StudyHandle {
        key,
        name: name.to_string(),
        token: LockToken::new(LockState::None, 1),
    })
}

/// Add a scenario to a study's backlog source.
pub async fn add_scenario(
    pool: &SqlitePool,
    key: StudyKey,
    scenario_key: i64,
    source_count: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO study_scenarios (study_key, scenario_key, source_count, needs_run)
         VALUES (?, ?, ?, 1)",
    )
    .bind(key.0)
    .bind(scenario_key)
    .bind(source_count)
    .execute(pool)
    .await?;
    Ok(())
}

/// Load a study handle carrying the currently stored lock token.
pub async fn load_study(pool: &SqlitePool, key: StudyKey) -> anyhow::Result<Option<StudyHandle>> {
    let row: Option<(String, i64, i64)> =
        sqlx::query_as("SELECT name, lock_state, lock_count FROM studies WHERE study_key = ?")
            .bind(key.0)
            .fetch_optional(pool)
            .await?;

    match row {
        None => Ok(None),
        Some((name, state, count)) => {
            let state = LockState::from_code(state)
                .ok_or_else(|| anyhow::anyhow!("study {key} has unknown lock state {state}"))?;
            Ok(Some(StudyHandle {
                key,
                name,
                token: LockToken::new(state, count),
            }))
        }
    }
}
