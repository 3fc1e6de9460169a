use std::path::PathBuf;
use std::time::Duration;

use crate::coordinator::RunSettings;
use crate::worker::ConnectionTarget;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// SQLite database holding the study records
    pub database_url: String,
    /// Path to the engine executable each worker runs
    pub engine_binary: String,
    /// Arguments placed before the worker argv, split on whitespace
    pub engine_args: Vec<String>,
    /// Path to the output merger executable
    pub merge_binary: String,
    /// Directory for per-worker temp artifacts and the run summary
    pub temp_dir: PathBuf,
    /// Requested number of parallel workers
    pub worker_count: usize,
    /// Share of the machine memory budget this run asks the gate for
    pub memory_fraction: f64,
    /// Control loop tick
    pub poll_interval: Duration,
    /// Silence after which a worker is reported stuck
    pub stuck_after: Duration,
    /// Run a single baseline worker before the parallel phase
    pub prerun: bool,
    /// Database coordinates handed to every worker
    pub connection: ConnectionTarget,
    pub file_output_codes: String,
    pub map_output_codes: String,
    /// Where worker transcripts are exported after the run, if anywhere
    pub output_log: Option<PathBuf>,
}

impl RunnerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let config = Self {
            database_url: env_str("STUDY_DATABASE_URL", "sqlite:./data/studies.db"),
            engine_binary: env_str("STUDY_ENGINE_BINARY", "study-engine"),
            engine_args: env_str("STUDY_ENGINE_ARGS", "")
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            merge_binary: env_str("STUDY_MERGE_BINARY", "study-merge"),
            temp_dir: std::env::var("STUDY_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir()),
            worker_count: env_parse("STUDY_WORKER_COUNT", default_workers)?,
            memory_fraction: env_parse("STUDY_MEMORY_FRACTION", 1.0)?,
            poll_interval: Duration::from_millis(env_parse("STUDY_POLL_INTERVAL_MS", 100)?),
            stuck_after: Duration::from_secs(env_parse("STUDY_STUCK_AFTER_SECS", 600)?),
            prerun: env_parse("STUDY_PRERUN", true)?,
            connection: ConnectionTarget {
                host: env_str("STUDY_DB_HOST", "localhost"),
                database: env_str("STUDY_DB_NAME", "studies"),
                user: env_str("STUDY_DB_USER", "study"),
            },
            file_output_codes: env_str("STUDY_FILE_OUTPUTS", ""),
            map_output_codes: env_str("STUDY_MAP_OUTPUTS", ""),
            output_log: std::env::var("STUDY_OUTPUT_LOG").ok().map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.worker_count == 0 {
            return Err(anyhow::anyhow!("STUDY_WORKER_COUNT must be at least 1"));
        }
        if !(self.memory_fraction > 0.0 && self.memory_fraction <= 1.0) {
            return Err(anyhow::anyhow!(
                "STUDY_MEMORY_FRACTION must be in (0, 1], got {}",
                self.memory_fraction
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow::anyhow!("STUDY_POLL_INTERVAL_MS must be positive"));
        }
        Ok(())
    }

    /// Per-run knobs handed to the coordinator
    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            worker_count: self.worker_count,
            memory_fraction: self.memory_fraction,
            poll_interval: self.poll_interval,
            stuck_after: self.stuck_after,
            prerun: self.prerun,
            temp_dir: self.temp_dir.clone(),
            connection: self.connection.clone(),
            file_output_codes: self.file_output_codes.clone(),
            map_output_codes: self.map_output_codes.clone(),
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}
