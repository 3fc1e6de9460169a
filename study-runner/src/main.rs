use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use study_runner::config::RunnerConfig;
use study_runner::gate::ConcurrencyGate;
use study_runner::lock::LockManager;
use study_runner::merge::CommandMerger;
use study_runner::prepare::SqlitePreparer;
use study_runner::worker::ProcessLauncher;
use study_runner::{db, RunCoordinator, RunDeps};
use study_types::{RunPhase, StudyKey};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(30);

fn study_key_arg() -> anyhow::Result<StudyKey> {
    let raw = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("STUDY_KEY").ok())
        .context("usage: study-runner <study-key> (or set STUDY_KEY)")?;
    let key = raw
        .trim()
        .parse::<i64>()
        .with_context(|| format!("invalid study key {raw:?}"))?;
    Ok(StudyKey(key))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "study_runner=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let key = study_key_arg()?;
    let config = RunnerConfig::from_env()?;
    info!(study = %key, workers = config.worker_count, "study-runner starting");

    let pool = db::connect(&config.database_url).await?;
    let study = db::load_study(&pool, key)
        .await?
        .with_context(|| format!("study {key} not found"))?;

    let gate = ConcurrencyGate::new();
    let deps = RunDeps {
        gate: Arc::clone(&gate),
        locks: LockManager::new(pool.clone()),
        preparer: Arc::new(SqlitePreparer::new(pool.clone())),
        launcher: Arc::new(
            ProcessLauncher::new(config.engine_binary.clone())
                .with_leading_args(config.engine_args.clone()),
        ),
        merger: Arc::new(CommandMerger::new(config.merge_binary.clone())),
    };

    let coordinator = RunCoordinator::new(study, config.run_settings(), deps);
    let control = coordinator.control();

    // Ctrl-C asks the run to abort; it still restores and releases the lock.
    {
        let control = control.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() && control.abort() {
                warn!("interrupt received; aborting study run");
            }
        });
    }

    {
        let control = control.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROGRESS_LOG_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if control.is_finished() {
                    break;
                }
                let snapshot = control.snapshot();
                if snapshot.phase == RunPhase::Wait {
                    info!(
                        waiting = gate.waiting(),
                        longest_wait_secs = gate.longest_wait().map(|d| d.as_secs()),
                        "waiting for a gate slot"
                    );
                }
                info!("{}", snapshot.status_line());
            }
        });
    }

    let report = coordinator.run().await;

    if let Some(path) = &config.output_log {
        match report.export_transcripts(path).await {
            Ok(()) => info!(path = %path.display(), "worker transcripts exported"),
            Err(e) => warn!(path = %path.display(), "failed to export worker transcripts: {e}"),
        }
    }

    println!("{}", report.status_line());
    if report.released_from.is_some() && !report.lock_released {
        warn!(study = %key, "study lock was not released by this run");
    }
    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
