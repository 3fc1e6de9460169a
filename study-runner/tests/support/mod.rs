//! Shared fixtures for coordinator integration tests: an in-memory study
//! database, scripted in-process workers and a merger that records its input.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use study_runner::db;
use study_runner::gate::ConcurrencyGate;
use study_runner::lock::LockManager;
use study_runner::merge::{MergeError, OutputArtifact, OutputMerger};
use study_runner::prepare::{PrepareError, SqlitePreparer, StudyPreparer};
use study_runner::worker::{
    Assignment, WorkerArgs, WorkerChannels, WorkerError, WorkerExit, WorkerLauncher,
};
use study_runner::{RunCoordinator, RunDeps, RunReport, RunSettings};
use study_types::{LockToken, RunPhase, StudyHandle, StudyKey, WorkItem};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Barrier};
use tokio_util::sync::CancellationToken;

pub const STUDY: StudyKey = StudyKey(7);

// ─── Study database ─────────────────────────────────────────────────────────

pub struct Harness {
    pub pool: SqlitePool,
    pub study: StudyHandle,
    pub temp: TempDir,
}

impl Harness {
    /// Study with one scenario per `(scenario_key, source_count)`.
    pub async fn new(scenarios: &[(i64, i64)]) -> Self {
        let pool = db::connect_in_memory().await.unwrap();
        let study = db::create_study(&pool, STUDY, "harness study").await.unwrap();
        for &(scenario, sources) in scenarios {
            db::add_scenario(&pool, STUDY, scenario, sources).await.unwrap();
        }
        Self {
            pool,
            study,
            temp: tempfile::tempdir().unwrap(),
        }
    }

    pub fn settings(&self, workers: usize) -> RunSettings {
        RunSettings {
            worker_count: workers,
            poll_interval: Duration::from_millis(5),
            temp_dir: self.temp.path().to_path_buf(),
            ..RunSettings::default()
        }
    }

    pub fn deps(
        &self,
        launcher: Arc<dyn WorkerLauncher>,
        merger: Arc<dyn OutputMerger>,
    ) -> RunDeps {
        RunDeps {
            gate: ConcurrencyGate::new(),
            locks: LockManager::new(self.pool.clone()),
            preparer: Arc::new(SqlitePreparer::new(self.pool.clone())),
            launcher,
            merger,
        }
    }

    pub fn coordinator(&self, settings: RunSettings, deps: RunDeps) -> RunCoordinator {
        RunCoordinator::new(self.study.clone(), settings, deps)
    }

    pub async fn stored_token(&self) -> LockToken {
        LockManager::new(self.pool.clone())
            .read_token(STUDY)
            .await
            .unwrap()
    }

    /// Scenario rows still marked by a build.
    pub async fn staged_rows(&self) -> i64 {
        let (n,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM study_scenarios WHERE staged_count IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await
        .unwrap();
        n
    }

    pub fn temp_files(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.temp.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect()
    }
}

/// Another process touches the study record behind the run's back.
pub async fn bump_lock_count(pool: &SqlitePool) {
    sqlx::query("UPDATE studies SET lock_count = lock_count + 1 WHERE study_key = ?")
        .bind(STUDY.0)
        .execute(pool)
        .await
        .unwrap();
}

pub async fn run_to_exit(coordinator: RunCoordinator) -> RunReport {
    tokio::time::timeout(Duration::from_secs(30), coordinator.run())
        .await
        .expect("study run did not reach EXIT")
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

pub fn full_lifecycle() -> Vec<RunPhase> {
    vec![
        RunPhase::Init,
        RunPhase::Wait,
        RunPhase::Build,
        RunPhase::Prerun,
        RunPhase::Running,
        RunPhase::Postrun,
        RunPhase::Restore,
        RunPhase::Exiting,
        RunPhase::Exit,
    ]
}

// ─── Preparers ──────────────────────────────────────────────────────────────

/// What happens after the real build has staged the backlog.
#[derive(Debug, Clone, Copy)]
pub enum BuildHook {
    /// Another process bumps the lock counter, then the build succeeds
    TamperLock,
    /// The build never finishes on its own; it honours cancellation
    StallUntilCancelled,
}

pub struct HookedPreparer {
    inner: SqlitePreparer,
    pool: SqlitePool,
    hook: BuildHook,
}

impl HookedPreparer {
    pub fn new(pool: &SqlitePool, hook: BuildHook) -> Arc<Self> {
        Arc::new(Self {
            inner: SqlitePreparer::new(pool.clone()),
            pool: pool.clone(),
            hook,
        })
    }
}

#[async_trait]
impl StudyPreparer for HookedPreparer {
    async fn build(
        &self,
        study: &StudyHandle,
        lock: LockToken,
        cancel: &CancellationToken,
    ) -> Result<Vec<WorkItem>, PrepareError> {
        let items = self.inner.build(study, lock, cancel).await?;
        match self.hook {
            BuildHook::TamperLock => {
                bump_lock_count(&self.pool).await;
                Ok(items)
            }
            BuildHook::StallUntilCancelled => {
                cancel.cancelled().await;
                Err(PrepareError::Cancelled)
            }
        }
    }

    async fn restore(&self, study: &StudyHandle) -> Result<(), PrepareError> {
        self.inner.restore(study).await
    }
}

// ─── Scripted workers ───────────────────────────────────────────────────────

/// What an interactive scripted worker does with a claimed scenario.
/// Fixed-scenario workers always complete their scenario.
#[derive(Clone)]
pub enum Behavior {
    Cooperative,
    /// Wait for every other crashing worker to claim, then exit 1 unacknowledged
    CrashAfterClaim(Arc<Barrier>),
    /// Never finish the claimed scenario
    Hang,
}

pub struct ScriptedLauncher {
    behavior: Behavior,
    launched: Mutex<Vec<WorkerArgs>>,
}

impl ScriptedLauncher {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            launched: Mutex::new(Vec::new()),
        })
    }

    pub fn launched(&self) -> Vec<WorkerArgs> {
        self.launched.lock().unwrap().clone()
    }
}

impl WorkerLauncher for ScriptedLauncher {
    fn launch(&self, args: &WorkerArgs) -> Result<WorkerChannels, WorkerError> {
        self.launched.lock().unwrap().push(args.clone());

        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let behavior = self.behavior.clone();
        let args = args.clone();

        tokio::spawn(async move {
            let code = tokio::select! {
                code = simulate(behavior, args, out_tx, in_rx) => code,
                _ = kill_rx => None,
            };
            let _ = exit_tx.send(WorkerExit { code });
        });

        Ok(WorkerChannels {
            pid: None,
            stdout: out_rx,
            stdin: in_tx,
            exit: exit_rx,
            kill: kill_tx,
        })
    }
}

async fn say(out: &mpsc::Sender<String>, line: impl Into<String>) -> Option<()> {
    out.send(line.into()).await.ok()
}

async fn record(path: &Path, scenario: &str) {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .unwrap();
    file.write_all(format!("scenario {scenario}\n").as_bytes())
        .await
        .unwrap();
}

async fn simulate(
    behavior: Behavior,
    args: WorkerArgs,
    out: mpsc::Sender<String>,
    mut input: mpsc::Receiver<String>,
) -> Option<i32> {
    tokio::fs::write(&args.output_file, b"").await.ok()?;

    match args.assignment {
        Assignment::Fixed(item) => {
            let id = item.scenario_id.to_string();
            say(&out, format!("##scenario={id}")).await?;
            record(&args.output_file, &id).await;
            say(&out, format!("??done {id}")).await?;
            input.recv().await?;
            Some(0)
        }
        Assignment::Interactive => loop {
            say(&out, "??next").await?;
            let reply = input.recv().await?;
            if reply == "none" {
                return Some(0);
            }
            match &behavior {
                Behavior::Cooperative => {}
                Behavior::CrashAfterClaim(barrier) => {
                    barrier.wait().await;
                    return Some(1);
                }
                Behavior::Hang => std::future::pending::<()>().await,
            }
            say(&out, format!("##scenario={reply}")).await?;
            say(&out, "##percent=100").await?;
            record(&args.output_file, &reply).await;
            say(&out, format!("??done {reply}")).await?;
            input.recv().await?;
        },
    }
}

// ─── Merger ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MergeCall {
    pub artifacts: Vec<OutputArtifact>,
    pub summary: serde_json::Value,
    /// Contents of each artifact at merge time
    pub contents: Vec<String>,
}

#[derive(Default)]
pub struct RecordingMerger {
    fail: bool,
    /// Bump the study's lock counter while merging
    tamper: Option<SqlitePool>,
    calls: Mutex<Vec<MergeCall>>,
}

impl RecordingMerger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn tampering(pool: &SqlitePool) -> Arc<Self> {
        Arc::new(Self {
            tamper: Some(pool.clone()),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<MergeCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutputMerger for RecordingMerger {
    async fn merge(&self, artifacts: &[OutputArtifact], summary: &Path) -> Result<(), MergeError> {
        let text = tokio::fs::read_to_string(summary)
            .await
            .map_err(|e| MergeError::Summary(e.to_string()))?;
        let summary = serde_json::from_str(&text).map_err(|e| MergeError::Summary(e.to_string()))?;
        let mut contents = Vec::new();
        for artifact in artifacts {
            contents.push(
                tokio::fs::read_to_string(&artifact.temp_path)
                    .await
                    .unwrap_or_default(),
            );
        }
        self.calls.lock().unwrap().push(MergeCall {
            artifacts: artifacts.to_vec(),
            summary,
            contents,
        });

        if let Some(pool) = &self.tamper {
            bump_lock_count(pool).await;
        }
        if self.fail {
            Err(MergeError::Failed("exit code 2".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Scenario ids recorded across every merged artifact, sorted.
pub fn merged_scenarios(call: &MergeCall) -> Vec<i64> {
    let mut ids: Vec<i64> = call
        .contents
        .iter()
        .flat_map(|text| text.lines())
        .filter_map(|line| line.strip_prefix("scenario "))
        .map(|id| id.parse().unwrap())
        .collect();
    ids.sort();
    ids
}
