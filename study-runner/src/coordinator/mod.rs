//! Study run state machine
//!
//! One [`RunCoordinator`] drives one study run through
//! `INIT → WAIT → BUILD → PRERUN → RUNNING → POSTRUN → RESTORE → EXITING → EXIT`.
//! Every failure after the lock was taken funnels through RESTORE so the
//! build is undone and the lock released.
//!
//! [`RunCoordinator::tick`] never blocks: worker I/O arrives over channels
//! and the slow steps (build, lock downgrade, merge, restore) run as
//! background tasks whose results are polled. [`RunCoordinator::run`] calls
//! `tick` on a fixed interval until EXIT.

mod control;
mod report;
mod task;

pub use control::RunControl;
pub use report::RunReport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use study_types::{
    FailureKind, LockToken, RunFailure, RunOutcome, RunPhase, RunSnapshot, StudyHandle, WorkItem,
};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use self::task::{PhaseTask, TaskPoll};
use crate::gate::{ConcurrencyGate, GatePermit, GateTicket};
use crate::lock::{LockError, LockManager};
use crate::merge::{self, MergeError, OutputArtifact, OutputMerger, RunSummary};
use crate::pool::{PoolPhase, PoolStatus, WorkPool};
use crate::prepare::{PrepareError, StudyPreparer};
use crate::worker::{
    Assignment, ConnectionTarget, WorkerArgs, WorkerHandle, WorkerLauncher, WorkerTranscript,
};

/// Per-run knobs
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub worker_count: usize,
    pub memory_fraction: f64,
    pub poll_interval: Duration,
    pub stuck_after: Duration,
    pub prerun: bool,
    pub temp_dir: PathBuf,
    pub connection: ConnectionTarget,
    pub file_output_codes: String,
    pub map_output_codes: String,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            worker_count: 1,
            memory_fraction: 1.0,
            poll_interval: Duration::from_millis(100),
            stuck_after: Duration::from_secs(600),
            prerun: true,
            temp_dir: std::env::temp_dir(),
            connection: ConnectionTarget {
                host: "localhost".to_string(),
                database: "studies".to_string(),
                user: "study".to_string(),
            },
            file_output_codes: String::new(),
            map_output_codes: String::new(),
        }
    }
}

/// Collaborators a run talks to
#[derive(Clone)]
pub struct RunDeps {
    pub gate: Arc<ConcurrencyGate>,
    pub locks: LockManager,
    pub preparer: Arc<dyn StudyPreparer>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub merger: Arc<dyn OutputMerger>,
}

struct Built {
    token: LockToken,
    items: Vec<WorkItem>,
}

/// Build failed after or while taking the lock; the build task already
/// undid its work and tried to release.
struct BuildFailed {
    failure: RunFailure,
    released_from: Option<LockToken>,
    released: bool,
}

struct Restored {
    restore: Result<(), PrepareError>,
    release: Option<Result<LockToken, LockError>>,
}

enum RunState {
    Init,
    Wait { ticket: GateTicket },
    Build { task: PhaseTask<Result<Built, BuildFailed>> },
    Prerun,
    /// `downgrade` is the exclusive → shared transition still in flight
    Running { downgrade: Option<PhaseTask<Result<LockToken, LockError>>> },
    Postrun { task: PhaseTask<Result<(), MergeError>> },
    Restore { task: PhaseTask<Restored> },
    Exiting,
    /// Still EXITING: temp files are being removed
    Cleanup { task: PhaseTask<()> },
    Exit,
}

impl RunState {
    fn phase(&self) -> RunPhase {
        match self {
            RunState::Init => RunPhase::Init,
            RunState::Wait { .. } => RunPhase::Wait,
            RunState::Build { .. } => RunPhase::Build,
            RunState::Prerun => RunPhase::Prerun,
            RunState::Running { .. } => RunPhase::Running,
            RunState::Postrun { .. } => RunPhase::Postrun,
            RunState::Restore { .. } => RunPhase::Restore,
            RunState::Exiting | RunState::Cleanup { .. } => RunPhase::Exiting,
            RunState::Exit => RunPhase::Exit,
        }
    }
}

pub struct RunCoordinator {
    run_id: Ulid,
    study: StudyHandle,
    settings: RunSettings,
    deps: RunDeps,
    control: RunControl,
    state: RunState,
    phases: Vec<RunPhase>,
    permit: Option<GatePermit>,
    process_hint: usize,
    /// Latest lock token this run holds
    token: Option<LockToken>,
    released_from: Option<LockToken>,
    lock_released: bool,
    pool: WorkPool,
    artifacts: Vec<OutputArtifact>,
    summary_path: Option<PathBuf>,
    transcripts: Vec<WorkerTranscript>,
    failure: Option<RunFailure>,
    aborted: bool,
    cancel: CancellationToken,
    stuck_workers: usize,
    started_at: DateTime<Utc>,
}

impl RunCoordinator {
    pub fn new(study: StudyHandle, settings: RunSettings, deps: RunDeps) -> Self {
        let run_id = Ulid::new();
        Self {
            control: RunControl::new(RunSnapshot::new(run_id, study.key)),
            run_id,
            study,
            settings,
            deps,
            state: RunState::Init,
            phases: vec![RunPhase::Init],
            permit: None,
            process_hint: 1,
            token: None,
            released_from: None,
            lock_released: false,
            pool: WorkPool::default(),
            artifacts: Vec::new(),
            summary_path: None,
            transcripts: Vec::new(),
            failure: None,
            aborted: false,
            cancel: CancellationToken::new(),
            stuck_workers: 0,
            started_at: Utc::now(),
        }
    }

    pub fn run_id(&self) -> Ulid {
        self.run_id
    }

    pub fn phase(&self) -> RunPhase {
        self.state.phase()
    }

    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, RunState::Exit)
    }

    /// Past the point where an abort changes anything.
    fn is_winding_up(&self) -> bool {
        matches!(
            self.state,
            RunState::Exiting | RunState::Cleanup { .. } | RunState::Exit
        )
    }

    /// Drive the run to EXIT on the configured poll interval.
    pub async fn run(mut self) -> RunReport {
        info!(
            run = %self.run_id,
            study = %self.study.key,
            workers = self.settings.worker_count,
            fraction = self.settings.memory_fraction,
            "study run starting"
        );
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !self.is_finished() {
            interval.tick().await;
            self.tick();
        }
        self.into_report()
    }

    /// Advance the state machine by at most one phase. Never blocks.
    pub fn tick(&mut self) {
        if !self.aborted && self.control.abort_requested() && !self.is_winding_up() {
            self.begin_abort();
        }

        let state = std::mem::replace(&mut self.state, RunState::Exiting);
        self.state = self.advance(state);

        let phase = self.state.phase();
        if self.phases.last() != Some(&phase) {
            info!(run = %self.run_id, study = %self.study.key, %phase, "run phase");
            self.phases.push(phase);
        }
        self.watch_stuck();
        self.publish();
    }

    pub fn into_report(self) -> RunReport {
        RunReport {
            run_id: self.run_id,
            study: self.study.key,
            outcome: self.outcome(),
            phases: self.phases,
            initial_token: self.study.token,
            released_from: self.released_from,
            lock_released: self.lock_released,
            ledger: self.pool.ledger().clone(),
            transcripts: self.transcripts,
        }
    }

    fn advance(&mut self, state: RunState) -> RunState {
        match state {
            RunState::Init => {
                if self.aborted {
                    return RunState::Exiting;
                }
                let ticket = self.deps.gate.request(self.settings.memory_fraction);
                RunState::Wait { ticket }
            }

            RunState::Wait { mut ticket } => {
                if self.aborted {
                    // Dropping the ticket withdraws the request.
                    return RunState::Exiting;
                }
                if self.control.take_bump() {
                    ticket.bump();
                }
                match ticket.try_acquire() {
                    None => RunState::Wait { ticket },
                    Some(permit) => {
                        self.process_hint = permit.process_hint(self.settings.worker_count);
                        self.permit = Some(permit);
                        RunState::Build {
                            task: PhaseTask::spawn(build_study(
                                self.study.clone(),
                                self.deps.locks.clone(),
                                Arc::clone(&self.deps.preparer),
                                self.cancel.clone(),
                            )),
                        }
                    }
                }
            }

            RunState::Build { mut task } => match task.poll() {
                TaskPoll::Pending => RunState::Build { task },
                TaskPoll::Ready(Ok(built)) => {
                    self.token = Some(built.token);
                    self.pool = WorkPool::new(built.items);
                    info!(
                        study = %self.study.key,
                        lock = %built.token,
                        items = self.pool.queue().len(),
                        cost = self.pool.queue().cost(),
                        "backlog ready"
                    );
                    if self.failure.is_some() {
                        return self.enter_restore();
                    }
                    self.enter_prerun(built.token)
                }
                TaskPoll::Ready(Err(failed)) => {
                    self.released_from = failed.released_from;
                    self.lock_released = failed.released;
                    self.fail(failed.failure);
                    RunState::Exiting
                }
                TaskPoll::Lost => {
                    error!(study = %self.study.key, "build task ended without reporting; lock state unknown");
                    self.fail(RunFailure::new(
                        FailureKind::Setup,
                        "study build task ended unexpectedly",
                    ));
                    RunState::Exiting
                }
            },

            RunState::Prerun => match self.poll_pool() {
                Some(PoolStatus::Drained) => {
                    self.end_worker_phase();
                    self.enter_running()
                }
                Some(_) => RunState::Prerun,
                None => self.wind_down(RunState::Prerun),
            },

            RunState::Running {
                downgrade: Some(mut task),
            } => match task.poll() {
                TaskPoll::Pending => RunState::Running {
                    downgrade: Some(task),
                },
                TaskPoll::Ready(Ok(token)) => {
                    info!(study = %self.study.key, lock = %token, "study lock shared");
                    self.token = Some(token);
                    if self.failure.is_some() {
                        return self.enter_restore();
                    }
                    self.start_parallel(token)
                }
                TaskPoll::Ready(Err(e)) => {
                    self.fail(RunFailure::new(
                        FailureKind::LockConflict,
                        format!("could not share study lock: {e}"),
                    ));
                    self.enter_restore()
                }
                TaskPoll::Lost => {
                    self.fail(RunFailure::new(
                        FailureKind::LockConflict,
                        "lock downgrade task ended unexpectedly",
                    ));
                    self.enter_restore()
                }
            },

            RunState::Running { downgrade: None } => match self.poll_pool() {
                Some(PoolStatus::Drained) => {
                    self.end_worker_phase();
                    self.enter_postrun()
                }
                Some(_) => RunState::Running { downgrade: None },
                None => self.wind_down(RunState::Running { downgrade: None }),
            },

            RunState::Postrun { mut task } => {
                if self.failure.is_some() {
                    task.abort();
                    return self.enter_restore();
                }
                match task.poll() {
                    TaskPoll::Pending => RunState::Postrun { task },
                    TaskPoll::Ready(Ok(())) => self.enter_restore(),
                    TaskPoll::Ready(Err(e)) => {
                        self.fail(RunFailure::new(
                            FailureKind::MergeFailure,
                            format!("{e}; scenario results were computed but not merged"),
                        ));
                        self.enter_restore()
                    }
                    TaskPoll::Lost => {
                        self.fail(RunFailure::new(
                            FailureKind::MergeFailure,
                            "output merge task ended unexpectedly",
                        ));
                        self.enter_restore()
                    }
                }
            }

            RunState::Restore { mut task } => match task.poll() {
                TaskPoll::Pending => RunState::Restore { task },
                TaskPoll::Ready(restored) => {
                    if let Err(e) = restored.restore {
                        self.fail(RunFailure::new(
                            FailureKind::Restore,
                            format!("study restore failed: {e}"),
                        ));
                    }
                    match restored.release {
                        Some(Ok(token)) => {
                            info!(study = %self.study.key, lock = %token, "study lock released");
                            self.token = Some(token);
                            self.lock_released = true;
                        }
                        Some(Err(e)) => error!(
                            study = %self.study.key,
                            "failed to release study lock; it stays held until cleared by hand: {e}"
                        ),
                        None => warn!(study = %self.study.key, "no study lock held at restore"),
                    }
                    RunState::Exiting
                }
                TaskPoll::Lost => {
                    error!(study = %self.study.key, "restore task ended unexpectedly; study lock may still be held");
                    RunState::Exiting
                }
            },

            RunState::Exiting => {
                self.end_worker_phase();
                self.permit = None;
                let mut temp_files: Vec<PathBuf> =
                    self.artifacts.iter().map(|a| a.temp_path.clone()).collect();
                temp_files.extend(self.summary_path.take());
                RunState::Cleanup {
                    task: PhaseTask::spawn(merge::remove_temp_files(temp_files)),
                }
            }

            RunState::Cleanup { mut task } => match task.poll() {
                TaskPoll::Pending => RunState::Cleanup { task },
                TaskPoll::Ready(()) | TaskPoll::Lost => {
                    self.control.mark_exited();
                    match &self.failure {
                        Some(failure) => error!(
                            run = %self.run_id,
                            study = %self.study.key,
                            kind = %failure.kind,
                            "Study run failed: {}",
                            failure.message
                        ),
                        None => info!(
                            run = %self.run_id,
                            study = %self.study.key,
                            done = self.pool.ledger().retired_items(),
                            total = self.pool.ledger().total_items,
                            "study run complete"
                        ),
                    }
                    RunState::Exit
                }
            },

            RunState::Exit => RunState::Exit,
        }
    }

    /// Poll the pool. `None` means the phase is failing and must wind down.
    fn poll_pool(&mut self) -> Option<PoolStatus> {
        let status = self.pool.poll();
        if let PoolStatus::Failed(failure) = &status {
            self.fail(failure.clone());
        }
        if self.failure.is_some() {
            None
        } else {
            Some(status)
        }
    }

    /// Kill every live worker and wait for them before restoring.
    fn wind_down(&mut self, state: RunState) -> RunState {
        self.pool.kill_all();
        if self.pool.live_workers() > 0 {
            return state;
        }
        self.end_worker_phase();
        self.enter_restore()
    }

    fn enter_prerun(&mut self, token: LockToken) -> RunState {
        if !self.settings.prerun {
            return self.enter_running();
        }
        let Some(item) = self.pool.take_front() else {
            return self.enter_running();
        };

        let args = self.worker_args(0, token, Assignment::Fixed(item));
        match WorkerHandle::spawn(self.deps.launcher.as_ref(), args) {
            Ok(worker) => {
                info!(
                    study = %self.study.key,
                    scenario = %item.scenario_id,
                    pid = ?worker.pid(),
                    "baseline worker started"
                );
                self.artifacts.push(worker.artifact());
                self.pool.set_phase(PoolPhase::Baseline);
                self.pool.add_worker(worker);
                RunState::Prerun
            }
            Err(e) => {
                self.pool.requeue_front(item);
                self.pool.lose_remaining();
                self.fail(RunFailure::new(
                    FailureKind::WorkerCrash,
                    format!("baseline worker could not be started: {e}"),
                ));
                self.enter_restore()
            }
        }
    }

    fn enter_running(&mut self) -> RunState {
        let Some(token) = self.token else {
            self.fail(RunFailure::new(
                FailureKind::LockConflict,
                "no study lock held after build",
            ));
            return self.enter_restore();
        };
        let locks = self.deps.locks.clone();
        let key = self.study.key;
        RunState::Running {
            downgrade: Some(PhaseTask::spawn(async move {
                locks.acquire_shared(key, token).await
            })),
        }
    }

    fn start_parallel(&mut self, token: LockToken) -> RunState {
        let backlog = self.pool.queue().len();
        if backlog == 0 {
            info!(study = %self.study.key, "backlog empty; no parallel workers needed");
            return self.enter_postrun();
        }

        let count = self.settings.worker_count.min(backlog);
        self.pool.set_phase(PoolPhase::Parallel);
        for index in 0..count {
            let args = self.worker_args(index, token, Assignment::Interactive);
            match WorkerHandle::spawn(self.deps.launcher.as_ref(), args) {
                Ok(worker) => {
                    debug!(
                        study = %self.study.key,
                        worker = worker.index(),
                        pid = ?worker.pid(),
                        "worker started"
                    );
                    self.artifacts.push(worker.artifact());
                    self.pool.add_worker(worker);
                }
                Err(e) => warn!(study = %self.study.key, worker = index, "worker not started: {e}"),
            }
        }

        if self.pool.workers().is_empty() {
            let lost = self.pool.lose_remaining();
            self.fail(RunFailure::new(
                FailureKind::WorkerCrash,
                format!("no worker could be started; {lost} scenario(s) abandoned"),
            ));
            return self.enter_restore();
        }
        info!(
            study = %self.study.key,
            workers = self.pool.workers().len(),
            processes = self.process_hint,
            "parallel workers started"
        );
        RunState::Running { downgrade: None }
    }

    fn enter_postrun(&mut self) -> RunState {
        let lock_count = self.token.map(|t| t.counter).unwrap_or_default();
        let summary_path =
            OutputArtifact::summary_path(&self.settings.temp_dir, self.study.key, lock_count);
        self.summary_path = Some(summary_path.clone());

        let ledger = self.pool.ledger();
        let summary = RunSummary {
            run_id: self.run_id,
            study: self.study.key,
            study_name: self.study.name.clone(),
            lock_count,
            worker_count: self.settings.worker_count,
            process_hint: self.process_hint,
            total_items: ledger.total_items,
            retired: ledger.retired.clone(),
            total_cost: ledger.total_cost,
            retired_cost: ledger.retired_cost,
            artifacts: self.artifacts.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
        };
        RunState::Postrun {
            task: PhaseTask::spawn(merge_outputs(
                Arc::clone(&self.deps.merger),
                summary,
                summary_path,
            )),
        }
    }

    fn enter_restore(&mut self) -> RunState {
        self.released_from = self.token;
        RunState::Restore {
            task: PhaseTask::spawn(restore_study(
                self.study.clone(),
                self.deps.locks.clone(),
                Arc::clone(&self.deps.preparer),
                self.token,
            )),
        }
    }

    fn end_worker_phase(&mut self) {
        for worker in self.pool.take_workers() {
            self.transcripts.push(worker.into_transcript());
        }
    }

    fn begin_abort(&mut self) {
        self.aborted = true;
        warn!(run = %self.run_id, study = %self.study.key, phase = %self.state.phase(), "abort requested");
        self.fail(RunFailure::new(FailureKind::Aborted, "aborted by operator"));
        self.cancel.cancel();
        self.pool.kill_all();
    }

    /// Record a failure; the first one decides the outcome.
    fn fail(&mut self, failure: RunFailure) {
        match &self.failure {
            None => {
                error!(
                    run = %self.run_id,
                    study = %self.study.key,
                    kind = %failure.kind,
                    "{}",
                    failure.message
                );
                self.failure = Some(failure);
            }
            Some(first) => warn!(
                run = %self.run_id,
                kind = %failure.kind,
                first = %first.kind,
                "further failure while failing: {}",
                failure.message
            ),
        }
    }

    fn worker_args(&self, index: usize, token: LockToken, assignment: Assignment) -> WorkerArgs {
        WorkerArgs {
            index,
            study: self.study.key,
            connection: self.settings.connection.clone(),
            lock: token,
            file_output_codes: self.settings.file_output_codes.clone(),
            map_output_codes: self.settings.map_output_codes.clone(),
            process_hint: self.process_hint,
            output_file: OutputArtifact::temp_path(
                &self.settings.temp_dir,
                self.study.key,
                token.counter,
                index,
            ),
            assignment,
        }
    }

    fn outcome(&self) -> RunOutcome {
        match &self.failure {
            Some(failure) => RunOutcome::Failed(failure.clone()),
            None if self.is_finished() => RunOutcome::Succeeded,
            None => RunOutcome::Active,
        }
    }

    fn watch_stuck(&mut self) {
        let stuck: Vec<&str> = self
            .pool
            .workers()
            .iter()
            .filter(|w| w.is_stuck(self.settings.stuck_after))
            .map(|w| w.run_id())
            .collect();
        if stuck.len() > self.stuck_workers {
            warn!(
                study = %self.study.key,
                workers = ?stuck,
                silent_secs = self.settings.stuck_after.as_secs(),
                "worker(s) silent; possibly stuck"
            );
        }
        self.stuck_workers = stuck.len();
    }

    fn publish(&self) {
        let ledger = self.pool.ledger();
        self.control.publish(RunSnapshot {
            run_id: self.run_id,
            study: self.study.key,
            phase: self.state.phase(),
            outcome: self.outcome(),
            progress: self.pool.progress(),
            total_items: ledger.total_items,
            done_items: ledger.retired_items(),
            queued_items: self.pool.queue().len(),
            total_cost: ledger.total_cost,
            done_cost: ledger.retired_cost,
            workers: self
                .pool
                .workers()
                .iter()
                .map(|w| w.snapshot(self.settings.stuck_after))
                .collect(),
            updated_at: Utc::now(),
        });
    }
}

async fn build_study(
    study: StudyHandle,
    locks: LockManager,
    preparer: Arc<dyn StudyPreparer>,
    cancel: CancellationToken,
) -> Result<Built, BuildFailed> {
    let token = locks
        .acquire_exclusive(study.key, study.token)
        .await
        .map_err(|e| BuildFailed {
            failure: RunFailure::new(FailureKind::Setup, format!("study build failed: {e}")),
            released_from: None,
            released: false,
        })?;
    info!(study = %study.key, lock = %token, "study lock acquired");

    match preparer.build(&study, token, &cancel).await {
        Ok(items) => Ok(Built { token, items }),
        Err(e) => {
            // Nothing was committed; undo and give the lock back here.
            if let Err(restore_err) = preparer.restore(&study).await {
                warn!(study = %study.key, "restore after failed build: {restore_err}");
            }
            let released = match locks.release(study.key, token).await {
                Ok(_) => true,
                Err(release_err) => {
                    error!(study = %study.key, "failed to release study lock after failed build: {release_err}");
                    false
                }
            };
            let kind = match e {
                PrepareError::Cancelled => FailureKind::Aborted,
                _ => FailureKind::Setup,
            };
            Err(BuildFailed {
                failure: RunFailure::new(kind, format!("study build failed: {e}")),
                released_from: Some(token),
                released,
            })
        }
    }
}

async fn merge_outputs(
    merger: Arc<dyn OutputMerger>,
    summary: RunSummary,
    summary_path: PathBuf,
) -> Result<(), MergeError> {
    summary.write(&summary_path).await?;
    let artifacts = merge::existing_artifacts(&summary.artifacts);
    merger.merge(&artifacts, &summary_path).await
}

async fn restore_study(
    study: StudyHandle,
    locks: LockManager,
    preparer: Arc<dyn StudyPreparer>,
    token: Option<LockToken>,
) -> Restored {
    let restore = preparer.restore(&study).await;
    let release = match token {
        Some(token) => Some(locks.release(study.key, token).await),
        None => None,
    };
    Restored { restore, release }
}
