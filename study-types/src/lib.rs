//! Shared types for study runs
//!
//! These types are used by both:
//! - the run coordinator (lock protocol, work dispatch, phase machine)
//! - anything that reports run status (the CLI, log exporters)
//!
//! Serializable with serde so snapshots and summaries can be written as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

// ============================================================================
// Core Identifiers
// ============================================================================

/// Primary key of a persisted study record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StudyKey(pub i64);

impl std::fmt::Display for StudyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one scenario inside a study
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScenarioId(pub i64);

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(ScenarioId)
    }
}

// ============================================================================
// Work Items
// ============================================================================

/// One unit of work handed to a worker.
///
/// Cost is roughly the number of stations/sources the scenario evaluates and
/// is only used for progress estimation and accounting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItem {
    pub scenario_id: ScenarioId,
    pub estimated_cost: u64,
}

impl WorkItem {
    pub fn new(scenario_id: i64, estimated_cost: u64) -> Self {
        Self {
            scenario_id: ScenarioId(scenario_id),
            estimated_cost,
        }
    }
}

// ============================================================================
// Study Lock
// ============================================================================

/// Lock state stored on the study record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// Nobody holds the study
    None,
    /// Opened in an editor
    Edit,
    /// A run is building or running its baseline
    RunExclusive,
    /// Parallel run workers share the study
    RunShared,
    /// Administrative maintenance
    Admin,
}

impl LockState {
    /// Integer code persisted in the `lock_state` column
    pub fn code(self) -> i64 {
        match self {
            LockState::None => 0,
            LockState::Edit => 1,
            LockState::RunExclusive => 2,
            LockState::RunShared => 3,
            LockState::Admin => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(LockState::None),
            1 => Some(LockState::Edit),
            2 => Some(LockState::RunExclusive),
            3 => Some(LockState::RunShared),
            4 => Some(LockState::Admin),
            _ => None,
        }
    }
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LockState::None => "none",
            LockState::Edit => "edit",
            LockState::RunExclusive => "run_exclusive",
            LockState::RunShared => "run_shared",
            LockState::Admin => "admin",
        };
        f.write_str(name)
    }
}

/// Optimistic concurrency token: every successful transition bumps `counter`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockToken {
    pub state: LockState,
    pub counter: i64,
}

impl LockToken {
    pub fn new(state: LockState, counter: i64) -> Self {
        Self { state, counter }
    }

    /// Token written by a successful transition to `state`
    pub fn advance(self, state: LockState) -> Self {
        Self {
            state,
            counter: self.counter + 1,
        }
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.state.code(), self.counter)
    }
}

/// A study as last observed by the caller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StudyHandle {
    pub key: StudyKey,
    pub name: String,
    pub token: LockToken,
}

// ============================================================================
// Run State
// ============================================================================

/// Phases of a study run, in traversal order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    /// Blocked on the concurrency gate
    Wait,
    /// Constructing the scenario backlog
    Build,
    /// Single baseline worker
    Prerun,
    /// Parallel workers draining the backlog
    Running,
    /// Output merge
    Postrun,
    /// Undo build materialization, release the lock
    Restore,
    Exiting,
    Exit,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunPhase::Init => "init",
            RunPhase::Wait => "wait",
            RunPhase::Build => "build",
            RunPhase::Prerun => "prerun",
            RunPhase::Running => "running",
            RunPhase::Postrun => "postrun",
            RunPhase::Restore => "restore",
            RunPhase::Exiting => "exiting",
            RunPhase::Exit => "exit",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLifecycle {
    Spawned,
    Running,
    /// Holding an item whose completion has not been acknowledged yet
    AwaitingResponse,
    Exited,
    Failed,
}

impl WorkerLifecycle {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerLifecycle::Exited | WorkerLifecycle::Failed)
    }
}

impl std::fmt::Display for WorkerLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerLifecycle::Spawned => "spawned",
            WorkerLifecycle::Running => "running",
            WorkerLifecycle::AwaitingResponse => "awaiting_response",
            WorkerLifecycle::Exited => "exited",
            WorkerLifecycle::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Failures
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Backlog construction failed before anything was committed
    Setup,
    /// Another actor changed the study record
    LockConflict,
    /// A worker died holding work that could not be redistributed
    WorkerCrash,
    /// Backlog left with no worker to drain it
    LostWork,
    /// The output merger exited non-zero
    MergeFailure,
    /// Undoing the build materialization failed
    Restore,
    /// Operator abort
    Aborted,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Setup => "setup",
            FailureKind::LockConflict => "lock_conflict",
            FailureKind::WorkerCrash => "worker_crash",
            FailureKind::LostWork => "lost_work",
            FailureKind::MergeFailure => "merge_failure",
            FailureKind::Restore => "restore",
            FailureKind::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Recorded reason a run failed; the message is shown to the operator verbatim
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RunFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Active,
    Succeeded,
    Failed(RunFailure),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        match self {
            RunOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

// ============================================================================
// Status Snapshots
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerSnapshot {
    pub index: usize,
    pub run_id: String,
    pub pid: Option<u32>,
    pub lifecycle: WorkerLifecycle,
    pub pending: Option<ScenarioId>,
    /// Last reported percent complete for the pending scenario
    pub percent: Option<f64>,
    pub last_message: Option<String>,
    /// No output for longer than the configured threshold
    pub stuck: bool,
}

/// Point-in-time view of a run, published by the coordinator every tick
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSnapshot {
    pub run_id: Ulid,
    pub study: StudyKey,
    pub phase: RunPhase,
    pub outcome: RunOutcome,
    /// Estimated fraction complete in [0, 1]
    pub progress: f64,
    pub total_items: usize,
    pub done_items: usize,
    pub queued_items: usize,
    pub total_cost: u64,
    pub done_cost: u64,
    pub workers: Vec<WorkerSnapshot>,
    pub updated_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn new(run_id: Ulid, study: StudyKey) -> Self {
        Self {
            run_id,
            study,
            phase: RunPhase::Init,
            outcome: RunOutcome::Active,
            progress: 0.0,
            total_items: 0,
            done_items: 0,
            queued_items: 0,
            total_cost: 0,
            done_cost: 0,
            workers: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// One-line human readable status
    pub fn status_line(&self) -> String {
        match &self.outcome {
            RunOutcome::Failed(failure) => format!("Study run failed: {}", failure.message),
            RunOutcome::Succeeded => format!(
                "Study run complete: {} of {} scenarios",
                self.done_items, self.total_items
            ),
            RunOutcome::Active => {
                let stuck = self.workers.iter().filter(|w| w.stuck).count();
                let mut line = format!(
                    "{}: {:.0}% ({} of {} scenarios)",
                    self.phase,
                    self.progress * 100.0,
                    self.done_items,
                    self.total_items
                );
                if stuck > 0 {
                    line.push_str(&format!(", {stuck} worker(s) stuck"));
                }
                line
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
