//! Worker handles - one spawned engine process each
//!
//! A worker is reached only through its argument vector and a pair of
//! bounded line channels (stdout lines in, stdin replies out) plus an exit
//! notification. [`WorkerLauncher`] produces those channels; the tokio
//! process implementation lives in [`process`], tests provide in-process
//! fakes. The coordinator polls handles without ever blocking on them.

pub mod process;
pub mod protocol;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use study_types::{
    LockToken, ScenarioId, StudyKey, WorkItem, WorkerLifecycle, WorkerSnapshot,
};
use tokio::sync::{mpsc, oneshot};

use self::protocol::StatusUpdate;
use crate::merge::OutputArtifact;

pub use process::ProcessLauncher;

/// Database coordinates every worker connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    pub database: String,
    pub user: String,
}

/// What a worker is told to compute
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    /// Run exactly this scenario (baseline)
    Fixed(WorkItem),
    /// Ask for scenarios over the prompt protocol until told there are none
    Interactive,
}

#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub index: usize,
    pub study: StudyKey,
    pub connection: ConnectionTarget,
    pub lock: LockToken,
    pub file_output_codes: String,
    pub map_output_codes: String,
    pub process_hint: usize,
    pub output_file: PathBuf,
    pub assignment: Assignment,
}

impl WorkerArgs {
    /// Namespaces the worker's temp files; unique per (lock count, index).
    pub fn run_id(&self) -> String {
        format!("{}_{}", self.lock.counter, self.index)
    }

    pub fn to_argv(&self) -> Vec<String> {
        let mut argv = vec![
            format!("--host={}", self.connection.host),
            format!("--database={}", self.connection.database),
            format!("--user={}", self.connection.user),
            format!("--study={}", self.study),
            format!("--lock={}", self.lock),
            format!("--run-id={}", self.run_id()),
            format!("--output-file={}", self.output_file.display()),
            format!("--file-outputs={}", self.file_output_codes),
            format!("--map-outputs={}", self.map_output_codes),
            format!("--processes={}", self.process_hint),
        ];
        match &self.assignment {
            Assignment::Fixed(item) => argv.push(format!("--scenario={}", item.scenario_id)),
            Assignment::Interactive => argv.push("--interactive".to_string()),
        }
        argv
    }
}

/// How a worker process ended. `code` is `None` when it was killed by a
/// signal or its exit could not be observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("no exit code"),
        }
    }
}

/// Channel ends connecting the coordinator to one running worker
#[derive(Debug)]
pub struct WorkerChannels {
    pub pid: Option<u32>,
    /// Lines the worker printed, in order
    pub stdout: mpsc::Receiver<String>,
    /// Reply lines for the worker's stdin
    pub stdin: mpsc::Sender<String>,
    /// Fires once, after every stdout line has been delivered
    pub exit: oneshot::Receiver<WorkerExit>,
    /// Send (or drop) to kill the worker
    pub kill: oneshot::Sender<()>,
}

pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, args: &WorkerArgs) -> Result<WorkerChannels, WorkerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Worker stdin is full")]
    Backpressure,

    #[error("Worker is no longer reading replies")]
    Closed,
}

/// Everything a worker printed plus the replies it received
#[derive(Debug, Clone)]
pub struct WorkerTranscript {
    pub run_id: String,
    pub lines: Vec<String>,
}

#[derive(Debug)]
pub struct WorkerHandle {
    args: WorkerArgs,
    run_id: String,
    pid: Option<u32>,
    stdout: mpsc::Receiver<String>,
    stdin: mpsc::Sender<String>,
    exit: oneshot::Receiver<WorkerExit>,
    kill: Option<oneshot::Sender<()>>,
    exited: Option<WorkerExit>,
    lifecycle: WorkerLifecycle,
    /// Item handed out but not yet acknowledged done
    pending_item: Option<WorkItem>,
    /// Set when the coordinator killed the worker; its exit is bookkeeping only
    ignore_next_failure: bool,
    /// Told there is no more work
    drained: bool,
    transcript: Vec<String>,
    percent: Option<f64>,
    last_message: Option<String>,
    last_activity: Instant,
}

impl WorkerHandle {
    pub fn spawn(launcher: &dyn WorkerLauncher, args: WorkerArgs) -> Result<Self, WorkerError> {
        let channels = launcher.launch(&args)?;
        Ok(Self::from_channels(args, channels))
    }

    pub fn from_channels(args: WorkerArgs, channels: WorkerChannels) -> Self {
        let pending_item = match &args.assignment {
            Assignment::Fixed(item) => Some(*item),
            Assignment::Interactive => None,
        };
        Self {
            run_id: args.run_id(),
            args,
            pid: channels.pid,
            stdout: channels.stdout,
            stdin: channels.stdin,
            exit: channels.exit,
            kill: Some(channels.kill),
            exited: None,
            lifecycle: WorkerLifecycle::Spawned,
            pending_item,
            ignore_next_failure: false,
            drained: false,
            transcript: Vec::new(),
            percent: None,
            last_message: None,
            last_activity: Instant::now(),
        }
    }

    pub fn index(&self) -> usize {
        self.args.index
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn lifecycle(&self) -> WorkerLifecycle {
        self.lifecycle
    }

    pub fn pending_item(&self) -> Option<&WorkItem> {
        self.pending_item.as_ref()
    }

    pub fn ignores_next_failure(&self) -> bool {
        self.ignore_next_failure
    }

    pub fn is_interactive(&self) -> bool {
        matches!(self.args.assignment, Assignment::Interactive)
    }

    pub fn is_live(&self) -> bool {
        !self.lifecycle.is_terminal()
    }

    /// Could this worker still claim a requeued item?
    pub fn can_take_work(&self) -> bool {
        self.is_live() && self.is_interactive() && !self.drained && !self.ignore_next_failure
    }

    pub fn artifact(&self) -> OutputArtifact {
        OutputArtifact {
            temp_path: self.args.output_file.clone(),
            owner: self.run_id.clone(),
        }
    }

    /// Next buffered stdout line, if one has arrived.
    pub fn try_next_line(&mut self) -> Option<String> {
        let line = self.stdout.try_recv().ok()?;
        self.transcript.push(line.clone());
        self.last_activity = Instant::now();
        if self.lifecycle == WorkerLifecycle::Spawned {
            self.lifecycle = if self.pending_item.is_some() {
                WorkerLifecycle::AwaitingResponse
            } else {
                WorkerLifecycle::Running
            };
        }
        Some(line)
    }

    /// Queue one reply line for the worker's stdin.
    pub fn respond(&mut self, reply: &str) -> Result<(), WorkerError> {
        self.stdin
            .try_send(reply.to_string())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => WorkerError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => WorkerError::Closed,
            })?;
        self.transcript.push(format!("> {reply}"));
        Ok(())
    }

    /// The exit notification, reported once.
    pub fn try_exit(&mut self) -> Option<WorkerExit> {
        if self.exited.is_some() {
            return None;
        }
        let exit = match self.exit.try_recv() {
            Ok(exit) => exit,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => WorkerExit { code: None },
        };
        self.exited = Some(exit);
        Some(exit)
    }

    /// Kill the process; its exit will not count as a failure.
    pub fn kill(&mut self) {
        if !self.is_live() {
            return;
        }
        self.ignore_next_failure = true;
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    pub(crate) fn assign(&mut self, item: WorkItem) {
        self.pending_item = Some(item);
        self.percent = None;
        self.lifecycle = WorkerLifecycle::AwaitingResponse;
    }

    /// Acknowledge completion of `id`; returns the item if the worker held it.
    pub(crate) fn confirm(&mut self, id: ScenarioId) -> Option<WorkItem> {
        match self.pending_item {
            Some(item) if item.scenario_id == id => {
                self.pending_item = None;
                self.percent = None;
                self.lifecycle = WorkerLifecycle::Running;
                Some(item)
            }
            _ => None,
        }
    }

    pub(crate) fn take_pending(&mut self) -> Option<WorkItem> {
        self.pending_item.take()
    }

    pub(crate) fn mark_drained(&mut self) {
        self.drained = true;
    }

    pub(crate) fn finish(&mut self, failed: bool) {
        self.lifecycle = if failed {
            WorkerLifecycle::Failed
        } else {
            WorkerLifecycle::Exited
        };
    }

    pub(crate) fn apply_status(&mut self, update: StatusUpdate) {
        match update {
            // A new scenario starting resets the percent estimate.
            StatusUpdate::Scenario(_) => self.percent = Some(0.0),
            StatusUpdate::Percent(p) => self.percent = Some(p),
            StatusUpdate::Message(message) => self.last_message = Some(message),
        }
    }

    /// Estimated cost completed on the pending item.
    pub fn pending_progress(&self) -> f64 {
        match (self.pending_item, self.percent) {
            (Some(item), Some(percent)) => item.estimated_cost as f64 * percent / 100.0,
            _ => 0.0,
        }
    }

    pub fn is_stuck(&self, stuck_after: Duration) -> bool {
        self.is_live() && self.last_activity.elapsed() >= stuck_after
    }

    pub fn snapshot(&self, stuck_after: Duration) -> WorkerSnapshot {
        WorkerSnapshot {
            index: self.args.index,
            run_id: self.run_id.clone(),
            pid: self.pid,
            lifecycle: self.lifecycle,
            pending: self.pending_item.map(|item| item.scenario_id),
            percent: self.percent,
            last_message: self.last_message.clone(),
            stuck: self.is_stuck(stuck_after),
        }
    }

    pub fn into_transcript(self) -> WorkerTranscript {
        WorkerTranscript {
            run_id: self.run_id,
            lines: self.transcript,
        }
    }
}
