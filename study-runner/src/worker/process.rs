use std::process::Stdio;
use std::time::Duration;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};

use super::{WorkerArgs, WorkerChannels, WorkerError, WorkerExit, WorkerLauncher};

/// Stdout lines buffered ahead of the control loop.
const LINE_BUFFER: usize = 256;
/// A worker has at most one prompt outstanding; a little slack is plenty.
const REPLY_BUFFER: usize = 8;
/// How long to wait for stdout to reach EOF once the process has exited.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Launches the engine binary as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binary: String,
    /// Placed before the worker argv, e.g. an interpreter's script path
    leading_args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, args: &WorkerArgs) -> Result<WorkerChannels, WorkerError> {
        let run_id = args.run_id();
        let mut child = Command::new(&self.binary)
            .args(&self.leading_args)
            .args(args.to_argv())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!(worker = %run_id, binary = %self.binary, "failed to spawn worker: {e}");
                WorkerError::Spawn(e.to_string())
            })?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Spawn("worker stdout was not captured".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Spawn("worker stdin was not captured".to_string()))?;

        let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_BUFFER);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        let reader = tokio::spawn(read_lines(stdout, line_tx));
        tokio::spawn(write_replies(stdin, reply_rx, run_id.clone()));
        tokio::spawn(supervise(child, kill_rx, reader, exit_tx, run_id.clone()));

        info!(worker = %run_id, pid, "worker started");
        Ok(WorkerChannels {
            pid,
            stdout: line_rx,
            stdin: reply_tx,
            exit: exit_rx,
            kill: kill_tx,
        })
    }
}

/// Forward stdout line by line; invalid UTF-8 is replaced rather than fatal.
async fn read_lines(stdout: ChildStdout, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("worker stdout read failed: {e}");
                break;
            }
        }
    }
}

async fn write_replies(mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>, run_id: String) {
    while let Some(reply) = rx.recv().await {
        let mut line = reply.into_bytes();
        line.push(b'\n');
        if let Err(e) = stdin.write_all(&line).await {
            debug!(worker = %run_id, "worker stdin closed: {e}");
            break;
        }
        if let Err(e) = stdin.flush().await {
            debug!(worker = %run_id, "worker stdin flush failed: {e}");
            break;
        }
    }
}

/// Wait for exit or a kill request, then report the exit after stdout drains.
async fn supervise(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    reader: JoinHandle<()>,
    exit_tx: oneshot::Sender<WorkerExit>,
    run_id: String,
) {
    // A dropped kill sender means the handle is gone; treat it as a kill too.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            info!(worker = %run_id, "killing worker");
            if let Err(e) = child.kill().await {
                warn!(worker = %run_id, "failed to kill worker: {e}");
            }
            child.wait().await
        }
    };

    if timeout(STDOUT_DRAIN_TIMEOUT, reader).await.is_err() {
        warn!(worker = %run_id, "worker stdout still open after exit");
    }

    let exit = match status {
        Ok(status) => WorkerExit {
            code: status.code(),
        },
        Err(e) => {
            warn!(worker = %run_id, "failed to collect worker exit status: {e}");
            WorkerExit { code: None }
        }
    };
    info!(worker = %run_id, %exit, "worker exited");
    let _ = exit_tx.send(exit);
}
