use std::fmt::Write as _;
use std::path::Path;

use study_types::{LockToken, RunOutcome, RunPhase, StudyKey};
use ulid::Ulid;

use crate::queue::WorkLedger;
use crate::worker::WorkerTranscript;

/// Final account of a run, produced at EXIT
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Ulid,
    pub study: StudyKey,
    pub outcome: RunOutcome,
    /// Every phase entered, in order
    pub phases: Vec<RunPhase>,
    /// Token the run started from
    pub initial_token: LockToken,
    /// Token presented to the release, if the run ever held the lock
    pub released_from: Option<LockToken>,
    pub lock_released: bool,
    pub ledger: WorkLedger,
    pub transcripts: Vec<WorkerTranscript>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn visited(&self, phase: RunPhase) -> bool {
        self.phases.contains(&phase)
    }

    pub fn status_line(&self) -> String {
        match &self.outcome {
            RunOutcome::Failed(failure) => format!("Study run failed: {}", failure.message),
            _ => format!(
                "Study run complete: {} of {} scenarios",
                self.ledger.retired_items(),
                self.ledger.total_items
            ),
        }
    }

    /// Write every worker transcript to `path`, one section per worker.
    pub async fn export_transcripts(&self, path: &Path) -> std::io::Result<()> {
        let mut out = String::new();
        for transcript in &self.transcripts {
            let _ = writeln!(out, "== worker {} ==", transcript.run_id);
            for line in &transcript.lines {
                let _ = writeln!(out, "{line}");
            }
        }
        tokio::fs::write(path, out).await
    }
}
