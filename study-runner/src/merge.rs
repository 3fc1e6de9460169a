//! Output merge - the one synchronous hand-off after all workers finish
//!
//! Each worker writes one temp artifact named from (study, lock count, worker
//! index). POSTRUN writes a small JSON summary next to them and hands the
//! ordered list to an [`OutputMerger`]. Every temp file is deleted when the
//! coordinator exits, whether or not the run succeeded.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use study_types::{ScenarioId, StudyKey};
use tokio::process::Command;
use tracing::{info, warn};
use ulid::Ulid;

/// A worker's temp output file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputArtifact {
    pub temp_path: PathBuf,
    /// Run id of the worker that produced it
    pub owner: String,
}

impl OutputArtifact {
    pub fn temp_path(temp_dir: &Path, study: StudyKey, lock_count: i64, index: usize) -> PathBuf {
        temp_dir.join(format!("study_{study}_{lock_count}_{index}.tmp"))
    }

    pub fn summary_path(temp_dir: &Path, study: StudyKey, lock_count: i64) -> PathBuf {
        temp_dir.join(format!("study_{study}_{lock_count}_summary.json"))
    }
}

/// Delete temp files, ignoring ones that were never created.
pub async fn remove_temp_files(paths: Vec<PathBuf>) {
    for path in paths {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!(path = %path.display(), "removed temp file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), "failed to remove temp file: {e}"),
        }
    }
}

/// Locally computed facts about the run, handed to the merger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Ulid,
    pub study: StudyKey,
    pub study_name: String,
    pub lock_count: i64,
    pub worker_count: usize,
    pub process_hint: usize,
    pub total_items: usize,
    pub retired: Vec<ScenarioId>,
    pub total_cost: u64,
    pub retired_cost: u64,
    pub artifacts: Vec<OutputArtifact>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub async fn write(&self, path: &Path) -> Result<(), MergeError> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| MergeError::Summary(e.to_string()))?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| MergeError::Summary(format!("{}: {e}", path.display())))
    }
}

#[derive(Debug, thiserror::Error, Clone)]
pub enum MergeError {
    #[error("failed to write run summary: {0}")]
    Summary(String),

    #[error("failed to start output merger: {0}")]
    Spawn(String),

    #[error("output merger exited with {0}")]
    Failed(String),
}

#[async_trait]
pub trait OutputMerger: Send + Sync {
    /// Produce the final artifacts from the per-worker temp files.
    async fn merge(&self, artifacts: &[OutputArtifact], summary: &Path) -> Result<(), MergeError>;
}

/// Runs the merge executable: `<binary> --summary=<path> <artifact>...`
#[derive(Debug, Clone)]
pub struct CommandMerger {
    binary: String,
}

impl CommandMerger {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl OutputMerger for CommandMerger {
    async fn merge(&self, artifacts: &[OutputArtifact], summary: &Path) -> Result<(), MergeError> {
        let status = Command::new(&self.binary)
            .arg(format!("--summary={}", summary.display()))
            .args(artifacts.iter().map(|a| a.temp_path.as_os_str()))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| MergeError::Spawn(format!("{}: {e}", self.binary)))?;

        if status.success() {
            info!(artifacts = artifacts.len(), "output merge complete");
            Ok(())
        } else {
            let code = status
                .code()
                .map(|c| format!("exit code {c}"))
                .unwrap_or_else(|| "a signal".to_string());
            Err(MergeError::Failed(code))
        }
    }
}

/// Keep only artifacts whose temp file exists, preserving order.
pub fn existing_artifacts(artifacts: &[OutputArtifact]) -> Vec<OutputArtifact> {
    artifacts
        .iter()
        .filter(|artifact| {
            let exists = artifact.temp_path.exists();
            if !exists {
                warn!(
                    worker = %artifact.owner,
                    path = %artifact.temp_path.display(),
                    "worker produced no temp output"
                );
            }
            exists
        })
        .cloned()
        .collect()
}
