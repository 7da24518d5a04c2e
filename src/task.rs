use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ForgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Decode,
    Build,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Decode => "decode",
            TaskKind::Build => "build",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Satisfied from the fingerprint cache without dispatch.
    Hit,
    Success,
    Failed,
    /// Never dispatched because the batch was cancelled first.
    Cancelled,
}

/// One unit of work: a single external decode or build invocation.
/// Immutable once created; `id` is the submission index within the batch.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub id: usize,
    pub kind: TaskKind,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub fingerprint: String,
}

/// Outcome of one task, produced exactly once.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: usize,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub duration: Duration,
    pub result_path: Option<PathBuf>,
    pub error_detail: Option<String>,
}

impl TaskResult {
    pub fn hit(task: &TaskDescriptor, result_path: PathBuf) -> Self {
        Self {
            task_id: task.id,
            kind: task.kind,
            status: TaskStatus::Hit,
            duration: Duration::ZERO,
            result_path: Some(result_path),
            error_detail: None,
        }
    }

    pub fn success(task: &TaskDescriptor, duration: Duration) -> Self {
        Self {
            task_id: task.id,
            kind: task.kind,
            status: TaskStatus::Success,
            duration,
            result_path: Some(task.output_path.clone()),
            error_detail: None,
        }
    }

    pub fn failed(task: &TaskDescriptor, duration: Duration, detail: String) -> Self {
        Self {
            task_id: task.id,
            kind: task.kind,
            status: TaskStatus::Failed,
            duration,
            result_path: None,
            error_detail: Some(detail),
        }
    }

    pub fn cancelled(task: &TaskDescriptor) -> Self {
        Self {
            task_id: task.id,
            kind: task.kind,
            status: TaskStatus::Cancelled,
            duration: Duration::ZERO,
            result_path: None,
            error_detail: None,
        }
    }
}

/// Deterministic cache key for a task input: SHA-256 over the path, the
/// file size and the modification time, namespaced by the operation so a
/// decode and a build of the same path never collide.
pub fn fingerprint(kind: TaskKind, path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path).map_err(|_| ForgeError::Input(path.to_path_buf()))?;
    let mtime_nanos = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(meta.len().to_le_bytes());
    hasher.update(mtime_nanos.to_le_bytes());
    Ok(format!("{}-{:x}", kind.as_str(), hasher.finalize()))
}

pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
