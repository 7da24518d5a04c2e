use std::path::PathBuf;

use thiserror::Error;

/// Failure taxonomy for the batch core. Per-task failures travel as data
/// inside `TaskResult`; only pre-dispatch errors surface through this type.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("input path does not exist or is unreadable: {0}")]
    Input(PathBuf),

    #[error("duplicate input path: {0}")]
    DuplicateInput(PathBuf),

    #[error("cache record for {fingerprint} could not be parsed: {reason}")]
    CacheCorrupt { fingerprint: String, reason: String },

    #[error("{tool} exited with status {code:?}: {stderr}")]
    ExternalTool {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{tool} timed out after {seconds}s")]
    Timeout { tool: String, seconds: u64 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ForgeError>;
