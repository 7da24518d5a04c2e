use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{FingerprintCache, DEFAULT_TTL};
use crate::error::{ForgeError, Result};
use crate::pool::default_workers;

macro_rules! override_fields {
    ($base:expr, $over:expr, $($field:ident),*) => {
        $(
            if let Some(ref $field) = $over.$field {
                $base.$field = Some($field.clone());
            }
        )*
    };
}

/// On-disk configuration (`apkforge.json`, JSON5). Every field is
/// optional; CLI flags override whatever the file provides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeConfig {
    pub workers: Option<usize>,
    #[serde(rename = "cacheTtlHours")]
    pub cache_ttl_hours: Option<u64>,
    #[serde(rename = "taskTimeoutSecs")]
    pub task_timeout_secs: Option<u64>,
    #[serde(rename = "cacheDir")]
    pub cache_dir: Option<String>,
    pub java: Option<String>,
    #[serde(rename = "jvmArgs")]
    pub jvm_args: Option<Vec<String>>,
    #[serde(rename = "gadgetCommand")]
    pub gadget_command: Option<String>,
    #[serde(rename = "fridaVersion")]
    pub frida_version: Option<String>,
}

impl ForgeConfig {
    /// Walks up from `start_dir` looking for `apkforge.json`; no file
    /// anywhere means defaults.
    pub fn discover(start_dir: PathBuf) -> Result<Self> {
        let mut current = start_dir;
        loop {
            let candidate = current.join("apkforge.json");
            if candidate.exists() {
                let raw = std::fs::read_to_string(&candidate)?;
                return json5::from_str(&raw)
                    .map_err(|e| ForgeError::Config(format!("{}: {e}", candidate.display())));
            }
            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok(Self::default()),
            }
        }
    }

    /// File values overridden by CLI values, then validated. Fatal before
    /// any dispatch happens.
    pub fn resolve(mut self, cli: &CliOverrides) -> Result<ResolvedConfig> {
        override_fields!(self, cli, workers, task_timeout_secs);

        let workers = self.workers.unwrap_or_else(default_workers);
        if workers == 0 {
            return Err(ForgeError::Config(
                "worker count must be at least 1".to_string(),
            ));
        }

        let ttl = match self.cache_ttl_hours {
            Some(0) => {
                return Err(ForgeError::Config(
                    "cache TTL must be greater than zero".to_string(),
                ))
            }
            Some(hours) => Duration::from_secs(hours * 3600),
            None => DEFAULT_TTL,
        };

        let timeout = match self.task_timeout_secs {
            Some(0) => {
                return Err(ForgeError::Config(
                    "task timeout must be greater than zero".to_string(),
                ))
            }
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        Ok(ResolvedConfig {
            workers,
            ttl,
            timeout,
            cache_dir: self
                .cache_dir
                .map(PathBuf::from)
                .unwrap_or_else(FingerprintCache::default_root),
            java: self.java.map(PathBuf::from),
            jvm_args: self.jvm_args.unwrap_or_default(),
            gadget_command: self
                .gadget_command
                .unwrap_or_else(|| "apkforge-gadget".to_string()),
            frida_version: self.frida_version,
        })
    }
}

/// The subset of settings the CLI may override.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub workers: Option<usize>,
    pub task_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub workers: usize,
    pub ttl: Duration,
    pub timeout: Option<Duration>,
    pub cache_dir: PathBuf,
    pub java: Option<PathBuf>,
    pub jvm_args: Vec<String>,
    pub gadget_command: String,
    pub frida_version: Option<String>,
}
