use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::task::{TaskKind, TaskResult, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTiming {
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub duration_secs: f64,
}

/// Aggregate counters across batches. Mutated only through `RunRecorder`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStatistics {
    pub total_tasks: u64,
    pub cache_hits: u64,
    pub successes: u64,
    pub failures: u64,
    pub cancelled: u64,
    pub total_duration_secs: f64,
    pub per_task_durations: Vec<TaskTiming>,
}

impl RunStatistics {
    /// (min, avg, max) over completed runs of the given kind, cache hits
    /// excluded since they cost nothing.
    pub fn timing_summary(&self, kind: TaskKind) -> Option<(f64, f64, f64)> {
        let durations: Vec<f64> = self
            .per_task_durations
            .iter()
            .filter(|t| t.kind == kind && t.status == TaskStatus::Success)
            .map(|t| t.duration_secs)
            .collect();
        if durations.is_empty() {
            return None;
        }
        let min = durations.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = durations.iter().cloned().fold(0.0, f64::max);
        let avg = durations.iter().sum::<f64>() / durations.len() as f64;
        Some((min, avg, max))
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        (self.successes + self.cache_hits) as f64 / self.total_tasks as f64 * 100.0
    }

    /// Tuning hints derived from the recorded history, printed after
    /// batch runs and in the performance report.
    pub fn recommendations(&self, workers: usize) -> Vec<String> {
        const SLOW_TASK_SECS: f64 = 60.0;
        const LARGE_LOG_TASKS: usize = 100;

        let mut hints = Vec::new();
        if workers < 4 {
            hints.push(format!(
                "worker count is {workers}, raising it toward 4 speeds up large batches"
            ));
        }
        if self.per_task_durations.len() > LARGE_LOG_TASKS {
            hints.push(
                "performance log is getting large, `apkforge optimize clear-cache` resets it"
                    .to_string(),
            );
        }
        let slow = self
            .per_task_durations
            .iter()
            .filter(|t| t.duration_secs > SLOW_TASK_SECS)
            .count();
        if slow > 0 {
            hints.push(format!(
                "{slow} operation(s) took over {SLOW_TASK_SECS:.0}s, large APKs may need more JVM heap"
            ));
        }
        hints
    }
}

/// Accumulates task outcomes behind a single lock and persists them as
/// JSON so `optimize stats` can report across invocations.
pub struct RunRecorder {
    inner: Mutex<RunStatistics>,
    store: Option<PathBuf>,
}

impl RunRecorder {
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(RunStatistics::default()),
            store: None,
        }
    }

    /// Loads prior statistics from `path`, starting fresh if the file is
    /// absent or unreadable.
    pub fn open(path: PathBuf) -> Self {
        let stats = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            inner: Mutex::new(stats),
            store: Some(path),
        }
    }

    pub fn record(&self, result: &TaskResult) {
        let mut stats = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        stats.total_tasks += 1;
        match result.status {
            TaskStatus::Hit => stats.cache_hits += 1,
            TaskStatus::Success => stats.successes += 1,
            TaskStatus::Failed => stats.failures += 1,
            TaskStatus::Cancelled => stats.cancelled += 1,
        }
        stats.total_duration_secs += result.duration.as_secs_f64();
        stats.per_task_durations.push(TaskTiming {
            kind: result.kind,
            status: result.status,
            duration_secs: result.duration.as_secs_f64(),
        });
    }

    pub fn summary(&self) -> RunStatistics {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Resets all counters. Cache contents are untouched.
    pub fn clear(&self) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = RunStatistics::default();
    }

    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.store else {
            return Ok(());
        };
        let stats = self.summary();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
            let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
            tmp.write_all(serde_json::to_string_pretty(&stats)?.as_bytes())?;
            if let Err(e) = tmp.persist(path) {
                warn!("failed to persist run statistics: {}", e.error);
            }
        }
        Ok(())
    }
}
