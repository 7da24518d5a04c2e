use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::ForgeError;
use crate::runner::{CommandSpec, ToolRunner};
use crate::task::{TaskDescriptor, TaskResult};

/// A descriptor paired with the external invocation that satisfies it.
pub struct Job {
    pub task: TaskDescriptor,
    pub spec: CommandSpec,
}

/// Default worker count, matching the external tool's appetite: up to
/// four JVMs at once, fewer on small machines.
pub fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    cpus.min(4)
}

/// Bounded-concurrency executor for external tool invocations.
///
/// Results come back in submission order regardless of completion order,
/// one task's failure never cancels its siblings, and every failure is
/// returned as data rather than an error. Cancelling the token stops
/// dispatch of not-yet-started jobs; in-flight processes run to
/// completion unless the per-task timeout kills them first.
pub struct WorkerPool {
    runner: Arc<dyn ToolRunner>,
    max_workers: usize,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        max_workers: usize,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            max_workers: max_workers.max(1),
            timeout,
            cancel,
        }
    }

    pub async fn run(&self, jobs: Vec<Job>) -> Vec<TaskResult> {
        let sem = Arc::new(Semaphore::new(self.max_workers));

        let futures = jobs.into_iter().map(|job| {
            let sem = sem.clone();
            let runner = self.runner.clone();
            let cancel = self.cancel.clone();
            let timeout = self.timeout;

            async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return TaskResult::cancelled(&job.task),
                    permit = sem.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return TaskResult::cancelled(&job.task),
                    },
                };
                if cancel.is_cancelled() {
                    return TaskResult::cancelled(&job.task);
                }

                debug!("dispatching {} task for {}", job.task.kind, job.task.input_path.display());
                let start = Instant::now();
                match runner.run(&job.spec, timeout).await {
                    Ok(outcome) if outcome.success() => {
                        TaskResult::success(&job.task, start.elapsed())
                    }
                    Ok(outcome) if outcome.timed_out => {
                        warn!("{} timed out for {}", job.spec.program, job.task.input_path.display());
                        let detail = ForgeError::Timeout {
                            tool: job.spec.program.clone(),
                            seconds: timeout.map(|t| t.as_secs()).unwrap_or(0),
                        };
                        TaskResult::failed(&job.task, start.elapsed(), detail.to_string())
                    }
                    Ok(outcome) => {
                        let detail = ForgeError::ExternalTool {
                            tool: job.spec.program.clone(),
                            code: outcome.exit_code,
                            stderr: outcome.error_text(),
                        };
                        TaskResult::failed(&job.task, start.elapsed(), detail.to_string())
                    }
                    Err(e) => TaskResult::failed(&job.task, start.elapsed(), e.to_string()),
                }
            }
        });

        futures_util::future::join_all(futures).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::runner::ProcessOutcome;
    use crate::task::{TaskKind, TaskStatus};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fake runner: fails when the program is "fail", sleeps when the
    /// program is "slow", reports a timeout when it is "hang", succeeds
    /// otherwise.
    struct FakeRunner {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeRunner {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ToolRunner for FakeRunner {
        async fn run(
            &self,
            spec: &CommandSpec,
            _timeout: Option<Duration>,
        ) -> Result<ProcessOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if spec.program == "slow" {
                tokio::time::sleep(Duration::from_millis(100)).await;
            } else {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if spec.program == "hang" {
                Ok(ProcessOutcome {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    timed_out: true,
                })
            } else if spec.program == "fail" {
                Ok(ProcessOutcome {
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: format!("tool failed on {}", spec.args.join(" ")),
                    timed_out: false,
                })
            } else {
                Ok(ProcessOutcome {
                    exit_code: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                    timed_out: false,
                })
            }
        }
    }

    fn job(id: usize, program: &str) -> Job {
        let dir = std::env::temp_dir();
        Job {
            task: TaskDescriptor {
                id,
                kind: TaskKind::Decode,
                input_path: dir.join(format!("in-{id}.apk")),
                output_path: dir.join(format!("out-{id}")),
                fingerprint: format!("decode-{id}"),
            },
            spec: CommandSpec::new(program).arg(format!("{id}")),
        }
    }

    #[tokio::test]
    async fn results_preserve_submission_order() {
        let runner = Arc::new(FakeRunner::new());
        let pool = WorkerPool::new(runner, 1, None, CancellationToken::new());

        // first job is slow, later ones fast; order must still hold
        let jobs = vec![job(0, "slow"), job(1, "ok"), job(2, "ok")];
        let results = pool.run(jobs).await;
        let ids: Vec<usize> = results.iter().map(|r| r.task_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(results.iter().all(|r| r.status == TaskStatus::Success));
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_max_workers() {
        let runner = Arc::new(FakeRunner::new());
        let pool = WorkerPool::new(runner.clone(), 2, None, CancellationToken::new());

        let jobs = (0..6).map(|i| job(i, "slow")).collect();
        pool.run(jobs).await;
        assert!(runner.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn one_failure_does_not_cancel_siblings() {
        let runner = Arc::new(FakeRunner::new());
        let pool = WorkerPool::new(runner, 2, None, CancellationToken::new());

        let jobs = vec![job(0, "ok"), job(1, "fail"), job(2, "ok")];
        let results = pool.run(jobs).await;
        assert_eq!(results[0].status, TaskStatus::Success);
        assert_eq!(results[1].status, TaskStatus::Failed);
        assert_eq!(results[2].status, TaskStatus::Success);
        assert!(results[1]
            .error_detail
            .as_deref()
            .unwrap()
            .contains("tool failed"));
    }

    #[tokio::test]
    async fn failure_details_name_the_tool_and_exit_status() {
        let runner = Arc::new(FakeRunner::new());
        let pool = WorkerPool::new(
            runner,
            2,
            Some(Duration::from_secs(5)),
            CancellationToken::new(),
        );

        let results = pool.run(vec![job(0, "fail"), job(1, "hang")]).await;
        assert_eq!(results[0].status, TaskStatus::Failed);
        assert_eq!(
            results[0].error_detail.as_deref().unwrap(),
            "fail exited with status Some(1): tool failed on 0"
        );
        assert_eq!(results[1].status, TaskStatus::Failed);
        assert_eq!(
            results[1].error_detail.as_deref().unwrap(),
            "hang timed out after 5s"
        );
    }

    #[tokio::test]
    async fn cancellation_skips_undispatched_jobs() {
        let runner = Arc::new(FakeRunner::new());
        let cancel = CancellationToken::new();
        let pool = WorkerPool::new(runner.clone(), 1, None, cancel.clone());

        // cancel while the first slow job is still running
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });

        let jobs = vec![job(0, "slow"), job(1, "ok"), job(2, "ok")];
        let results = pool.run(jobs).await;
        canceller.await.unwrap();

        // in-flight job finished, the queued ones were never dispatched
        assert_eq!(results[0].status, TaskStatus::Success);
        assert_eq!(results[1].status, TaskStatus::Cancelled);
        assert_eq!(results[2].status, TaskStatus::Cancelled);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pool_clamps_zero_workers_to_one() {
        let runner = Arc::new(FakeRunner::new());
        let pool = WorkerPool::new(runner, 0, None, CancellationToken::new());
        let results = pool.run(vec![job(0, "ok")]).await;
        assert_eq!(results[0].status, TaskStatus::Success);
    }
}
