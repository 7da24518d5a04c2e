use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::apkeditor::ApkEditor;
use crate::cache::FingerprintCache;
use crate::error::{ForgeError, Result};
use crate::pool::{default_workers, Job, WorkerPool};
use crate::runner::ToolRunner;
use crate::stats::{RunRecorder, RunStatistics};
use crate::task::{fingerprint, TaskDescriptor, TaskKind, TaskResult, TaskStatus};

#[derive(Clone)]
pub struct BatchOptions {
    pub max_workers: usize,
    pub cache_enabled: bool,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_workers: default_workers(),
            cache_enabled: true,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug)]
pub struct BatchResult {
    /// One result per input, in submission order.
    pub results: Vec<TaskResult>,
    pub stats: RunStatistics,
    /// True when every dispatched task failed. Partial failures leave this
    /// unset; the per-task results carry the detail either way.
    pub failed: bool,
}

/// Composes cache, pool and recorder: resolves tasks, skips what the
/// cache already has, dispatches the rest, and reports per-task outcomes
/// in submission order.
pub struct Orchestrator {
    cache: FingerprintCache,
    recorder: RunRecorder,
    editor: ApkEditor,
    runner: Arc<dyn ToolRunner>,
}

impl Orchestrator {
    pub fn new(
        cache: FingerprintCache,
        recorder: RunRecorder,
        editor: ApkEditor,
        runner: Arc<dyn ToolRunner>,
    ) -> Self {
        Self {
            cache,
            recorder,
            editor,
            runner,
        }
    }

    pub fn cache(&self) -> &FingerprintCache {
        &self.cache
    }

    pub fn recorder(&self) -> &RunRecorder {
        &self.recorder
    }

    pub fn editor(&self) -> &ApkEditor {
        &self.editor
    }

    pub fn runner(&self) -> &Arc<dyn ToolRunner> {
        &self.runner
    }

    pub async fn process(
        &self,
        inputs: &[PathBuf],
        kind: TaskKind,
        output_dir: &Path,
        options: &BatchOptions,
    ) -> Result<BatchResult> {
        if options.max_workers == 0 {
            return Err(ForgeError::Config(
                "worker count must be at least 1".to_string(),
            ));
        }

        let descriptors = self.resolve_tasks(inputs, kind, output_dir)?;
        let fingerprints: Vec<String> = descriptors.iter().map(|t| t.fingerprint.clone()).collect();
        std::fs::create_dir_all(output_dir)?;

        let mut slots: Vec<Option<TaskResult>> = Vec::new();
        slots.resize_with(descriptors.len(), || None);
        let mut jobs = Vec::new();

        for task in descriptors {
            let hit = if options.cache_enabled {
                match self.cache.lookup(&task.fingerprint) {
                    Ok(entry) => entry,
                    Err(e) => {
                        // corrupt record degrades to a miss, never aborts
                        warn!("{e}");
                        None
                    }
                }
            } else {
                None
            };

            match hit {
                Some(entry) => {
                    info!(
                        "cache hit for {} ({})",
                        task.input_path.display(),
                        task.kind
                    );
                    slots[task.id] = Some(TaskResult::hit(&task, entry.result_path));
                }
                None => {
                    let spec = match task.kind {
                        TaskKind::Decode => {
                            self.editor.decode_spec(&task.input_path, &task.output_path)
                        }
                        TaskKind::Build => {
                            self.editor.build_spec(&task.input_path, &task.output_path)
                        }
                    };
                    jobs.push(Job { task, spec });
                }
            }
        }

        // requested count capped by what the machine actually has
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(options.max_workers);
        let workers = options.max_workers.min(cpus.max(1));
        if !jobs.is_empty() {
            info!(
                "dispatching {} {} task(s) with {} worker(s)",
                jobs.len(),
                kind,
                workers
            );
        }

        let pool = WorkerPool::new(
            self.runner.clone(),
            workers,
            options.timeout,
            options.cancel.clone(),
        );
        for result in pool.run(jobs).await {
            if result.status == TaskStatus::Success && options.cache_enabled {
                if let Some(path) = &result.result_path {
                    if let Err(e) = self.cache.store(&fingerprints[result.task_id], path) {
                        warn!("failed to store cache entry: {e}");
                    }
                }
            }
            let task_id = result.task_id;
            slots[task_id] = Some(result);
        }

        let results: Vec<TaskResult> = slots.into_iter().flatten().collect();
        for result in &results {
            self.recorder.record(result);
        }
        if let Err(e) = self.recorder.flush() {
            warn!("failed to persist run statistics: {e}");
        }

        let dispatched: Vec<&TaskResult> = results
            .iter()
            .filter(|r| r.status != TaskStatus::Cancelled)
            .collect();
        let failed = !dispatched.is_empty()
            && dispatched.iter().all(|r| r.status == TaskStatus::Failed);

        Ok(BatchResult {
            results,
            stats: self.recorder.summary(),
            failed,
        })
    }

    fn resolve_tasks(
        &self,
        inputs: &[PathBuf],
        kind: TaskKind,
        output_dir: &Path,
    ) -> Result<Vec<TaskDescriptor>> {
        let mut seen = HashSet::new();
        let mut tasks = Vec::with_capacity(inputs.len());

        for (id, input) in inputs.iter().enumerate() {
            if !input.exists() {
                return Err(ForgeError::Input(input.clone()));
            }
            if !seen.insert(input.clone()) {
                return Err(ForgeError::DuplicateInput(input.clone()));
            }
            let fingerprint = fingerprint(kind, input)?;
            let output = output_path_for(kind, input, output_dir, &fingerprint);
            tasks.push(TaskDescriptor {
                id,
                kind,
                input_path: input.clone(),
                output_path: output,
                fingerprint,
            });
        }

        Ok(tasks)
    }
}

/// Decode writes a tree named `<stem>-<short fingerprint>` so two APKs
/// with the same file name in different directories never share an
/// artifact path; build produces `<name>-built.apk`, matching the
/// external tool's convention.
pub fn output_path_for(kind: TaskKind, input: &Path, output_dir: &Path, fingerprint: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "apk".to_string());
    match kind {
        TaskKind::Decode => {
            let digest = fingerprint.rsplit('-').next().unwrap_or(fingerprint);
            let short = &digest[..digest.len().min(8)];
            output_dir.join(format!("{stem}-{short}"))
        }
        TaskKind::Build => {
            let name = input
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or(stem);
            output_dir.join(format!("{name}-built.apk"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DEFAULT_TTL;
    use crate::runner::{CommandSpec, ProcessOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fake external tool: creates the `-o` path like APKEditor would, and
    /// fails for any input containing "corrupt".
    struct FakeTool {
        calls: AtomicUsize,
    }

    impl FakeTool {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ToolRunner for FakeTool {
        async fn run(
            &self,
            spec: &CommandSpec,
            _timeout: Option<Duration>,
        ) -> crate::error::Result<ProcessOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            let arg_after = |flag: &str| {
                spec.args
                    .iter()
                    .position(|a| a == flag)
                    .and_then(|i| spec.args.get(i + 1))
                    .cloned()
            };

            let input = arg_after("-i").unwrap_or_default();
            if input.contains("corrupt") {
                return Ok(ProcessOutcome {
                    exit_code: Some(2),
                    stdout: String::new(),
                    stderr: format!("ERROR: unable to process {input}"),
                    timed_out: false,
                });
            }

            if let Some(output) = arg_after("-o") {
                std::fs::create_dir_all(&output).unwrap();
            }
            Ok(ProcessOutcome {
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
                timed_out: false,
            })
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        tool: Arc<FakeTool>,
        _dir: tempfile::TempDir,
        root: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        let jar = root.join("APKEditor.jar");
        std::fs::write(&jar, b"jar").unwrap();
        let java = root.join("java");
        std::fs::write(&java, b"").unwrap();

        let tool = Arc::new(FakeTool::new());
        let orchestrator = Orchestrator::new(
            FingerprintCache::open(root.join("cache"), DEFAULT_TTL).unwrap(),
            RunRecorder::in_memory(),
            ApkEditor::new(jar, Some(java), vec![]).unwrap(),
            tool.clone(),
        );
        Fixture {
            orchestrator,
            tool,
            _dir: dir,
            root,
        }
    }

    fn make_apk(root: &Path, name: &str) -> PathBuf {
        let path = root.join(name);
        std::fs::write(&path, name.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn second_run_is_a_cache_hit_with_same_result_path() {
        let fx = fixture();
        let apk = make_apk(&fx.root, "app.apk");
        let out = fx.root.join("decoded");
        let options = BatchOptions::default();

        let first = fx
            .orchestrator
            .process(&[apk.clone()], TaskKind::Decode, &out, &options)
            .await
            .unwrap();
        assert_eq!(first.results[0].status, TaskStatus::Success);

        let second = fx
            .orchestrator
            .process(&[apk], TaskKind::Decode, &out, &options)
            .await
            .unwrap();
        assert_eq!(second.results[0].status, TaskStatus::Hit);
        assert_eq!(second.results[0].result_path, first.results[0].result_path);
        assert_eq!(fx.tool.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_disabled_always_dispatches() {
        let fx = fixture();
        let apk = make_apk(&fx.root, "app.apk");
        let out = fx.root.join("decoded");

        let cached = BatchOptions::default();
        fx.orchestrator
            .process(&[apk.clone()], TaskKind::Decode, &out, &cached)
            .await
            .unwrap();

        let uncached = BatchOptions {
            cache_enabled: false,
            ..BatchOptions::default()
        };
        let result = fx
            .orchestrator
            .process(&[apk], TaskKind::Decode, &out, &uncached)
            .await
            .unwrap();
        assert_eq!(result.results[0].status, TaskStatus::Success);
        assert_eq!(fx.tool.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn partial_failure_returns_both_results() {
        let fx = fixture();
        let good = make_apk(&fx.root, "app.apk");
        let bad = make_apk(&fx.root, "corrupt.apk");
        let out = fx.root.join("decoded");

        let batch = fx
            .orchestrator
            .process(&[good, bad], TaskKind::Decode, &out, &BatchOptions::default())
            .await
            .unwrap();

        assert!(!batch.failed);
        assert_eq!(batch.results[0].status, TaskStatus::Success);
        assert_eq!(batch.results[1].status, TaskStatus::Failed);
        let detail = batch.results[1].error_detail.as_deref().unwrap();
        assert!(detail.contains("exited with status"));
        assert!(detail.contains("unable to process"));
    }

    #[tokio::test]
    async fn all_failed_marks_batch_failed() {
        let fx = fixture();
        let bad = make_apk(&fx.root, "corrupt.apk");
        let out = fx.root.join("decoded");

        let batch = fx
            .orchestrator
            .process(&[bad], TaskKind::Decode, &out, &BatchOptions::default())
            .await
            .unwrap();
        assert!(batch.failed);
        assert_eq!(batch.results.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_inputs_are_rejected_without_dispatch() {
        let fx = fixture();
        let apk = make_apk(&fx.root, "app.apk");
        let out = fx.root.join("decoded");

        let err = fx
            .orchestrator
            .process(
                &[apk.clone(), apk],
                TaskKind::Decode,
                &out,
                &BatchOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::DuplicateInput(_)));
        assert_eq!(fx.tool.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_input_is_rejected_before_dispatch() {
        let fx = fixture();
        let out = fx.root.join("decoded");
        let err = fx
            .orchestrator
            .process(
                &[fx.root.join("ghost.apk")],
                TaskKind::Decode,
                &out,
                &BatchOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Input(_)));
    }

    #[tokio::test]
    async fn zero_workers_is_a_config_error() {
        let fx = fixture();
        let apk = make_apk(&fx.root, "app.apk");
        let options = BatchOptions {
            max_workers: 0,
            ..BatchOptions::default()
        };
        let err = fx
            .orchestrator
            .process(&[apk], TaskKind::Decode, &fx.root.join("out"), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Config(_)));
    }

    #[tokio::test]
    async fn corrupt_cache_record_degrades_to_dispatch() {
        let fx = fixture();
        let apk = make_apk(&fx.root, "app.apk");
        let out = fx.root.join("decoded");
        let options = BatchOptions::default();

        fx.orchestrator
            .process(&[apk.clone()], TaskKind::Decode, &out, &options)
            .await
            .unwrap();

        // clobber the record on disk
        let fp = crate::task::fingerprint(TaskKind::Decode, &apk).unwrap();
        let record = fx.root.join("cache").join("entries").join(format!("{fp}.json"));
        std::fs::write(&record, "garbage").unwrap();

        let batch = fx
            .orchestrator
            .process(&[apk], TaskKind::Decode, &out, &options)
            .await
            .unwrap();
        assert_eq!(batch.results[0].status, TaskStatus::Success);
        assert_eq!(fx.tool.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn recorder_sees_every_outcome() {
        let fx = fixture();
        let good = make_apk(&fx.root, "app.apk");
        let bad = make_apk(&fx.root, "corrupt.apk");
        let out = fx.root.join("decoded");
        let options = BatchOptions::default();

        fx.orchestrator
            .process(&[good.clone(), bad], TaskKind::Decode, &out, &options)
            .await
            .unwrap();
        fx.orchestrator
            .process(&[good], TaskKind::Decode, &out, &options)
            .await
            .unwrap();

        let stats = fx.orchestrator.recorder().summary();
        assert_eq!(stats.total_tasks, 3);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.cache_hits, 1);
    }

    #[test]
    fn output_paths_follow_tool_conventions() {
        let out = Path::new("/tmp/out");
        assert_eq!(
            output_path_for(
                TaskKind::Decode,
                Path::new("/apks/app.apk"),
                out,
                "decode-0123456789abcdef",
            ),
            out.join("app-01234567")
        );
        assert_eq!(
            output_path_for(
                TaskKind::Build,
                Path::new("/decoded/app"),
                out,
                "build-0123456789abcdef",
            ),
            out.join("app-built.apk")
        );
    }

    #[tokio::test]
    async fn same_named_apks_from_different_dirs_get_distinct_artifacts() {
        let fx = fixture();
        std::fs::create_dir_all(fx.root.join("a")).unwrap();
        std::fs::create_dir_all(fx.root.join("b")).unwrap();
        let first = make_apk(&fx.root, "a/app.apk");
        let second = make_apk(&fx.root, "b/app.apk");
        let out = fx.root.join("decoded");
        let options = BatchOptions::default();

        let batch = fx
            .orchestrator
            .process(&[first.clone(), second], TaskKind::Decode, &out, &options)
            .await
            .unwrap();
        assert_eq!(batch.results[0].status, TaskStatus::Success);
        assert_eq!(batch.results[1].status, TaskStatus::Success);
        assert_ne!(batch.results[0].result_path, batch.results[1].result_path);

        // a later hit for either input still resolves to its own tree
        let again = fx
            .orchestrator
            .process(&[first], TaskKind::Decode, &out, &options)
            .await
            .unwrap();
        assert_eq!(again.results[0].status, TaskStatus::Hit);
        assert_eq!(again.results[0].result_path, batch.results[0].result_path);
    }
}
