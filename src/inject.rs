use anyhow::{Context, Result};
use log::{info, warn};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::error::ForgeError;
use crate::orchestrator::{BatchOptions, Orchestrator};
use crate::runner::CommandSpec;
use crate::task::{TaskKind, TaskStatus};

pub struct InjectOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub abi: String,
    pub library_name: String,
    pub script: Option<PathBuf>,
    pub cache_enabled: bool,
    pub keep_temp: bool,
}

/// Host-side Android tooling located up front so a missing tool fails
/// before any work starts.
pub struct SignTools {
    pub zipalign: PathBuf,
    pub apksigner: PathBuf,
    pub keytool: PathBuf,
}

impl SignTools {
    pub fn discover() -> Result<Self> {
        let apksigner = if cfg!(target_os = "windows") {
            "apksigner.bat"
        } else {
            "apksigner"
        };
        Ok(Self {
            zipalign: which::which("zipalign").context("zipalign not found in PATH")?,
            apksigner: which::which(apksigner).context("apksigner not found in PATH")?,
            keytool: which::which("keytool").context("keytool not found in PATH")?,
        })
    }
}

/// The primary pipeline: decode (cached) → gadget packaging (opaque
/// external step) → rebuild → zipalign → sign → move to the requested
/// output. Every binary transform happens in an external tool; this
/// struct only sequences them and tracks the intermediate paths.
pub struct Injector {
    orchestrator: Orchestrator,
    tools: SignTools,
    gadget_command: String,
    batch: BatchOptions,
}

impl Injector {
    pub fn new(
        orchestrator: Orchestrator,
        tools: SignTools,
        gadget_command: String,
        batch: BatchOptions,
    ) -> Self {
        Self {
            orchestrator,
            tools,
            gadget_command,
            batch,
        }
    }

    pub async fn run(&self, options: &InjectOptions, gadget_path: &Path) -> Result<()> {
        let started = Instant::now();
        info!("🚀 Patching {} with the Frida gadget...", options.input.display());

        let temp_root = std::env::temp_dir().join(format!("apkforge-{}", random_string(12)));
        std::fs::create_dir_all(&temp_root)?;

        let result = self.run_pipeline(options, gadget_path, &temp_root).await;

        if options.keep_temp {
            info!("→ Keeping work directory: {}", temp_root.display());
        } else if let Err(e) = std::fs::remove_dir_all(&temp_root) {
            warn!("failed to clean up {}: {e}", temp_root.display());
        }

        result?;
        info!(
            "✅ APK patched in {:.1}s: {}",
            started.elapsed().as_secs_f64(),
            options.output.display()
        );
        Ok(())
    }

    async fn run_pipeline(
        &self,
        options: &InjectOptions,
        gadget_path: &Path,
        temp_root: &Path,
    ) -> Result<()> {
        // 1. Decode into the cache's artifact area so a second run of the
        // same APK skips straight to injection.
        let decoded = self.decode(options).await?;

        // 2. Copy the pristine tree into the work dir; the gadget step
        // mutates its copy, never the cached artifact.
        let work_tree = temp_root.join(
            decoded
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "decoded".into()),
        );
        copy_dir_all(&decoded, &work_tree)?;

        // 3. Entry activity, for the gadget step's smali patching.
        let entry_activity = self.entry_activity(&options.input).await;

        // 4. Gadget packaging: inject the library and patch the manifest.
        self.run_gadget_step(options, gadget_path, &work_tree, entry_activity)
            .await?;

        // 5. Rebuild. The tree was just mutated, so its fingerprint is
        // fresh every time; caching the build would only litter records.
        let built = self.build(&work_tree, temp_root).await?;

        // 6. zipalign, debug key on first use, sign, deliver.
        let aligned = temp_root.join("aligned.apk");
        info!("📦 Zipaligning...");
        self.run_step(
            CommandSpec::new(self.tools.zipalign.to_string_lossy().into_owned())
                .args(["-p", "4"])
                .arg_path(&built)
                .arg_path(&aligned),
        )
        .await?;

        let key_path = self.orchestrator.cache().root().join("debug.keystore");
        if !key_path.exists() {
            info!("🔑 Generating debug keystore...");
            self.run_step(keytool_spec(&self.tools.keytool, &key_path)).await?;
        }

        info!("✍️ Signing...");
        self.run_step(
            CommandSpec::new(self.tools.apksigner.to_string_lossy().into_owned())
                .arg("sign")
                .arg("--ks")
                .arg_path(&key_path)
                .args(["--ks-pass", "pass:android"])
                .args(["--ks-key-alias", "androiddebugkey"])
                .arg_path(&aligned),
        )
        .await?;

        move_file(&aligned, &options.output)?;
        Ok(())
    }

    async fn decode(&self, options: &InjectOptions) -> Result<PathBuf> {
        let batch = BatchOptions {
            cache_enabled: options.cache_enabled,
            ..self.batch.clone()
        };
        let artifacts = self.orchestrator.cache().artifacts_dir();
        let batch_result = self
            .orchestrator
            .process(
                std::slice::from_ref(&options.input),
                TaskKind::Decode,
                &artifacts,
                &batch,
            )
            .await?;

        let result = &batch_result.results[0];
        match result.status {
            TaskStatus::Hit => info!("📋 Using cached decode"),
            TaskStatus::Success => info!("✅ Decoded in {:.1}s", result.duration.as_secs_f64()),
            _ => anyhow::bail!(
                "decode failed: {}",
                result.error_detail.as_deref().unwrap_or("unknown error")
            ),
        }
        result
            .result_path
            .clone()
            .context("decode produced no output path")
    }

    async fn build(&self, work_tree: &Path, temp_root: &Path) -> Result<PathBuf> {
        let batch = BatchOptions {
            cache_enabled: false,
            ..self.batch.clone()
        };
        let inputs = [work_tree.to_path_buf()];
        let batch_result = self
            .orchestrator
            .process(&inputs, TaskKind::Build, temp_root, &batch)
            .await?;

        let result = &batch_result.results[0];
        if result.status != TaskStatus::Success {
            anyhow::bail!(
                "build failed: {}",
                result.error_detail.as_deref().unwrap_or("unknown error")
            );
        }
        info!("✅ Built in {:.1}s", result.duration.as_secs_f64());
        result
            .result_path
            .clone()
            .context("build produced no output path")
    }

    /// Asks APKEditor for the main activity; a failure here only costs
    /// the gadget step its hint.
    async fn entry_activity(&self, input: &Path) -> Option<String> {
        let spec = self.orchestrator.editor().info_spec(input);
        match self.orchestrator.runner().run(&spec, self.batch.timeout).await {
            Ok(outcome) if outcome.success() => {
                let entry = outcome
                    .stdout
                    .lines()
                    .find_map(|l| l.trim().strip_prefix("activity-main="))
                    .map(|s| s.trim_matches('"').to_string())?;
                info!("🔍 Entry activity: {entry}");
                Some(entry)
            }
            _ => {
                warn!("could not determine entry activity, gadget step will search on its own");
                None
            }
        }
    }

    async fn run_gadget_step(
        &self,
        options: &InjectOptions,
        gadget_path: &Path,
        work_tree: &Path,
        entry_activity: Option<String>,
    ) -> Result<()> {
        info!("🔧 Injecting gadget library...");
        let mut spec = CommandSpec::new(self.gadget_command.clone())
            .arg("--dir")
            .arg_path(work_tree)
            .arg("--gadget")
            .arg_path(gadget_path)
            .arg("--abi")
            .arg(options.abi.clone())
            .arg("--library-name")
            .arg(options.library_name.clone());
        if let Some(entry) = entry_activity {
            spec = spec.arg("--entry-activity").arg(entry);
        }
        if let Some(script) = &options.script {
            spec = spec.arg("--script").arg_path(script);
        }
        self.run_step(spec).await
    }

    /// One sequential external step; non-zero exit or timeout is fatal
    /// for the pipeline (unlike batch tasks, there are no siblings to
    /// keep alive).
    async fn run_step(&self, spec: CommandSpec) -> Result<()> {
        let outcome = self
            .orchestrator
            .runner()
            .run(&spec, self.batch.timeout)
            .await
            .with_context(|| format!("failed to run {}", spec.program))?;
        if outcome.timed_out {
            return Err(ForgeError::Timeout {
                tool: spec.program,
                seconds: self.batch.timeout.map(|t| t.as_secs()).unwrap_or(0),
            }
            .into());
        }
        if !outcome.success() {
            return Err(ForgeError::ExternalTool {
                tool: spec.program,
                code: outcome.exit_code,
                stderr: outcome.error_text(),
            }
            .into());
        }
        Ok(())
    }
}

fn keytool_spec(keytool: &Path, key_path: &Path) -> CommandSpec {
    CommandSpec::new(keytool.to_string_lossy().into_owned())
        .args(["-genkey", "-v", "-keystore"])
        .arg_path(key_path)
        .args(["-storepass", "android"])
        .args(["-alias", "androiddebugkey"])
        .args(["-keypass", "android"])
        .args(["-keyalg", "RSA"])
        .args(["-keysize", "2048"])
        .args(["-validity", "10000"])
        .args(["-dname", "C=US, O=Android, CN=Android Debug"])
}

fn copy_dir_all(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Rename, falling back to copy+remove across filesystems.
fn move_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    match std::fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(src, dest)?;
            std::fs::remove_file(src)
        }
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
