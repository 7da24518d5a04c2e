use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod apkeditor;
mod cache;
mod config;
mod downloader;
mod error;
mod inject;
mod orchestrator;
mod pool;
mod runner;
mod stats;
mod task;

use apkeditor::ApkEditor;
use cache::FingerprintCache;
use config::{CliOverrides, ForgeConfig, ResolvedConfig};
use downloader::Downloader;
use inject::{InjectOptions, Injector, SignTools};
use orchestrator::{BatchOptions, Orchestrator};
use runner::SystemRunner;
use stats::RunRecorder;
use task::{TaskKind, TaskStatus};

#[derive(Parser)]
#[command(name = "apkforge")]
#[command(about = "Inject a Frida gadget into Android APKs with cached, parallel APKEditor processing", long_about = None)]
#[command(version = "0.1.0")]
struct Cli {
    /// Verbose logging (per-task error detail, debug output)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Patch an APK with the Frida gadget
    Inject {
        /// Input APK path
        #[arg(short, long)]
        input: PathBuf,
        /// Output APK path
        #[arg(short, long)]
        output: PathBuf,
        /// Android ABI to target
        #[arg(long = "arch", default_value = "arm64-v8a")]
        abi: String,
        /// Name of the injected gadget library
        #[arg(long, default_value = "frida-gadget")]
        library_name: String,
        /// Frida script to bundle alongside the gadget
        #[arg(long)]
        script: Option<PathBuf>,
        /// Skip the decode cache
        #[arg(long)]
        no_cache: bool,
        /// Do not download tools; use whatever is already cached
        #[arg(long)]
        offline: bool,
        /// Maximum parallel workers
        #[arg(short, long)]
        workers: Option<usize>,
        /// Hard per-task timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Keep the temporary work directory for inspection
        #[arg(long)]
        keep_temp: bool,
    },
    /// Batch APKEditor operations and performance reporting
    Optimize {
        #[command(subcommand)]
        action: OptimizeAction,
    },
}

#[derive(Subcommand)]
enum OptimizeAction {
    /// Decode APKs in parallel
    Decode {
        /// Input APK files
        #[arg(short, long, num_args = 1.., required = true)]
        input: Vec<PathBuf>,
        /// Output directory for decoded trees
        #[arg(short, long)]
        output_dir: PathBuf,
        /// Maximum parallel workers
        #[arg(short, long)]
        workers: Option<usize>,
        /// Skip the fingerprint cache
        #[arg(long)]
        no_cache: bool,
        /// Hard per-task timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Strip signing metadata and unused directories from decoded trees
        #[arg(long)]
        optimize_resources: bool,
    },
    /// Build decoded trees in parallel
    Build {
        /// Input decoded-tree directories
        #[arg(short, long, num_args = 1.., required = true)]
        input: Vec<PathBuf>,
        /// Output directory for rebuilt APKs
        #[arg(short, long)]
        output_dir: PathBuf,
        /// Maximum parallel workers
        #[arg(short, long)]
        workers: Option<usize>,
        /// Skip the fingerprint cache
        #[arg(long)]
        no_cache: bool,
        /// Hard per-task timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show recorded performance statistics
    Stats,
    /// Clear cached results and recorded statistics
    ClearCache,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    match cli.command {
        Commands::Inject {
            input,
            output,
            abi,
            library_name,
            script,
            no_cache,
            offline,
            workers,
            timeout,
            keep_temp,
        } => {
            let config = load_config(workers, timeout)?;
            let options = InjectOptions {
                input,
                output,
                abi,
                library_name,
                script,
                cache_enabled: !no_cache,
                keep_temp,
            };
            run_inject(config, options, offline).await?;
        }
        Commands::Optimize { action } => match action {
            OptimizeAction::Decode {
                input,
                output_dir,
                workers,
                no_cache,
                timeout,
                optimize_resources,
            } => {
                let config = load_config(workers, timeout)?;
                run_batch(
                    config,
                    TaskKind::Decode,
                    input,
                    output_dir,
                    no_cache,
                    optimize_resources,
                    cli.verbose,
                )
                .await?;
            }
            OptimizeAction::Build {
                input,
                output_dir,
                workers,
                no_cache,
                timeout,
            } => {
                let config = load_config(workers, timeout)?;
                run_batch(
                    config,
                    TaskKind::Build,
                    input,
                    output_dir,
                    no_cache,
                    false,
                    cli.verbose,
                )
                .await?;
            }
            OptimizeAction::Stats => {
                let config = load_config(None, None)?;
                show_stats(config)?;
            }
            OptimizeAction::ClearCache => {
                let config = load_config(None, None)?;
                clear_cache(config)?;
            }
        },
    }

    Ok(())
}

fn load_config(workers: Option<usize>, timeout: Option<u64>) -> Result<ResolvedConfig> {
    let file = ForgeConfig::discover(std::env::current_dir()?)?;
    let overrides = CliOverrides {
        workers,
        task_timeout_secs: timeout,
    };
    Ok(file.resolve(&overrides)?)
}

fn open_orchestrator(config: &ResolvedConfig, jar: PathBuf) -> Result<Orchestrator> {
    let cache = FingerprintCache::open(config.cache_dir.clone(), config.ttl)?;
    let recorder = RunRecorder::open(config.cache_dir.join("performance.json"));
    let editor = ApkEditor::new(jar, config.java.clone(), config.jvm_args.clone())?;
    Ok(Orchestrator::new(cache, recorder, editor, Arc::new(SystemRunner)))
}

/// Ctrl+C stops dispatch of queued tasks; in-flight tool invocations run
/// to completion.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Cancellation requested, letting in-flight tasks finish...");
            signal_token.cancel();
        }
    });
    token
}

async fn run_inject(config: ResolvedConfig, options: InjectOptions, offline: bool) -> Result<()> {
    let downloader = Downloader::new(config.cache_dir.join("tools"));

    let (jar, gadget) = if offline {
        warn!("Offline mode: skipping tool update checks");
        let jar = downloader
            .find_apkeditor()
            .context("APKEditor jar not cached; run once without --offline")?;
        let gadget = downloader
            .find_gadget(&options.abi)
            .context("Frida gadget not cached for this ABI; run once without --offline")?;
        (jar, gadget)
    } else {
        let jar = downloader.ensure_apkeditor().await?;
        let gadget = downloader
            .ensure_gadget(&options.abi, config.frida_version.as_deref())
            .await?;
        (jar, gadget)
    };

    let orchestrator = open_orchestrator(&config, jar)?;
    let batch = BatchOptions {
        max_workers: config.workers,
        cache_enabled: options.cache_enabled,
        timeout: config.timeout,
        cancel: cancel_on_ctrl_c(),
    };
    let injector = Injector::new(
        orchestrator,
        SignTools::discover()?,
        config.gadget_command.clone(),
        batch,
    );
    injector.run(&options, &gadget).await
}

async fn run_batch(
    config: ResolvedConfig,
    kind: TaskKind,
    inputs: Vec<PathBuf>,
    output_dir: PathBuf,
    no_cache: bool,
    optimize_resources: bool,
    verbose: bool,
) -> Result<()> {
    let downloader = Downloader::new(config.cache_dir.join("tools"));
    let jar = downloader
        .find_apkeditor()
        .context("APKEditor not found; run `apkforge inject` once to download it")?;
    let orchestrator = open_orchestrator(&config, jar)?;

    let options = BatchOptions {
        max_workers: config.workers,
        cache_enabled: !no_cache,
        timeout: config.timeout,
        cancel: cancel_on_ctrl_c(),
    };

    info!(
        "Processing {} {kind} task(s) with up to {} worker(s)...",
        inputs.len(),
        options.max_workers
    );
    let batch = orchestrator
        .process(&inputs, kind, &output_dir, &options)
        .await?;

    let hits = count(&batch.results, TaskStatus::Hit);
    let successes = count(&batch.results, TaskStatus::Success);
    let failures = count(&batch.results, TaskStatus::Failed);
    let cancelled = count(&batch.results, TaskStatus::Cancelled);

    info!("Summary");
    info!("=======");
    info!("Cache hits: {hits}");
    info!("Succeeded:  {successes}");
    info!("Failed:     {failures}");
    if cancelled > 0 {
        info!("Cancelled:  {cancelled}");
    }

    for (result, input) in batch.results.iter().zip(&inputs) {
        match result.status {
            TaskStatus::Failed => {
                if verbose {
                    warn!(
                        "✗ {}: {}",
                        input.display(),
                        result.error_detail.as_deref().unwrap_or("unknown error")
                    );
                } else {
                    warn!("✗ {} failed (re-run with -v for detail)", input.display());
                }
            }
            TaskStatus::Success if verbose => {
                info!(
                    "✓ {} in {:.2}s",
                    input.display(),
                    result.duration.as_secs_f64()
                );
            }
            _ => {}
        }
    }

    if optimize_resources {
        let mut trimmed = 0;
        for result in &batch.results {
            if let Some(tree) = &result.result_path {
                trimmed += apkeditor::trim_decoded_tree(tree)?;
            }
        }
        info!("🧹 Stripped {trimmed} redundant director(ies) from decoded trees");
    }

    print_recommendations(&batch.stats.recommendations(config.workers));

    if batch.failed {
        anyhow::bail!("all {} task(s) failed", batch.results.len());
    }
    Ok(())
}

fn print_recommendations(hints: &[String]) {
    if hints.is_empty() {
        return;
    }
    info!("Recommendations:");
    for hint in hints {
        info!("  - {hint}");
    }
}

fn show_stats(config: ResolvedConfig) -> Result<()> {
    let cache = FingerprintCache::open(config.cache_dir.clone(), config.ttl)?;
    let recorder = RunRecorder::open(config.cache_dir.join("performance.json"));
    let stats = recorder.summary();

    info!("Performance Statistics");
    info!("======================");

    if stats.total_tasks == 0 {
        warn!("No recorded operations yet.");
    } else {
        info!("Total operations: {}", stats.total_tasks);
        info!("Cache hits:       {}", stats.cache_hits);
        info!("Succeeded:        {}", stats.successes);
        info!("Failed:           {}", stats.failures);
        info!("Success rate:     {:.1}%", stats.success_rate());
        info!("Total time:       {:.1}s", stats.total_duration_secs);

        for kind in [TaskKind::Decode, TaskKind::Build] {
            if let Some((min, avg, max)) = stats.timing_summary(kind) {
                info!("{kind} times: min {min:.2}s / avg {avg:.2}s / max {max:.2}s");
            }
        }
    }

    let cache_stats = cache.stats()?;
    info!("Cache records:    {}", cache_stats.entry_count);
    info!(
        "Cached artifacts: {}",
        format_bytes(cache_stats.artifact_bytes)
    );

    print_recommendations(&stats.recommendations(config.workers));

    Ok(())
}

fn clear_cache(config: ResolvedConfig) -> Result<()> {
    let cache = FingerprintCache::open(config.cache_dir.clone(), config.ttl)?;
    let recorder = RunRecorder::open(config.cache_dir.join("performance.json"));

    let removed = cache.clear()?;
    recorder.clear();
    recorder.flush()?;

    if removed > 0 {
        info!("✓ Removed {removed} cache record(s) and their artifacts");
    } else {
        warn!("No cached results to clear.");
    }
    info!("✓ Run statistics reset");
    Ok(())
}

fn count(results: &[task::TaskResult], status: TaskStatus) -> usize {
    results.iter().filter(|r| r.status == status).count()
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_picks_sensible_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn cli_parses_optimize_decode() {
        let cli = Cli::parse_from([
            "apkforge", "optimize", "decode", "-i", "a.apk", "b.apk", "-o", "out", "-w", "2",
            "--no-cache", "--optimize-resources",
        ]);
        match cli.command {
            Commands::Optimize {
                action:
                    OptimizeAction::Decode {
                        input,
                        output_dir,
                        workers,
                        no_cache,
                        timeout,
                        optimize_resources,
                    },
            } => {
                assert_eq!(input.len(), 2);
                assert_eq!(output_dir, PathBuf::from("out"));
                assert_eq!(workers, Some(2));
                assert!(no_cache);
                assert!(timeout.is_none());
                assert!(optimize_resources);
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn cli_parses_inject_defaults() {
        let cli = Cli::parse_from(["apkforge", "inject", "-i", "app.apk", "-o", "patched.apk"]);
        match cli.command {
            Commands::Inject {
                abi,
                library_name,
                no_cache,
                offline,
                ..
            } => {
                assert_eq!(abi, "arm64-v8a");
                assert_eq!(library_name, "frida-gadget");
                assert!(!no_cache);
                assert!(!offline);
            }
            _ => panic!("wrong command parsed"),
        }
    }
}
