use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{ForgeError, Result};
use crate::runner::CommandSpec;

/// Builds APKEditor invocations. The jar is driven through `java` with
/// heap and GC flags sized from the input and the machine.
#[derive(Debug)]
pub struct ApkEditor {
    jar: PathBuf,
    java: PathBuf,
    extra_jvm_args: Vec<String>,
}

impl ApkEditor {
    pub fn new(jar: PathBuf, java: Option<PathBuf>, extra_jvm_args: Vec<String>) -> Result<Self> {
        if !jar.exists() {
            return Err(ForgeError::Config(format!(
                "APKEditor jar not found at {} (run `apkforge inject` once to download it)",
                jar.display()
            )));
        }
        let java = match java {
            Some(java) => java,
            None => which::which("java")
                .map_err(|_| ForgeError::Config("java not found in PATH".to_string()))?,
        };
        Ok(Self {
            jar,
            java,
            extra_jvm_args,
        })
    }

    fn base_spec(&self, input: &Path) -> CommandSpec {
        let input_mb = input_size_mb(input);
        let mut spec = CommandSpec::new(self.java.to_string_lossy().into_owned());
        spec = spec.args(jvm_options(input_mb, total_memory_mb(), cpu_count()));
        spec = spec.args(self.extra_jvm_args.iter().cloned());
        spec.arg("-jar").arg_path(&self.jar)
    }

    pub fn decode_spec(&self, input: &Path, output: &Path) -> CommandSpec {
        self.base_spec(input)
            .arg("d")
            .arg("-i")
            .arg_path(input)
            .arg("-o")
            .arg_path(output)
            .arg("-f")
            .args(["-load-dex", "1"])
            .args(["-comment-level", "basic"])
            .args(["-dex-lib", "internal"])
            .args(["-t", "xml"])
            .arg("-split-json")
    }

    pub fn build_spec(&self, input: &Path, output: &Path) -> CommandSpec {
        self.base_spec(input)
            .arg("b")
            .arg("-i")
            .arg_path(input)
            .arg("-o")
            .arg_path(output)
            .arg("-f")
    }

    pub fn info_spec(&self, input: &Path) -> CommandSpec {
        self.base_spec(input)
            .arg("info")
            .arg("-i")
            .arg_path(input)
            .arg("-activities")
    }
}

/// Input size in megabytes; decoded trees get a flat default since build
/// memory does not scale with tree size the way decode does with APK size.
fn input_size_mb(path: &Path) -> u64 {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta.len() / (1024 * 1024),
        Ok(_) => 100,
        Err(_) => {
            warn!("could not stat {}, assuming 100MB input", path.display());
            100
        }
    }
}

fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Total system memory in MB, with a conservative fallback when the probe
/// fails (containers without /proc, exotic platforms).
pub fn total_memory_mb() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    let mb = sys.total_memory() / (1024 * 1024);
    if mb == 0 {
        8192
    } else {
        mb
    }
}

/// JVM flags sized from the input and the machine. Pure function so the
/// sizing rules are testable without spawning anything. All flags are
/// Java 8+ compatible.
pub fn jvm_options(input_mb: u64, total_memory_mb: u64, cpus: usize) -> Vec<String> {
    let mut args = vec![
        "-XX:+UseG1GC".to_string(),
        "-XX:MaxGCPauseMillis=200".to_string(),
        "-XX:+UseStringDeduplication".to_string(),
        "-XX:+UseCompressedOops".to_string(),
        "-XX:+UseCompressedClassPointers".to_string(),
        "-XX:G1HeapRegionSize=16m".to_string(),
    ];

    if input_mb > 500 {
        let heap = (input_mb * 4).min(total_memory_mb / 4);
        args.push(format!("-Xmx{heap}m"));
        args.push(format!("-Xms{}m", heap / 4));
    } else {
        let heap = (input_mb * 10).clamp(1536, (total_memory_mb / 4).max(1536));
        args.push(format!("-Xmx{heap}m"));
        args.push(format!("-Xms{}m", heap / 3));
    }

    if cpus > 4 {
        args.push(format!("-XX:ParallelGCThreads={}", cpus / 2));
        args.push(format!("-XX:ConcGCThreads={}", (cpus / 4).max(1)));
    }

    args.push("-XX:+TieredCompilation".to_string());
    args.push("-XX:+HeapDumpOnOutOfMemoryError".to_string());

    debug!("jvm sizing: input={input_mb}MB memory={total_memory_mb}MB cpus={cpus}");
    args
}

/// Strips directories a rebuild does not need from a decoded tree.
/// Signing metadata under `META-INF` is regenerated by apksigner anyway.
/// Returns how many directories were removed.
pub fn trim_decoded_tree(tree: &Path) -> std::io::Result<usize> {
    const REDUNDANT_DIRS: &[&str] = &["META-INF", "original", "unknown"];

    let mut removed = 0;
    for name in REDUNDANT_DIRS {
        let dir = tree.join(name);
        if dir.is_dir() {
            std::fs::remove_dir_all(&dir)?;
            debug!("removed {} from {}", name, tree.display());
            removed += 1;
        }
    }
    Ok(removed)
}
