use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, Result};
use crate::task::unix_now_secs;

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// One live record per fingerprint; expired records count as absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub result_path: PathBuf,
    pub created_at: u64,
    pub expires_at: u64,
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entry_count: usize,
    pub artifact_bytes: u64,
}

/// Disk-backed fingerprint cache: one JSON record per fingerprint under
/// `entries/`, cached result trees under `artifacts/`. Writes are atomic
/// (temp file + rename) so a crashed writer never leaves a half record.
pub struct FingerprintCache {
    root: PathBuf,
    ttl: Duration,
}

impl FingerprintCache {
    pub fn open(root: PathBuf, ttl: Duration) -> Result<Self> {
        std::fs::create_dir_all(root.join("entries"))?;
        std::fs::create_dir_all(root.join("artifacts"))?;
        Ok(Self { root, ttl })
    }

    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".apkforge")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.root.join("tools")
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join("entries").join(format!("{fingerprint}.json"))
    }

    /// Returns the entry only if it is present, unexpired, and its result
    /// still exists on disk. Expired or dangling records are lazily purged.
    /// A record that cannot be parsed is removed and reported as
    /// `CacheCorrupt` so the caller can degrade to a miss.
    pub fn lookup(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        self.lookup_at(fingerprint, unix_now_secs())
    }

    fn lookup_at(&self, fingerprint: &str, now_secs: u64) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(fingerprint);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(ForgeError::CacheCorrupt {
                    fingerprint: fingerprint.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        if now_secs >= entry.expires_at {
            debug!("cache record expired for {fingerprint}");
            let _ = std::fs::remove_file(&path);
            return Ok(None);
        }

        if !entry.result_path.exists() {
            warn!(
                "cached result missing on disk, dropping record: {}",
                entry.result_path.display()
            );
            let _ = std::fs::remove_file(&path);
            return Ok(None);
        }

        Ok(Some(entry))
    }

    /// Last-write-wins; distinct fingerprints never collide, so a single
    /// atomic replace is all the coordination store needs.
    pub fn store(&self, fingerprint: &str, result_path: &Path) -> Result<()> {
        let now = unix_now_secs();
        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            result_path: result_path.to_path_buf(),
            created_at: now,
            expires_at: now + self.ttl.as_secs(),
        };

        let entries_dir = self.root.join("entries");
        let mut tmp = tempfile::NamedTempFile::new_in(&entries_dir)?;
        tmp.write_all(serde_json::to_string_pretty(&entry)?.as_bytes())?;
        tmp.persist(self.entry_path(fingerprint))
            .map_err(|e| ForgeError::Io(e.error))?;
        Ok(())
    }

    /// Removes every record and cached artifact. Returns how many records
    /// were dropped.
    pub fn clear(&self) -> Result<usize> {
        let entries_dir = self.root.join("entries");
        let mut removed = 0;
        for item in std::fs::read_dir(&entries_dir)? {
            let item = item?;
            if std::fs::remove_file(item.path()).is_ok() {
                removed += 1;
            }
        }

        let artifacts = self.artifacts_dir();
        if artifacts.exists() {
            std::fs::remove_dir_all(&artifacts)?;
        }
        std::fs::create_dir_all(&artifacts)?;

        Ok(removed)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let entry_count = std::fs::read_dir(self.root.join("entries"))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .count();

        let mut artifact_bytes = 0u64;
        for item in walkdir::WalkDir::new(self.artifacts_dir())
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if item.file_type().is_file() {
                artifact_bytes += item.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }

        Ok(CacheStats {
            entry_count,
            artifact_bytes,
        })
    }
}
