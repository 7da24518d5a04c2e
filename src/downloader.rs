use anyhow::Result;
use colored::*;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

const APKEDITOR_REPO: &str = "REAndroid/APKEditor";
const FRIDA_REPO: &str = "frida/frida";

/// Fetches the external tools this crate orchestrates: the APKEditor jar
/// and the per-architecture Frida gadget library. Downloads land in the
/// cache's tools directory and are reused on later runs.
pub struct Downloader {
    client: Client,
    tools_dir: PathBuf,
}

impl Downloader {
    pub fn new(tools_dir: PathBuf) -> Self {
        Self {
            client: Client::new(),
            tools_dir,
        }
    }

    pub fn tools_dir(&self) -> &Path {
        &self.tools_dir
    }

    /// Returns a previously downloaded APKEditor jar if one exists.
    pub fn find_apkeditor(&self) -> Option<PathBuf> {
        let entries = std::fs::read_dir(&self.tools_dir).ok()?;
        entries.filter_map(|e| e.ok()).map(|e| e.path()).find(|p| {
            p.file_name()
                .map(|n| {
                    let name = n.to_string_lossy();
                    name.starts_with("APKEditor") && name.ends_with(".jar")
                })
                .unwrap_or(false)
        })
    }

    pub async fn ensure_apkeditor(&self) -> Result<PathBuf> {
        if let Some(jar) = self.find_apkeditor() {
            return Ok(jar);
        }

        tokio::fs::create_dir_all(&self.tools_dir).await?;
        let assets = self.get_release_assets(APKEDITOR_REPO, None).await?;
        let jar = assets
            .iter()
            .find(|a| a.name.ends_with(".jar"))
            .ok_or_else(|| anyhow::anyhow!("no jar asset in latest APKEditor release"))?;

        let dest = self.tools_dir.join(&jar.name);
        self.download_to_file(&jar.download_url, &dest).await?;
        Ok(dest)
    }

    /// Returns a previously downloaded gadget library for the given ABI,
    /// if one exists.
    pub fn find_gadget(&self, abi: &str) -> Option<PathBuf> {
        let keyword = gadget_arch(abi).ok()?;
        let entries = std::fs::read_dir(&self.tools_dir).ok()?;
        entries.filter_map(|e| e.ok()).map(|e| e.path()).find(|p| {
            p.file_name()
                .map(|n| {
                    let name = n.to_string_lossy();
                    name.starts_with("frida-gadget")
                        && name.contains(&format!("android-{keyword}"))
                        && name.ends_with(".so")
                })
                .unwrap_or(false)
        })
    }

    /// Fetches the Frida gadget for the given Android ABI, decompressing
    /// the `.so.xz` release asset on arrival. `frida_version` pins a
    /// release tag; `None` takes the latest.
    pub async fn ensure_gadget(&self, abi: &str, frida_version: Option<&str>) -> Result<PathBuf> {
        let keyword = gadget_arch(abi)?;

        if let Some(existing) = self.find_gadget(abi) {
            return Ok(existing);
        }

        tokio::fs::create_dir_all(&self.tools_dir).await?;
        let assets = self.get_release_assets(FRIDA_REPO, frida_version).await?;
        let wanted = format!("android-{keyword}.so.xz");
        let asset = assets
            .iter()
            .find(|a| a.name.starts_with("frida-gadget") && a.name.ends_with(&wanted))
            .ok_or_else(|| {
                anyhow::anyhow!("no frida-gadget asset for android-{keyword} in release")
            })?;

        let compressed = self.tools_dir.join(&asset.name);
        self.download_to_file(&asset.download_url, &compressed)
            .await?;

        let dest = self
            .tools_dir
            .join(asset.name.strip_suffix(".xz").unwrap_or(&asset.name));
        decompress_xz(&compressed, &dest)?;
        tokio::fs::remove_file(&compressed).await?;

        println!(
            "{} {}",
            "✓".green(),
            format!("Gadget ready: {}", dest.display()).green()
        );
        Ok(dest)
    }

    async fn get_release_assets(&self, repo: &str, tag: Option<&str>) -> Result<Vec<ReleaseAsset>> {
        let url = match tag {
            Some(tag) => format!("https://api.github.com/repos/{repo}/releases/tags/{tag}"),
            None => format!("https://api.github.com/repos/{repo}/releases/latest"),
        };
        let response = self
            .client
            .get(&url)
            .header("User-Agent", "apkforge-downloader")
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Failed to fetch release: HTTP {}: {}",
                response.status(),
                url
            );
        }

        let release: serde_json::Value = response.json().await?;
        let assets = release
            .get("assets")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow::anyhow!("No assets found in release"))?;

        let mut files = Vec::new();
        for asset in assets {
            if let (Some(name), Some(download_url)) = (
                asset.get("name").and_then(|v| v.as_str()),
                asset.get("browser_download_url").and_then(|v| v.as_str()),
            ) {
                files.push(ReleaseAsset {
                    name: name.to_string(),
                    download_url: download_url.to_string(),
                });
            }
        }

        Ok(files)
    }

    async fn download_to_file(&self, url: &str, path: &Path) -> Result<()> {
        println!("{} {}", "→".blue(), format!("Downloading: {}", url).blue());

        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Failed to download file: HTTP {}: {}",
                response.status(),
                url
            );
        }

        let total_size = response.content_length().unwrap_or(0);
        let pb = ProgressBar::new(total_size);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .unwrap()
                .progress_chars("#>-")
        );

        let mut file = File::create(path).await?;
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            pb.set_position(downloaded);
        }

        file.flush().await?;
        pb.finish_with_message("Download complete!");

        println!(
            "{} {}",
            "✓".green(),
            format!("Saved to: {}", path.display()).green()
        );

        Ok(())
    }
}

fn decompress_xz(src: &Path, dest: &Path) -> Result<()> {
    let compressed = std::fs::File::open(src)?;
    let mut decoder = xz2::read::XzDecoder::new(compressed);
    let mut data = Vec::new();
    decoder.read_to_end(&mut data)?;
    std::fs::write(dest, data)?;
    Ok(())
}

/// Frida release naming for Android ABIs.
fn gadget_arch(abi: &str) -> Result<&'static str> {
    match abi {
        "arm64-v8a" => Ok("arm64"),
        "armeabi-v7a" => Ok("arm"),
        "x86" => Ok("x86"),
        "x86_64" => Ok("x86_64"),
        other => anyhow::bail!("Unsupported Android ABI: {other}"),
    }
}

#[derive(Debug, Clone)]
pub struct ReleaseAsset {
    pub name: String,
    pub download_url: String,
}
