//! Download and cache of the cloudflared binary
//!
//! Assets are keyed per platform from the vendor's latest GitHub release.
//! The published checksum in the release notes is compared best-effort:
//! note parsing is unreliable upstream, so a mismatch warns and continues.

use crate::error::ConnectorError;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Latest-release metadata endpoint
pub const DEFAULT_RELEASE_URL: &str =
    "https://api.github.com/repos/cloudflare/cloudflared/releases/latest";

const BINARY_NAME: &str = "cloudflared";
const VERSION_FILE: &str = ".version";

/// Download progress: (bytes so far, total if known)
pub type ProgressFn = Box<dyn Fn(u64, Option<u64>) + Send + Sync>;

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: Option<u64>,
}

/// Map (os, arch) to the vendor's asset name. macOS ships tarballs, Linux
/// ships raw binaries.
pub fn asset_for_platform(os: &str, arch: &str) -> Result<&'static str, ConnectorError> {
    match (os, arch) {
        ("macos", "aarch64") => Ok("cloudflared-darwin-arm64.tgz"),
        ("macos", "x86_64") => Ok("cloudflared-darwin-amd64.tgz"),
        ("linux", "aarch64") => Ok("cloudflared-linux-arm64"),
        ("linux", "x86_64") => Ok("cloudflared-linux-amd64"),
        _ => Err(ConnectorError::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        }),
    }
}

static HEX_DIGEST: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[0-9a-f]{64}\b").unwrap());

/// Scan release notes for a SHA-256 published next to the asset name.
/// The upstream notes format shifts between releases, hence best-effort.
pub fn find_published_checksum(notes: &str, asset: &str) -> Option<String> {
    notes
        .lines()
        .filter(|line| line.contains(asset))
        .find_map(|line| HEX_DIGEST.find(line).map(|m| m.as_str().to_string()))
}

/// Manages the cached connector binary under one directory
pub struct BinaryManager {
    bin_dir: PathBuf,
    release_url: String,
    http: reqwest::Client,
}

impl BinaryManager {
    pub fn new(bin_dir: impl Into<PathBuf>) -> Self {
        Self::with_release_url(bin_dir, DEFAULT_RELEASE_URL)
    }

    /// Custom release endpoint (tests)
    pub fn with_release_url(bin_dir: impl Into<PathBuf>, release_url: impl Into<String>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            release_url: release_url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Path the binary lives at once installed
    pub fn binary_path(&self) -> PathBuf {
        self.bin_dir.join(BINARY_NAME)
    }

    /// Installed version, if the version file exists
    pub fn installed_version(&self) -> Option<String> {
        std::fs::read_to_string(self.bin_dir.join(VERSION_FILE))
            .ok()
            .map(|v| v.trim().to_string())
    }

    /// Return the cached binary, downloading it first if absent
    pub async fn ensure(&self, progress: Option<ProgressFn>) -> Result<PathBuf, ConnectorError> {
        let path = self.binary_path();
        if path.exists() {
            debug!("cloudflared already cached at {}", path.display());
            return Ok(path);
        }
        self.download(progress).await
    }

    /// Download the latest release asset for this platform
    pub async fn download(&self, progress: Option<ProgressFn>) -> Result<PathBuf, ConnectorError> {
        let asset_name = asset_for_platform(std::env::consts::OS, std::env::consts::ARCH)?;
        self.download_asset(asset_name, progress).await
    }

    async fn download_asset(
        &self,
        asset_name: &str,
        progress: Option<ProgressFn>,
    ) -> Result<PathBuf, ConnectorError> {
        std::fs::create_dir_all(&self.bin_dir)?;

        let release: Release = self
            .http
            .get(&self.release_url)
            // GitHub rejects requests without a user agent
            .header(reqwest::header::USER_AGENT, "tuinnel")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let version = release.tag_name.trim_start_matches('v').to_string();
        let asset = release
            .assets
            .iter()
            .find(|a| a.name == asset_name)
            .ok_or_else(|| ConnectorError::AssetMissing(asset_name.to_string()))?;

        info!("downloading cloudflared {} ({})", version, asset.name);

        let tmp = tempfile::Builder::new()
            .prefix(".cloudflared-download-")
            .tempfile_in(&self.bin_dir)?
            .into_temp_path();

        let response = self
            .http
            .get(&asset.browser_download_url)
            .header(reqwest::header::USER_AGENT, "tuinnel")
            .send()
            .await?
            .error_for_status()?;

        let total = response.content_length().or(asset.size);
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if let Some(progress) = &progress {
                progress(downloaded, total);
            }
        }
        file.sync_all().await?;
        drop(file);

        self.verify_checksum(&tmp, release.body.as_deref(), asset_name)?;

        let target = self.binary_path();
        if asset_name.ends_with(".tgz") {
            extract_tarball(&tmp, &target)?;
        } else {
            tmp.persist(&target).map_err(|e| e.error)?;
        }

        set_executable(&target)?;
        std::fs::write(self.bin_dir.join(VERSION_FILE), &version)?;
        info!("installed cloudflared {} at {}", version, target.display());

        Ok(target)
    }

    fn verify_checksum(
        &self,
        file: &Path,
        notes: Option<&str>,
        asset_name: &str,
    ) -> Result<(), ConnectorError> {
        let Some(expected) = notes.and_then(|notes| find_published_checksum(notes, asset_name))
        else {
            debug!("no published checksum found for {}", asset_name);
            return Ok(());
        };

        let bytes = std::fs::read(file)?;
        let actual = hex_digest(&bytes);
        if actual != expected {
            // Release-note parsing is known to be unreliable; do not abort
            warn!(
                "checksum mismatch for {}: expected {}, computed {} \
                 (release notes may be stale; continuing)",
                asset_name, expected, actual
            );
        } else {
            debug!("checksum verified for {}", asset_name);
        }
        Ok(())
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Pull the `cloudflared` entry out of a `.tgz` asset
fn extract_tarball(archive: &Path, target: &Path) -> Result<(), ConnectorError> {
    let file = std::fs::File::open(archive)?;
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));

    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;
        let is_binary = path
            .file_name()
            .is_some_and(|name| name == BINARY_NAME);
        if is_binary {
            entry.unpack(target)?;
            return Ok(());
        }
    }

    Err(ConnectorError::ReleaseMetadata(format!(
        "archive {} does not contain a {} binary",
        archive.display(),
        BINARY_NAME
    )))
}

fn set_executable(path: &Path) -> Result<(), ConnectorError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}
