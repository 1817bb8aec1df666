//! GitHub release lookup and asset download
//!
//! Minimal client for fetching the latest release of an emulator repository
//! and streaming a chosen asset to disk with progress reporting. Runs on
//! worker threads, so the blocking client is fine. Pagination and rate-limit
//! handling are deliberately not implemented here.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::fileops::{OpReport, OpStatus};
use crate::progress::ProgressHandler;

/// Connection timeout: time to establish the TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Overall request timeout; emulator builds can be a few hundred MB on slow links
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60 * 60);

const CHUNK_SIZE: usize = 64 * 1024;

/// One release of a GitHub repository.
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl Release {
    /// First asset whose file name contains `filter`.
    pub fn find_asset(&self, filter: &str) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|a| a.name.contains(filter))
    }
}

/// A downloadable file attached to a release.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

/// HTTP client for release metadata and asset downloads.
pub struct ReleaseClient {
    client: reqwest::blocking::Client,
}

impl ReleaseClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("retrodock/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }

    /// Fetch the latest release of `owner/repo`.
    pub fn latest_release(&self, owner: &str, repo: &str) -> Result<Release> {
        let url = format!(
            "https://api.github.com/repos/{}/{}/releases/latest",
            owner, repo
        );
        debug!("fetching release metadata from {}", url);
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .with_context(|| format!("Failed to fetch {}", url))?;
        if !response.status().is_success() {
            bail!(
                "Release lookup failed: HTTP {} for {}",
                response.status(),
                url
            );
        }
        response
            .json()
            .with_context(|| format!("Failed to parse release metadata from {}", url))
    }

    /// Stream an asset to `dest`, reporting bytes through `progress` and
    /// checking for cancellation once per chunk. A cancelled or failed
    /// download removes the partial file.
    pub fn download_asset(
        &self,
        asset: &ReleaseAsset,
        dest: &Path,
        progress: &ProgressHandler,
    ) -> OpReport {
        match self.try_download(asset, dest, progress) {
            Ok((OpStatus::Cancelled, _)) => {
                remove_partial(dest);
                OpReport {
                    status: OpStatus::Cancelled,
                    message: format!("download of {} cancelled", asset.name),
                    processed: 0,
                }
            }
            Ok((status, written)) => OpReport {
                status,
                message: format!("downloaded {}", asset.name),
                processed: written,
            },
            Err(e) => {
                remove_partial(dest);
                let msg = format!("download of {} failed: {:#}", asset.name, e);
                progress.report_error(&msg);
                OpReport {
                    status: OpStatus::Failed,
                    message: msg,
                    processed: 0,
                }
            }
        }
    }

    fn try_download(
        &self,
        asset: &ReleaseAsset,
        dest: &Path,
        progress: &ProgressHandler,
    ) -> Result<(OpStatus, u64)> {
        let mut response = self
            .client
            .get(&asset.browser_download_url)
            .send()
            .with_context(|| format!("Failed to fetch {}", asset.browser_download_url))?;
        if !response.status().is_success() {
            bail!("HTTP {}", response.status());
        }

        let total = response.content_length().unwrap_or(asset.size);
        progress.start_operation(total, "bytes");

        let mut out =
            File::create(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut written: u64 = 0;
        loop {
            if progress.should_cancel() {
                return Ok((OpStatus::Cancelled, written));
            }
            let n = response.read(&mut buffer).context("read failed")?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n]).context("write failed")?;
            written += n as u64;
            progress.report_progress(written);
        }
        out.flush()?;

        progress.report_success();
        debug!("downloaded {} ({} bytes)", asset.name, written);
        Ok((OpStatus::Completed, written))
    }
}

fn remove_partial(dest: &Path) {
    if dest.exists() {
        if let Err(e) = fs::remove_file(dest) {
            warn!(
                "could not remove partial download {}: {}",
                dest.display(),
                e
            );
        }
    }
}
