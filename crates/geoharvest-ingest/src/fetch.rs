//! Blob fetching with resumable HTTP downloads
//!
//! Downloads stream into `<name>.part` next to the final file. When a partial
//! file is present the next attempt asks for the remaining bytes with a `Range`
//! header; a server that ignores the range gets a fresh download. The `.part`
//! file is renamed into place only after its size checks out.

use crate::config::ProcessingConfig;
use crate::merge::remove_quietly;
use async_trait::async_trait;
use futures::StreamExt;
use geoharvest_common::{PipelineError, Result, UnitIdentity};
use reqwest::header::RANGE;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Unit attribute holding the download URL
pub const URL_ATTRIBUTE: &str = "url";

/// Optional unit attribute with the expected size in bytes
pub const SIZE_ATTRIBUTE: &str = "size_bytes";

/// Optional unit attribute overriding the local file name
pub const FILE_NAME_ATTRIBUTE: &str = "file_name";

#[async_trait]
pub trait BlobFetcher: Send + Sync {
    /// Download the unit's data into `dest_dir`, returning the local path
    async fn fetch(&self, unit: &UnitIdentity, dest_dir: &Path) -> Result<PathBuf>;
}

pub struct HttpBlobFetcher {
    client: reqwest::Client,
    max_attempts: u32,
    backoff: Duration,
}

impl HttpBlobFetcher {
    pub fn new(config: &ProcessingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .user_agent(concat!("geoharvest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_attempts: config.fetch_retries.max(1),
            backoff: config.retry_backoff(),
        })
    }

    /// Local file name: explicit attribute, else last URL path segment, else the key
    fn file_name(unit: &UnitIdentity, url: &str) -> String {
        if let Some(name) = unit.attribute(FILE_NAME_ATTRIBUTE) {
            return name.to_string();
        }
        reqwest::Url::parse(url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("{}.zip", unit.key.file_stem()))
    }

    /// One download attempt into `part`, resuming when it already has bytes
    async fn download(
        &self,
        unit: &UnitIdentity,
        url: &str,
        part: &Path,
        expected: Option<u64>,
    ) -> Result<()> {
        let key = unit.key.as_str();
        let existing = match tokio::fs::metadata(part).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut request = self.client.get(url);
        if existing > 0 {
            debug!(unit = %key, bytes = existing, "Resuming partial download");
            request = request.header(RANGE, format!("bytes={}-", existing));
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::fetch(key, format!("request failed: {}", e)))?;
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE && existing > 0 {
            if expected == Some(existing) {
                return Ok(());
            }
            remove_quietly(part).await;
            return Err(PipelineError::fetch(
                key,
                "server rejected resume range, partial file discarded",
            ));
        }

        if !status.is_success() {
            return Err(PipelineError::fetch(key, format!("HTTP {}", status)));
        }

        let resumed = existing > 0 && status == StatusCode::PARTIAL_CONTENT;
        if existing > 0 && !resumed {
            info!(unit = %key, "Server ignored range request, restarting download");
        }

        let announced = response
            .content_length()
            .map(|len| if resumed { len + existing } else { len });

        let mut file = if resumed {
            tokio::fs::OpenOptions::new().append(true).open(part).await?
        } else {
            tokio::fs::File::create(part).await?
        };

        let mut total = if resumed { existing } else { 0 };
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::fetch(key, format!("stream error: {}", e)))?;
            file.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(want) = expected.or(announced) {
            if total != want {
                remove_quietly(part).await;
                return Err(PipelineError::fetch(
                    key,
                    format!("size mismatch: expected {} bytes, got {}", want, total),
                ));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl BlobFetcher for HttpBlobFetcher {
    async fn fetch(&self, unit: &UnitIdentity, dest_dir: &Path) -> Result<PathBuf> {
        let url = unit.require(URL_ATTRIBUTE)?;
        let expected = match unit.attribute(SIZE_ATTRIBUTE) {
            Some(raw) => Some(raw.trim().parse::<u64>().map_err(|_| {
                PipelineError::fetch(unit.key.as_str(), format!("invalid size_bytes '{}'", raw))
            })?),
            None => None,
        };

        tokio::fs::create_dir_all(dest_dir).await?;
        let final_path = dest_dir.join(Self::file_name(unit, url));
        let part = PathBuf::from(format!("{}.part", final_path.display()));

        // A completed file without a checkpoint (crash after rename) is reused
        if let (Ok(meta), Some(want)) = (tokio::fs::metadata(&final_path).await, expected) {
            if meta.len() == want {
                debug!(unit = %unit.key, path = %final_path.display(), "Already downloaded");
                return Ok(final_path);
            }
        }

        for attempt in 1..=self.max_attempts {
            match self.download(unit, url, &part, expected).await {
                Ok(()) => {
                    tokio::fs::rename(&part, &final_path).await?;
                    info!(unit = %unit.key, path = %final_path.display(), "Downloaded");
                    return Ok(final_path);
                },
                Err(e) if attempt < self.max_attempts => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        unit = %unit.key,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Download attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(e) => return Err(e),
            }
        }

        Err(PipelineError::fetch(unit.key.as_str(), "no download attempts configured"))
    }
}
