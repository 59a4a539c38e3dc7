//! Archive extraction

use async_trait::async_trait;
use geoharvest_common::{PipelineError, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One file pulled out of an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFile {
    /// File name inside the archive, without directories
    pub logical_name: String,
    pub path: PathBuf,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<Vec<ExtractedFile>>;
}

/// Zip archives, unpacked on the blocking pool
#[derive(Debug, Clone, Default)]
pub struct ZipExtractor;

impl ZipExtractor {
    fn extract_sync(archive: &Path, dest_dir: &Path) -> Result<Vec<ExtractedFile>> {
        let name = archive.display().to_string();
        let file = File::open(archive).map_err(|e| PipelineError::extract(&name, e.to_string()))?;
        let mut zip = zip::ZipArchive::new(file)
            .map_err(|e| PipelineError::extract(&name, format!("not a zip archive: {}", e)))?;

        std::fs::create_dir_all(dest_dir)?;
        let mut extracted = Vec::new();

        for i in 0..zip.len() {
            let mut entry = zip
                .by_index(i)
                .map_err(|e| PipelineError::extract(&name, format!("entry {}: {}", i, e)))?;

            let relative = entry.enclosed_name().map(Path::to_path_buf).ok_or_else(|| {
                PipelineError::extract(&name, format!("entry '{}' escapes the destination", entry.name()))
            })?;

            let out_path = dest_dir.join(&relative);
            if entry.is_dir() {
                std::fs::create_dir_all(&out_path)?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let mut out = File::create(&out_path)?;
            std::io::copy(&mut entry, &mut out)
                .map_err(|e| PipelineError::extract(&name, format!("'{}': {}", entry.name(), e)))?;

            let logical_name = relative
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            debug!(archive = %name, entry = %logical_name, "Extracted");
            extracted.push(ExtractedFile {
                logical_name,
                path: out_path,
            });
        }

        Ok(extracted)
    }
}

#[async_trait]
impl Extractor for ZipExtractor {
    async fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<Vec<ExtractedFile>> {
        let archive = archive.to_path_buf();
        let dest_dir = dest_dir.to_path_buf();
        let name = archive.display().to_string();

        tokio::task::spawn_blocking(move || Self::extract_sync(&archive, &dest_dir))
            .await
            .map_err(|e| PipelineError::extract(name, format!("extraction task failed: {}", e)))?
    }
}
