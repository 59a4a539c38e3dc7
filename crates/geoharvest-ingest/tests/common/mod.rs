//! Scripted collaborators shared by the integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use geoharvest_common::{PipelineError, Result, UnitIdentity};
use geoharvest_ingest::fetch::BlobFetcher;
use geoharvest_ingest::tool::{GeometryTool, LayerMetadata, ToolOutcome, TranslateRequest};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Stand-in for a converted layer: written as JSON, read back by [`ScriptedTool`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FakeLayer {
    pub fields: Vec<String>,
    pub geometry: String,
    pub features: u64,
    /// Introspection works but every translate of this source fails
    #[serde(default)]
    pub corrupt: bool,
}

impl FakeLayer {
    pub fn new(fields: &[&str], geometry: &str) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            geometry: geometry.to_string(),
            features: 3,
            corrupt: false,
        }
    }

    pub fn corrupt(mut self) -> Self {
        self.corrupt = true;
        self
    }

    pub fn write(&self, path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_vec(self).unwrap()).unwrap();
    }
}

/// Geometry tool over [`FakeLayer`] files
///
/// `translate` writes one line per accepted source into the destination
/// (`<source path>\t<projection>`), so tests can read back which sources
/// made it into a merged output.
#[derive(Default)]
pub struct ScriptedTool {
    pub requests: Mutex<Vec<TranslateRequest>>,
    /// Appends never finish (a tool stuck on a huge source)
    pub stall_appends: bool,
}

impl ScriptedTool {
    pub fn requests(&self) -> Vec<TranslateRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn projection_for(&self, source: &Path) -> Option<String> {
        self.requests()
            .into_iter()
            .find(|r| r.source == source)
            .and_then(|r| r.projection)
    }
}

#[async_trait]
impl GeometryTool for ScriptedTool {
    async fn describe(&self, path: &Path, _layer: Option<&str>) -> Result<LayerMetadata> {
        let bytes = std::fs::read(path)
            .map_err(|e| PipelineError::introspection(path.display().to_string(), e.to_string()))?;
        let layer: FakeLayer = serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::introspection(path.display().to_string(), e.to_string()))?;

        Ok(LayerMetadata {
            layer: path.file_stem().unwrap().to_string_lossy().into_owned(),
            fields: layer.fields,
            geometry_column: Some(layer.geometry),
            feature_count: Some(layer.features),
        })
    }

    async fn translate(&self, request: &TranslateRequest) -> Result<ToolOutcome> {
        self.requests.lock().unwrap().push(request.clone());

        let source: FakeLayer = serde_json::from_slice(&std::fs::read(&request.source).unwrap()).unwrap();
        if request.append && self.stall_appends {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }
        if source.corrupt {
            return Ok(ToolOutcome::failed("ERROR 1: sqlite3_step() failed: database disk image is malformed"));
        }

        let mut text = if request.append {
            std::fs::read_to_string(&request.destination).unwrap()
        } else {
            assert!(!request.destination.exists(), "seed must create a fresh output");
            String::new()
        };
        text.push_str(&format!(
            "{}\t{}\n",
            request.source.display(),
            request.projection.as_deref().unwrap_or("")
        ));
        std::fs::write(&request.destination, text).unwrap();
        Ok(ToolOutcome::ok())
    }
}

/// Fetcher for pipelines that never reach the network
pub struct OfflineFetcher;

#[async_trait]
impl BlobFetcher for OfflineFetcher {
    async fn fetch(&self, unit: &UnitIdentity, _dest_dir: &Path) -> Result<PathBuf> {
        Err(PipelineError::fetch(unit.key.as_str(), "offline"))
    }
}
