//! Cached source introspection

use crate::schema::{SchemaRules, SourceDataset};
use crate::tool::{GeometryTool, LayerMetadata};
use geoharvest_common::{PipelineError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

impl Fingerprint {
    async fn of(path: &Path) -> Result<Self> {
        let meta = tokio::fs::metadata(path).await.map_err(|e| {
            PipelineError::introspection(path.display().to_string(), format!("cannot stat: {}", e))
        })?;
        Ok(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

type CacheKey = (PathBuf, Option<String>);

/// Reads source schemas through the geometry tool, once per unchanged file
pub struct SchemaCatalog {
    tool: Arc<dyn GeometryTool>,
    rules: SchemaRules,
    cache: Mutex<HashMap<CacheKey, (Fingerprint, LayerMetadata)>>,
}

impl SchemaCatalog {
    pub fn new(tool: Arc<dyn GeometryTool>, rules: SchemaRules) -> Self {
        Self {
            tool,
            rules,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn rules(&self) -> &SchemaRules {
        &self.rules
    }

    /// Describe one source layer
    ///
    /// Tool metadata is cached per `(path, layer)` and reused until the file's
    /// size or modification time changes.
    pub async fn introspect(
        &self,
        source_id: &str,
        path: &Path,
        layer: Option<&str>,
    ) -> Result<SourceDataset> {
        let fingerprint = Fingerprint::of(path).await?;
        let key: CacheKey = (path.to_path_buf(), layer.map(str::to_string));

        if let Some(meta) = self.cached(&key, &fingerprint) {
            debug!(path = %path.display(), "Schema cache hit");
            return Ok(SourceDataset::from_metadata(source_id, path, meta, &self.rules));
        }

        let meta = self.tool.describe(path, layer).await?;
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, (fingerprint, meta.clone()));

        Ok(SourceDataset::from_metadata(source_id, path, meta, &self.rules))
    }

    fn cached(&self, key: &CacheKey, fingerprint: &Fingerprint) -> Option<LayerMetadata> {
        let cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache
            .get(key)
            .filter(|(fp, _)| fp == fingerprint)
            .map(|(_, meta)| meta.clone())
    }
}
