//! Pipeline configuration
//!
//! Loaded once at startup (TOML file, then `GEOHARVEST_*` environment overrides)
//! and handed to each component at construction.

use geoharvest_common::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Default checkpoint database location.
pub const DEFAULT_DATABASE_PATH: &str = "./data/checkpoints.db";

/// Default root for all stage outputs.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Default unit manifest consumed by the fetch stage.
pub const DEFAULT_MANIFEST: &str = "./data/manifest.csv";

/// Default per-invocation geometry tool timeout in seconds.
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 600;

/// Default output driver for convert and merge.
pub const DEFAULT_OUTPUT_FORMAT: &str = "GPKG";

/// Default SRS assigned to converted layers.
pub const DEFAULT_TARGET_SRS: &str = "EPSG:4326";

/// Default number of units processed concurrently.
pub const DEFAULT_WORKERS: usize = 4;

/// Default whole-unit timeout in seconds (1 hour).
pub const DEFAULT_UNIT_TIMEOUT_SECS: u64 = 3600;

/// Default fetch attempts per unit.
pub const DEFAULT_FETCH_RETRIES: u32 = 3;

/// Default initial backoff between fetch attempts in milliseconds.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 300;

/// Default name of the provenance column added to every merged feature.
pub const DEFAULT_PROVENANCE_COLUMN: &str = "source_id";

/// Default canonical geometry column when a source reports none.
pub const DEFAULT_GEOMETRY_COLUMN: &str = "geom";

/// Measure columns recomputed by GIS software and dropped before merging.
pub const DEFAULT_MEASURE_DENYLIST: &[&str] = &["area", "length", "shape_len", "shape_ar"];

/// Full pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub database: DatabaseConfig,
    pub paths: PathsConfig,
    pub tool: ToolConfig,
    pub processing: ProcessingConfig,
    pub schema: SchemaConfig,
    pub merge: MergeConfig,
}

/// Checkpoint database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DATABASE_PATH),
        }
    }
}

/// Stage input and output locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub manifest: PathBuf,
    pub download_dir: PathBuf,
    pub extract_dir: PathBuf,
    pub converted_dir: PathBuf,
    pub merged_dir: PathBuf,
    /// Private scratch space for in-progress tool outputs
    pub temp_dir: PathBuf,
}

impl PathsConfig {
    /// Lay out every stage directory under one root
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            manifest: root.join("manifest.csv"),
            download_dir: root.join("downloads"),
            extract_dir: root.join("extracted"),
            converted_dir: root.join("converted"),
            merged_dir: root.join("merged"),
            temp_dir: root.join("tmp"),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let mut paths = Self::under(DEFAULT_DATA_DIR);
        paths.manifest = PathBuf::from(DEFAULT_MANIFEST);
        paths
    }
}

/// Geometry tool (ogr2ogr / ogrinfo) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub ogr2ogr: String,
    pub ogrinfo: String,
    pub timeout_secs: u64,
    /// OGR driver name for convert and merge outputs
    pub output_format: String,
    /// File extension matching `output_format`
    pub output_extension: String,
    /// SRS assigned (not reprojected) when converting
    pub target_srs: Option<String>,
    /// Pass `-skipfailures` so a bad feature does not fail the whole layer
    pub skip_failures: bool,
}

impl ToolConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            ogr2ogr: "ogr2ogr".to_string(),
            ogrinfo: "ogrinfo".to_string(),
            timeout_secs: DEFAULT_TOOL_TIMEOUT_SECS,
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            output_extension: "gpkg".to_string(),
            target_srs: Some(DEFAULT_TARGET_SRS.to_string()),
            skip_failures: true,
        }
    }
}

/// Concurrency, timeout and retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub workers: usize,
    pub unit_timeout_secs: u64,
    pub fetch_retries: u32,
    pub retry_backoff_ms: u64,
    pub http_timeout_secs: u64,
}

impl ProcessingConfig {
    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            unit_timeout_secs: DEFAULT_UNIT_TIMEOUT_SECS,
            fetch_retries: DEFAULT_FETCH_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

/// Schema reconciliation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub provenance_column: String,
    pub default_geometry: String,
    pub measure_denylist: Vec<String>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            provenance_column: DEFAULT_PROVENANCE_COLUMN.to_string(),
            default_geometry: DEFAULT_GEOMETRY_COLUMN.to_string(),
            measure_denylist: DEFAULT_MEASURE_DENYLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Merge stage settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Group keys to merge; `None` merges every group observed in convert output
    pub groups: Option<Vec<String>>,
    /// Output layer name; `None` names the layer after its group
    pub layer_name: Option<String>,
}

impl PipelineConfig {
    /// Load from an optional TOML file, apply environment overrides, validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
            .map_err(|e| PipelineError::config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| PipelineError::config(format!("Invalid TOML: {}", e)))
    }

    /// Apply `GEOHARVEST_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(name: &str, value: String) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| PipelineError::config(format!("{} has invalid value '{}'", name, value)))
        }

        if let Some(v) = lookup("GEOHARVEST_DATABASE_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("GEOHARVEST_DATA_DIR") {
            self.paths = PathsConfig::under(v);
        }
        if let Some(v) = lookup("GEOHARVEST_MANIFEST") {
            self.paths.manifest = PathBuf::from(v);
        }
        if let Some(v) = lookup("GEOHARVEST_TEMP_DIR") {
            self.paths.temp_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("GEOHARVEST_OGR2OGR") {
            self.tool.ogr2ogr = v;
        }
        if let Some(v) = lookup("GEOHARVEST_OGRINFO") {
            self.tool.ogrinfo = v;
        }
        if let Some(v) = lookup("GEOHARVEST_TOOL_TIMEOUT") {
            self.tool.timeout_secs = parsed("GEOHARVEST_TOOL_TIMEOUT", v)?;
        }
        if let Some(v) = lookup("GEOHARVEST_WORKERS") {
            self.processing.workers = parsed("GEOHARVEST_WORKERS", v)?;
        }
        if let Some(v) = lookup("GEOHARVEST_UNIT_TIMEOUT") {
            self.processing.unit_timeout_secs = parsed("GEOHARVEST_UNIT_TIMEOUT", v)?;
        }
        if let Some(v) = lookup("GEOHARVEST_FETCH_RETRIES") {
            self.processing.fetch_retries = parsed("GEOHARVEST_FETCH_RETRIES", v)?;
        }
        if let Some(v) = lookup("GEOHARVEST_MERGE_GROUPS") {
            let groups: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
            self.merge.groups = (!groups.is_empty()).then_some(groups);
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.processing.workers == 0 {
            return Err(PipelineError::config("processing.workers must be greater than 0"));
        }

        if self.tool.timeout_secs == 0 || self.processing.unit_timeout_secs == 0 {
            return Err(PipelineError::config("timeouts must be greater than 0"));
        }

        if self.tool.ogr2ogr.trim().is_empty() || self.tool.ogrinfo.trim().is_empty() {
            return Err(PipelineError::config("tool executables cannot be empty"));
        }

        if self.schema.provenance_column.is_empty() || self.schema.default_geometry.is_empty() {
            return Err(PipelineError::config(
                "schema.provenance_column and schema.default_geometry cannot be empty",
            ));
        }

        if self.schema.provenance_column == self.schema.default_geometry {
            return Err(PipelineError::config(format!(
                "provenance column and default geometry are both '{}'",
                self.schema.provenance_column
            )));
        }

        if self.tool.output_extension.trim_start_matches('.').is_empty() {
            return Err(PipelineError::config("tool.output_extension cannot be empty"));
        }

        if let Some(groups) = &self.merge.groups {
            if groups.is_empty() {
                tracing::warn!("merge.groups is an empty list, the merge stage will do nothing");
            }
        }

        Ok(())
    }
}
