//! Geometry tool boundary
//!
//! Everything that touches geometry goes through [`GeometryTool`]: layer
//! introspection and translate/append. The production implementation shells out
//! to `ogrinfo` and `ogr2ogr` ([`OgrTool`]); tests substitute scripted fakes.

pub mod metadata;
pub mod ogr;

use async_trait::async_trait;
use geoharvest_common::Result;
use std::path::{Path, PathBuf};

pub use metadata::LayerMetadata;
pub use ogr::OgrTool;

/// One translate invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslateRequest {
    pub source: PathBuf,
    pub source_layer: Option<String>,
    /// SQL projection evaluated against the source (SQLite dialect)
    pub projection: Option<String>,
    pub destination: PathBuf,
    pub dest_layer: Option<String>,
    /// Append to an existing destination layer instead of creating it
    pub append: bool,
    pub promote_to_multi: bool,
    /// SRS assigned to the output without reprojecting
    pub assign_srs: Option<String>,
    pub skip_failures: bool,
}

impl TranslateRequest {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            source_layer: None,
            projection: None,
            destination: destination.into(),
            dest_layer: None,
            append: false,
            promote_to_multi: false,
            assign_srs: None,
            skip_failures: false,
        }
    }

    pub fn source_layer(mut self, layer: impl Into<String>) -> Self {
        self.source_layer = Some(layer.into());
        self
    }

    pub fn projection(mut self, sql: impl Into<String>) -> Self {
        self.projection = Some(sql.into());
        self
    }

    pub fn dest_layer(mut self, layer: impl Into<String>) -> Self {
        self.dest_layer = Some(layer.into());
        self
    }

    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    pub fn promote_to_multi(mut self, promote: bool) -> Self {
        self.promote_to_multi = promote;
        self
    }

    pub fn assign_srs(mut self, srs: Option<String>) -> Self {
        self.assign_srs = srs;
        self
    }

    pub fn skip_failures(mut self, skip: bool) -> Self {
        self.skip_failures = skip;
        self
    }
}

/// Result of a translate: the tool's own verdict plus whatever it printed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub success: bool,
    pub diagnostic: String,
}

impl ToolOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            diagnostic: String::new(),
        }
    }

    pub fn failed(diagnostic: impl Into<String>) -> Self {
        Self {
            success: false,
            diagnostic: diagnostic.into(),
        }
    }
}

/// Opaque geometry processing engine
///
/// `Err` means the tool could not be run at all (missing executable, timeout);
/// a tool that ran and reported failure yields `Ok` with `success == false`.
#[async_trait]
pub trait GeometryTool: Send + Sync {
    /// Column and geometry metadata of one layer (the first layer when `layer` is `None`)
    async fn describe(&self, path: &Path, layer: Option<&str>) -> Result<LayerMetadata>;

    async fn translate(&self, request: &TranslateRequest) -> Result<ToolOutcome>;
}
