//! Source schema introspection and reconciliation
//!
//! The merge stage unions datasets whose attribute columns and geometry column
//! names differ from source to source. [`SchemaCatalog`] reads each source's
//! columns through the geometry tool and sanitizes them; [`SchemaReconciler`]
//! turns a group of sources into one canonical column set plus a per-source
//! [`ProjectionPlan`] that maps every canonical column to a real column or NULL.

pub mod catalog;
pub mod reconcile;
pub mod sanitize;

use crate::tool::LayerMetadata;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, warn};

pub use catalog::SchemaCatalog;
pub use reconcile::{ColumnSource, ProjectionPlan, ReconciledSchema, SchemaReconciler};
pub use sanitize::{sanitize_column_name, MeasureDenylist, SchemaRules};

/// One attribute column of a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceColumn {
    /// Name as stored in the source
    pub real: String,
    pub sanitized: String,
}

/// A source layer's schema, ready for reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDataset {
    pub source_id: String,
    pub path: PathBuf,
    pub layer: String,
    /// Sanitized, denylist-filtered columns in natural order
    pub columns: Vec<SourceColumn>,
    /// Real geometry column name
    pub geometry_column: String,
    pub feature_count: Option<u64>,
}

impl SourceDataset {
    /// Sanitize and filter the tool's metadata
    ///
    /// When two real columns sanitize to the same name the later one wins and
    /// takes over the earlier one's position.
    pub fn from_metadata(
        source_id: impl Into<String>,
        path: impl Into<PathBuf>,
        meta: LayerMetadata,
        rules: &SchemaRules,
    ) -> Self {
        let source_id = source_id.into();
        let path = path.into();

        let mut columns: Vec<SourceColumn> = Vec::with_capacity(meta.fields.len());
        for real in meta.fields {
            let sanitized = sanitize_column_name(&real);
            if sanitized.is_empty() || rules.denylist.is_denied(&sanitized) {
                debug!(source = %source_id, column = %real, "Dropping measure column");
                continue;
            }
            match columns.iter_mut().find(|c| c.sanitized == sanitized) {
                Some(existing) => {
                    warn!(
                        source = %source_id,
                        sanitized = %sanitized,
                        replaced = %existing.real,
                        with = %real,
                        "Columns collide after sanitization, keeping the later one"
                    );
                    existing.real = real;
                },
                None => columns.push(SourceColumn { real, sanitized }),
            }
        }

        let geometry_column = match meta.geometry_column {
            Some(name) => name,
            None => {
                warn!(
                    source = %source_id,
                    path = %path.display(),
                    default = %rules.default_geometry,
                    "No geometry column reported, using default"
                );
                rules.default_geometry.clone()
            },
        };

        Self {
            source_id,
            path,
            layer: meta.layer,
            columns,
            geometry_column,
            feature_count: meta.feature_count,
        }
    }

    pub fn column(&self, sanitized: &str) -> Option<&SourceColumn> {
        self.columns.iter().find(|c| c.sanitized == sanitized)
    }

    pub fn sanitized_geometry(&self) -> String {
        sanitize_column_name(&self.geometry_column)
    }
}
