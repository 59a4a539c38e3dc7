//! Parser for `ogrinfo -json -so` output

use geoharvest_common::{PipelineError, Result};
use serde::Deserialize;
use std::path::Path;

/// Layer description as reported by the geometry tool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerMetadata {
    pub layer: String,
    /// Attribute column names in natural order, unsanitized
    pub fields: Vec<String>,
    /// Geometry column name; `None` when the driver does not name it (shapefiles)
    pub geometry_column: Option<String>,
    pub feature_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OgrInfoDocument {
    #[serde(default)]
    layers: Vec<OgrInfoLayer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OgrInfoLayer {
    name: String,
    #[serde(default)]
    fields: Vec<NamedEntry>,
    #[serde(default)]
    geometry_fields: Vec<NamedEntry>,
    feature_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct NamedEntry {
    #[serde(default)]
    name: String,
}

/// Pick `layer` (or the first layer) out of an `ogrinfo -json` document
pub fn parse_ogrinfo_json(path: &Path, json: &str, layer: Option<&str>) -> Result<LayerMetadata> {
    let doc: OgrInfoDocument = serde_json::from_str(json).map_err(|e| {
        PipelineError::introspection(path.display().to_string(), format!("unreadable ogrinfo output: {}", e))
    })?;

    let found = match layer {
        Some(name) => doc.layers.into_iter().find(|l| l.name == name),
        None => doc.layers.into_iter().next(),
    };

    let found = found.ok_or_else(|| {
        PipelineError::introspection(
            path.display().to_string(),
            match layer {
                Some(name) => format!("layer '{}' not found", name),
                None => "dataset has no layers".to_string(),
            },
        )
    })?;

    let geometry_column = found
        .geometry_fields
        .into_iter()
        .map(|g| g.name)
        .find(|name| !name.trim().is_empty());

    Ok(LayerMetadata {
        layer: found.name,
        fields: found.fields.into_iter().map(|f| f.name).collect(),
        geometry_column,
        // ogrinfo reports -1 when counting would require a full scan
        feature_count: found.feature_count.and_then(|c| u64::try_from(c).ok()),
    })
}
