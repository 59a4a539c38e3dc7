//! CSV manifest of fetchable units

use crate::sources::SourceEnumerator;
use async_trait::async_trait;
use geoharvest_common::{PipelineError, Result, UnitIdentity, UnitKey};
use std::path::PathBuf;
use tracing::info;

/// Column holding the rendered unit key
pub const UNIT_KEY_COLUMN: &str = "unit_key";

/// Reads units from a CSV file with a `unit_key` column
///
/// Every other column becomes a unit attribute (`url`, `size_bytes`, ...);
/// empty cells are omitted.
pub struct ManifestEnumerator {
    path: PathBuf,
}

impl ManifestEnumerator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn parse(text: &[u8]) -> Result<Vec<UnitIdentity>> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(text);

        let headers = reader
            .headers()
            .map_err(|e| PipelineError::enumeration(format!("unreadable manifest header: {}", e)))?
            .clone();

        let key_index = headers
            .iter()
            .position(|h| h == UNIT_KEY_COLUMN)
            .ok_or_else(|| {
                PipelineError::enumeration(format!("manifest has no '{}' column", UNIT_KEY_COLUMN))
            })?;

        let mut units = Vec::new();
        for (row, record) in reader.records().enumerate() {
            // Header is line 1
            let line = row + 2;
            let record = record
                .map_err(|e| PipelineError::enumeration(format!("manifest line {}: {}", line, e)))?;

            let raw_key = record.get(key_index).unwrap_or_default();
            let key = UnitKey::parse(raw_key)
                .map_err(|e| PipelineError::enumeration(format!("manifest line {}: {}", line, e)))?;

            let mut unit = UnitIdentity::new(key);
            for (i, (name, value)) in headers.iter().zip(record.iter()).enumerate() {
                if i != key_index && !value.is_empty() {
                    unit = unit.with_attribute(name, value);
                }
            }
            units.push(unit);
        }

        Ok(units)
    }
}

#[async_trait]
impl SourceEnumerator for ManifestEnumerator {
    async fn enumerate(&self) -> Result<Vec<UnitIdentity>> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            PipelineError::enumeration(format!("cannot read manifest {}: {}", self.path.display(), e))
        })?;
        let units = Self::parse(&bytes)?;
        info!(manifest = %self.path.display(), units = units.len(), "Loaded manifest");
        Ok(units)
    }
}
