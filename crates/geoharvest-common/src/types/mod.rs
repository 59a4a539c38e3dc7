//! Common types used across geoharvest

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Separator between the components of a [`UnitKey`]
pub const KEY_SEPARATOR: char = '/';

/// Stable identifier of one work item within a stage.
///
/// A key is one or more non-empty components (e.g. state code, county code,
/// product name) rendered joined by `/`. Checkpoint lookups compare the
/// rendered string literally, so the same real-world unit must always be built
/// from the same components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitKey(String);

impl UnitKey {
    /// Build a key from its components
    pub fn from_parts<I, S>(parts: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rendered = String::new();
        for (i, part) in parts.into_iter().enumerate() {
            let part = part.as_ref().trim();
            if part.is_empty() {
                return Err(PipelineError::InvalidUnitKey(format!(
                    "component {} is empty",
                    i
                )));
            }
            // Keys double as output directory paths
            if part == "." || part == ".." {
                return Err(PipelineError::InvalidUnitKey(format!(
                    "component '{}' is not allowed",
                    part
                )));
            }
            if part.contains(KEY_SEPARATOR) {
                return Err(PipelineError::InvalidUnitKey(format!(
                    "component '{}' contains '{}'",
                    part, KEY_SEPARATOR
                )));
            }
            if i > 0 {
                rendered.push(KEY_SEPARATOR);
            }
            rendered.push_str(part);
        }

        if rendered.is_empty() {
            return Err(PipelineError::InvalidUnitKey("no components".to_string()));
        }

        Ok(Self(rendered))
    }

    /// Parse a rendered key (`"06/06037/product"`)
    pub fn parse(rendered: &str) -> Result<Self> {
        Self::from_parts(rendered.split(KEY_SEPARATOR))
    }

    /// Append one component, producing a child key
    pub fn child(&self, part: &str) -> Result<Self> {
        Self::from_parts(self.parts().chain(std::iter::once(part)))
    }

    pub fn parts(&self) -> impl Iterator<Item = &str> {
        self.0.split(KEY_SEPARATOR)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Component-wise prefix test: `06` is a prefix of `06/037` but not of `060/1`
    pub fn has_prefix(&self, prefix: &UnitKey) -> bool {
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0)
                && self.0[prefix.0.len()..].starts_with(KEY_SEPARATOR))
    }

    /// A file-system friendly rendering of the key (components joined by `_`)
    pub fn file_stem(&self) -> String {
        self.parts().collect::<Vec<_>>().join("_")
    }
}

impl std::fmt::Display for UnitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UnitKey {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<UnitKey> for String {
    fn from(key: UnitKey) -> Self {
        key.0
    }
}

impl std::str::FromStr for UnitKey {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// One work item as yielded by a source enumerator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitIdentity {
    pub key: UnitKey,

    /// Free-form attributes from the enumerator (download URL, expected size, file path, ...)
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl UnitIdentity {
    pub fn new(key: UnitKey) -> Self {
        Self {
            key,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Look up an attribute the unit cannot be processed without
    pub fn require(&self, name: &str) -> Result<&str> {
        self.attribute(name).ok_or_else(|| {
            PipelineError::InvalidUnitKey(format!("unit '{}' has no '{}' attribute", self.key, name))
        })
    }
}

/// Pipeline stage, each independently checkpointed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Extract,
    Convert,
    Merge,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Fetch, Stage::Extract, Stage::Convert, Stage::Merge];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Extract => "extract",
            Stage::Convert => "convert",
            Stage::Merge => "merge",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fetch" | "download" => Ok(Stage::Fetch),
            "extract" | "unzip" => Ok(Stage::Extract),
            "convert" => Ok(Stage::Convert),
            "merge" => Ok(Stage::Merge),
            _ => Err(PipelineError::config(format!("Unknown stage: {}", s))),
        }
    }
}

/// Outcome stored in a checkpoint record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Succeeded,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Succeeded => "succeeded",
            CheckpointStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for CheckpointStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "succeeded" => Ok(CheckpointStatus::Succeeded),
            "failed" => Ok(CheckpointStatus::Failed),
            _ => Err(PipelineError::checkpoint(format!("Unknown checkpoint status: {}", s))),
        }
    }
}
