//! Error types for geoharvest
//!
//! Per-unit errors (fetch, extract, tool, introspection, seed) are caught at the
//! stage runner boundary and turned into `Failed` checkpoint records. Fatal errors
//! (enumeration, configuration, checkpoint store unavailable at start) stop a
//! stage run before any unit is attempted. See [`PipelineError::is_fatal`].

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Main error type for the pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The source enumerator could not produce the unit list
    #[error("Enumeration failed: {0}")]
    Enumeration(String),

    /// Downloading a unit's raw data failed
    #[error("Fetch failed for '{unit}': {message}")]
    Fetch { unit: String, message: String },

    /// Unpacking an archive failed
    #[error("Extraction failed for '{archive}': {message}")]
    Extract { archive: String, message: String },

    /// The external geometry tool reported failure, timed out, or could not be spawned
    #[error("Geometry tool failed: {diagnostic}")]
    ToolInvocation { diagnostic: String },

    /// Reading a source's column list failed
    #[error("Schema introspection failed for '{path}': {message}")]
    SchemaIntrospection { path: String, message: String },

    /// The first source of a merge group could not seed the output
    #[error("Seeding merge group '{group}' failed: {diagnostic}")]
    Seed { group: String, diagnostic: String },

    /// Reading or writing the checkpoint store failed
    #[error("Checkpoint store error: {0}")]
    CheckpointIo(String),

    /// A unit key could not be built or parsed
    #[error("Invalid unit key: {0}")]
    InvalidUnitKey(String),

    /// A unit did not finish within its time limit
    #[error("Timed out after {secs}s: {what}")]
    Timeout { what: String, secs: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether this error must stop the whole stage run rather than a single unit
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Enumeration(_) | Self::Config(_))
    }

    pub fn enumeration(msg: impl Into<String>) -> Self {
        Self::Enumeration(msg.into())
    }

    pub fn fetch(unit: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            unit: unit.into(),
            message: message.into(),
        }
    }

    pub fn extract(archive: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Extract {
            archive: archive.into(),
            message: message.into(),
        }
    }

    pub fn tool(diagnostic: impl Into<String>) -> Self {
        Self::ToolInvocation {
            diagnostic: diagnostic.into(),
        }
    }

    pub fn introspection(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaIntrospection {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn seed(group: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self::Seed {
            group: group.into(),
            diagnostic: diagnostic.into(),
        }
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::CheckpointIo(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
