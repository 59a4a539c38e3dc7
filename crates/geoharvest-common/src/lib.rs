//! geoharvest Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging, and error handling for the geoharvest workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the pipeline error taxonomy and result alias
//! - **Logging**: `tracing` subscriber setup shared by every binary
//! - **Types**: unit identities, stage names and checkpoint statuses
//!
//! # Example
//!
//! ```no_run
//! use geoharvest_common::types::{Stage, UnitKey};
//!
//! let key = UnitKey::from_parts(["06", "06037", "06037C_20210101"]).unwrap();
//! assert!(key.has_prefix(&UnitKey::parse("06").unwrap()));
//! assert_eq!(Stage::Fetch.as_str(), "fetch");
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{PipelineError, Result};
pub use types::{CheckpointStatus, Stage, UnitIdentity, UnitKey};
