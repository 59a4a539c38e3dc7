//! geoharvest ingestion library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Resumable, checkpointed ingestion of many independently produced geospatial
//! datasets, and a schema-reconciling merge of those datasets into one layer
//! per logical group.
//!
//! # Stages
//!
//! - **fetch**: download the units listed in a CSV manifest
//! - **extract**: unpack downloaded archives
//! - **convert**: turn extracted shapefiles into GeoPackage layers
//! - **merge**: union every converted layer of a group into one output
//!
//! Each stage is a [`stage::StageRunner`] run that consults the
//! [`checkpoint::CheckpointStore`] before doing any work, so an interrupted run
//! resumes where it stopped.
//!
//! # Example
//!
//! ```no_run
//! use geoharvest_ingest::config::PipelineConfig;
//! use geoharvest_ingest::pipeline::Pipeline;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load(None)?;
//!     let pipeline = Pipeline::from_config(config)?;
//!     for report in pipeline.run_all().await? {
//!         println!("{}: {} succeeded, {} failed", report.stage, report.succeeded, report.failed);
//!     }
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod extract;
pub mod fetch;
pub mod merge;
pub mod pipeline;
pub mod schema;
pub mod sources;
pub mod stage;
pub mod tool;

pub use checkpoint::{CheckpointRecord, CheckpointStore, SqliteCheckpointStore};
pub use config::PipelineConfig;
pub use pipeline::Pipeline;
pub use stage::{StageAction, StageReport, StageRunner, UnitOutcome};
