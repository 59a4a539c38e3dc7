//! Resumable stage checkpoints
//!
//! Every stage asks the store "has this unit already succeeded?" before doing any
//! work, and appends one record per finished attempt. The log is append-only: a
//! retry supersedes the earlier record instead of updating it, and reads always
//! use the latest record for a `(stage, unit_key)` pair.

pub mod schema;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use geoharvest_common::{CheckpointStatus, Result, Stage, UnitKey};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

pub use sqlite::SqliteCheckpointStore;

/// Outcome of one attempt at one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Row id, assigned by the store
    pub id: Option<i64>,
    pub stage: Stage,
    pub unit_key: UnitKey,
    pub status: CheckpointStatus,
    /// Error message for failures, free-form summary for successes
    pub detail: Option<String>,
    /// Files produced by the unit, in production order
    pub artifacts: Vec<PathBuf>,
    pub recorded_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn succeeded(stage: Stage, unit_key: UnitKey, artifacts: Vec<PathBuf>) -> Self {
        Self {
            id: None,
            stage,
            unit_key,
            status: CheckpointStatus::Succeeded,
            detail: None,
            artifacts,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(stage: Stage, unit_key: UnitKey, detail: impl Into<String>) -> Self {
        Self {
            id: None,
            stage,
            unit_key,
            status: CheckpointStatus::Failed,
            detail: Some(detail.into()),
            artifacts: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: Option<String>) -> Self {
        self.detail = detail;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == CheckpointStatus::Succeeded
    }
}

/// Per-stage counts over the latest record of every unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// Durable checkpoint log
///
/// Implementations must make `record` durable before returning `Ok`; a unit whose
/// record could not be written is retried on the next run.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a record, returning its id
    async fn record(&self, record: CheckpointRecord) -> Result<i64>;

    /// Latest record for one unit
    async fn latest(&self, stage: Stage, unit_key: &UnitKey) -> Result<Option<CheckpointRecord>>;

    /// Latest record of every unit in a stage, optionally filtered by status, ordered by key
    async fn latest_records(
        &self,
        stage: Stage,
        status: Option<CheckpointStatus>,
    ) -> Result<Vec<CheckpointRecord>>;

    /// Delete all records of a stage, or only those under `prefix`. Returns the number of rows removed.
    async fn invalidate(&self, stage: Stage, prefix: Option<&UnitKey>) -> Result<usize>;

    /// True iff the latest record for the unit is `Succeeded`
    async fn is_done(&self, stage: Stage, unit_key: &UnitKey) -> Result<bool> {
        Ok(self
            .latest(stage, unit_key)
            .await?
            .is_some_and(|r| r.is_success()))
    }

    /// The skip-set for a stage run
    async fn completed_keys(&self, stage: Stage) -> Result<HashSet<UnitKey>> {
        Ok(self
            .latest_records(stage, Some(CheckpointStatus::Succeeded))
            .await?
            .into_iter()
            .map(|r| r.unit_key)
            .collect())
    }

    async fn summary(&self, stage: Stage) -> Result<StageSummary> {
        let mut summary = StageSummary::default();
        for record in self.latest_records(stage, None).await? {
            match record.status {
                CheckpointStatus::Succeeded => summary.succeeded += 1,
                CheckpointStatus::Failed => summary.failed += 1,
            }
        }
        Ok(summary)
    }
}
