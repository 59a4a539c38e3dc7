//! Generic checkpointed stage driver
//!
//! Every pipeline stage is a [`StageRunner`] run over a list of units with a
//! stage-specific [`StageAction`]. The runner reads the skip-set once, runs the
//! remaining units with bounded concurrency, and appends one checkpoint record
//! per attempted unit. A unit's error, panic or timeout becomes a `Failed`
//! record; it never stops the rest of the batch.

use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::sources::SourceEnumerator;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use geoharvest_common::{CheckpointStatus, PipelineError, Result, Stage, UnitIdentity, UnitKey};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// What a successful unit produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitOutcome {
    pub artifacts: Vec<PathBuf>,
    pub detail: Option<String>,
}

impl UnitOutcome {
    pub fn with_artifacts(artifacts: Vec<PathBuf>) -> Self {
        Self {
            artifacts,
            detail: None,
        }
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Stage-specific work for one unit
#[async_trait]
pub trait StageAction: Send + Sync {
    async fn execute(&self, unit: &UnitIdentity) -> Result<UnitOutcome>;
}

/// Result of one attempted unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    pub unit_key: UnitKey,
    pub status: CheckpointStatus,
    pub detail: Option<String>,
    /// The outcome could not be written to the store; the unit will run again
    pub unrecorded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Units whose checkpoint write failed (counted in neither succeeded nor failed)
    pub checkpoint_errors: usize,
    /// Units not started because the run was stopped
    pub cancelled: usize,
    /// Attempted units, ordered by key
    pub units: Vec<UnitReport>,
}

impl StageReport {
    fn new(stage: Stage) -> Self {
        Self {
            stage,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            checkpoint_errors: 0,
            cancelled: 0,
            units: Vec::new(),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &UnitReport> {
        self.units
            .iter()
            .filter(|u| u.unrecorded || u.status == CheckpointStatus::Failed)
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.checkpoint_errors == 0 && self.cancelled == 0
    }
}

/// Runs units of one stage against the checkpoint store
pub struct StageRunner {
    store: Arc<dyn CheckpointStore>,
    workers: usize,
    unit_timeout: Duration,
    show_progress: bool,
    stop: Arc<AtomicBool>,
}

impl StageRunner {
    pub fn new(store: Arc<dyn CheckpointStore>, workers: usize, unit_timeout: Duration) -> Self {
        Self {
            store,
            workers: workers.max(1),
            unit_timeout,
            show_progress: false,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Share a flag that stops dispatching new units once set
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Enumerate, then run. Enumeration failure stops the stage before any unit runs.
    pub async fn run_enumerated(
        &self,
        stage: Stage,
        enumerator: &dyn SourceEnumerator,
        action: Arc<dyn StageAction>,
    ) -> Result<StageReport> {
        let units = enumerator.enumerate().await.map_err(|e| match e {
            PipelineError::Enumeration(_) => e,
            other => PipelineError::enumeration(format!("{} stage: {}", stage, other)),
        })?;
        self.run(stage, units, action).await
    }

    pub async fn run(
        &self,
        stage: Stage,
        units: Vec<UnitIdentity>,
        action: Arc<dyn StageAction>,
    ) -> Result<StageReport> {
        let done = self.store.completed_keys(stage).await?;
        let mut report = StageReport::new(stage);

        let mut seen: HashSet<UnitKey> = HashSet::with_capacity(units.len());
        let mut pending = Vec::new();
        for unit in units {
            if !seen.insert(unit.key.clone()) {
                warn!(stage = %stage, unit = %unit.key, "Duplicate unit from enumerator, dropping");
                continue;
            }
            if done.contains(&unit.key) {
                report.skipped += 1;
            } else {
                pending.push(unit);
            }
        }

        info!(
            stage = %stage,
            pending = pending.len(),
            skipped = report.skipped,
            workers = self.workers,
            "Starting stage"
        );

        let progress = self.progress_bar(stage, pending.len() as u64);

        let results: Vec<Option<UnitReport>> = stream::iter(pending)
            .map(|unit| {
                let action = Arc::clone(&action);
                let progress = progress.clone();
                async move {
                    if self.stop.load(Ordering::SeqCst) {
                        return None;
                    }
                    progress.set_message(unit.key.to_string());
                    let result = self.run_unit(stage, unit, action).await;
                    progress.inc(1);
                    Some(result)
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        progress.finish_and_clear();

        for result in results {
            match result {
                None => report.cancelled += 1,
                Some(unit) => {
                    if unit.unrecorded {
                        report.checkpoint_errors += 1;
                    } else {
                        match unit.status {
                            CheckpointStatus::Succeeded => report.succeeded += 1,
                            CheckpointStatus::Failed => report.failed += 1,
                        }
                    }
                    report.units.push(unit);
                },
            }
        }
        report.units.sort_by(|a, b| a.unit_key.cmp(&b.unit_key));

        info!(
            stage = %stage,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            checkpoint_errors = report.checkpoint_errors,
            cancelled = report.cancelled,
            "Stage finished"
        );

        Ok(report)
    }

    async fn run_unit(
        &self,
        stage: Stage,
        unit: UnitIdentity,
        action: Arc<dyn StageAction>,
    ) -> UnitReport {
        let key = unit.key.clone();
        let limit = self.unit_timeout;

        // Own task so a panic inside the action is caught as a JoinError
        let handle =
            tokio::spawn(async move { tokio::time::timeout(limit, action.execute(&unit)).await });

        let record = match handle.await {
            Ok(Ok(Ok(outcome))) => {
                CheckpointRecord::succeeded(stage, key.clone(), outcome.artifacts)
                    .with_detail(outcome.detail)
            },
            Ok(Ok(Err(e))) => {
                warn!(stage = %stage, unit = %key, error = %e, "Unit failed");
                CheckpointRecord::failed(stage, key.clone(), e.to_string())
            },
            Ok(Err(_elapsed)) => {
                let e = PipelineError::Timeout {
                    what: format!("{} unit '{}'", stage, key),
                    secs: limit.as_secs(),
                };
                warn!(stage = %stage, unit = %key, error = %e, "Unit timed out");
                CheckpointRecord::failed(stage, key.clone(), e.to_string())
            },
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    format!("panicked: {}", panic_message(join_error.into_panic()))
                } else {
                    "task cancelled".to_string()
                };
                error!(stage = %stage, unit = %key, %message, "Unit aborted");
                CheckpointRecord::failed(stage, key.clone(), message)
            },
        };

        let status = record.status;
        let detail = record.detail.clone();
        let unrecorded = match self.store.record(record).await {
            Ok(_) => false,
            Err(e) => {
                error!(stage = %stage, unit = %key, error = %e, "Could not checkpoint unit, it will run again");
                true
            },
        };

        UnitReport {
            unit_key: key,
            status,
            detail,
            unrecorded,
        }
    }

    fn progress_bar(&self, stage: Stage, len: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{prefix:>8} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_prefix(stage.to_string());
        pb
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::checkpoint::{SqliteCheckpointStore, StageSummary};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct ScriptedAction {
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedAction {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StageAction for ScriptedAction {
        async fn execute(&self, unit: &UnitIdentity) -> Result<UnitOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(unit.key.to_string());
            match unit.attribute("mode") {
                Some("fail") => Err(PipelineError::fetch(unit.key.as_str(), "HTTP 503")),
                Some("panic") => panic!("boom in {}", unit.key),
                Some("hang") => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(UnitOutcome::default())
                },
                _ => Ok(UnitOutcome::with_artifacts(vec![PathBuf::from(format!(
                    "/out/{}.zip",
                    unit.key.file_stem()
                ))])),
            }
        }
    }

    fn unit(key: &str, mode: Option<&str>) -> UnitIdentity {
        let u = UnitIdentity::new(UnitKey::parse(key).unwrap());
        match mode {
            Some(m) => u.with_attribute("mode", m),
            None => u,
        }
    }

    fn runner(store: Arc<SqliteCheckpointStore>) -> StageRunner {
        StageRunner::new(store, 4, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_failures_are_recorded_and_isolated() {
        let store = Arc::new(SqliteCheckpointStore::open_in_memory().unwrap());
        let action = ScriptedAction::new();

        let report = runner(store.clone())
            .run(
                Stage::Fetch,
                vec![unit("01", None), unit("02", Some("fail")), unit("03", Some("panic"))],
                action.clone(),
            )
            .await
            .unwrap();

        assert_eq!((report.succeeded, report.failed, report.skipped), (1, 2, 0));
        let failed: Vec<&str> = report.failures().map(|u| u.unit_key.as_str()).collect();
        assert_eq!(failed, vec!["02", "03"]);
        assert!(report.units[2].detail.as_deref().unwrap().contains("boom in 03"));

        let latest = store
            .latest(Stage::Fetch, &UnitKey::parse("01").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.artifacts, vec![PathBuf::from("/out/01.zip")]);
        assert_eq!(
            store.summary(Stage::Fetch).await.unwrap(),
            StageSummary {
                succeeded: 1,
                failed: 2
            }
        );
    }

    #[tokio::test]
    async fn test_second_run_skips_succeeded_units() {
        let store = Arc::new(SqliteCheckpointStore::open_in_memory().unwrap());
        let action = ScriptedAction::new();
        let units = vec![unit("01", None), unit("02", None), unit("03", Some("fail"))];

        runner(store.clone())
            .run(Stage::Extract, units.clone(), action.clone())
            .await
            .unwrap();
        assert_eq!(action.calls.load(Ordering::SeqCst), 3);

        let report = runner(store.clone())
            .run(Stage::Extract, units, action.clone())
            .await
            .unwrap();

        // Only the failed unit is retried
        assert_eq!(report.skipped, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(action.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_duplicate_keys_dispatch_once() {
        let store = Arc::new(SqliteCheckpointStore::open_in_memory().unwrap());
        let action = ScriptedAction::new();

        let report = runner(store)
            .run(
                Stage::Convert,
                vec![unit("06/a", None), unit("06/a", None), unit("06/b", None)],
                action.clone(),
            )
            .await
            .unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(action.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_unit_failure() {
        let store = Arc::new(SqliteCheckpointStore::open_in_memory().unwrap());
        let action = ScriptedAction::new();

        let report = StageRunner::new(store, 2, Duration::from_secs(30))
            .run(
                Stage::Merge,
                vec![unit("slow", Some("hang")), unit("fast", None)],
                action,
            )
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        let slow = report.units.iter().find(|u| u.unit_key.as_str() == "slow").unwrap();
        assert!(slow.detail.as_deref().unwrap().contains("Timed out after 30s"));
    }

    #[tokio::test]
    async fn test_stop_flag_leaves_units_unattempted() {
        let store = Arc::new(SqliteCheckpointStore::open_in_memory().unwrap());
        let action = ScriptedAction::new();
        let stop = Arc::new(AtomicBool::new(true));

        let report = runner(store.clone())
            .with_stop_flag(stop)
            .run(Stage::Fetch, vec![unit("01", None), unit("02", None)], action.clone())
            .await
            .unwrap();

        assert_eq!(report.cancelled, 2);
        assert!(!report.is_clean());
        assert_eq!(action.calls.load(Ordering::SeqCst), 0);
        assert!(store.completed_keys(Stage::Fetch).await.unwrap().is_empty());
    }

    struct BrokenStore;

    #[async_trait]
    impl CheckpointStore for BrokenStore {
        async fn record(&self, _record: CheckpointRecord) -> Result<i64> {
            Err(PipelineError::checkpoint("disk full"))
        }

        async fn latest(&self, _stage: Stage, _key: &UnitKey) -> Result<Option<CheckpointRecord>> {
            Ok(None)
        }

        async fn latest_records(
            &self,
            _stage: Stage,
            _status: Option<CheckpointStatus>,
        ) -> Result<Vec<CheckpointRecord>> {
            Ok(Vec::new())
        }

        async fn invalidate(&self, _stage: Stage, _prefix: Option<&UnitKey>) -> Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_checkpoint_write_failure_is_not_success() {
        let action = ScriptedAction::new();
        let report = StageRunner::new(Arc::new(BrokenStore), 1, Duration::from_secs(5))
            .run(Stage::Fetch, vec![unit("01", None)], action)
            .await
            .unwrap();

        assert_eq!(report.succeeded, 0);
        assert_eq!(report.checkpoint_errors, 1);
        assert!(report.units[0].unrecorded);
        assert_eq!(report.failures().count(), 1);
    }
}
