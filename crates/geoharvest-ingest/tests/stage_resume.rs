//! StageRunner against an on-disk checkpoint store

use async_trait::async_trait;
use geoharvest_common::{PipelineError, Result, Stage, UnitIdentity, UnitKey};
use geoharvest_ingest::checkpoint::{CheckpointStore, SqliteCheckpointStore};
use geoharvest_ingest::stage::{StageAction, StageRunner, UnitOutcome};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Writes one file per unit and remembers what it ran
struct WriteAction {
    out_dir: PathBuf,
    executed: Mutex<Vec<UnitKey>>,
    failing: HashSet<String>,
    /// Set the stop flag once this many units have run
    stop_after: Option<(usize, Arc<AtomicBool>)>,
}

impl WriteAction {
    fn new(out_dir: &Path) -> Self {
        Self {
            out_dir: out_dir.to_path_buf(),
            executed: Mutex::new(Vec::new()),
            failing: HashSet::new(),
            stop_after: None,
        }
    }

    fn executed(&self) -> Vec<UnitKey> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageAction for WriteAction {
    async fn execute(&self, unit: &UnitIdentity) -> Result<UnitOutcome> {
        let count = {
            let mut executed = self.executed.lock().unwrap();
            executed.push(unit.key.clone());
            executed.len()
        };
        if let Some((limit, stop)) = &self.stop_after {
            if count >= *limit {
                stop.store(true, Ordering::SeqCst);
            }
        }

        if self.failing.contains(unit.key.as_str()) {
            return Err(PipelineError::fetch(unit.key.as_str(), "HTTP 503"));
        }

        let path = self.out_dir.join(unit.key.file_stem());
        std::fs::write(&path, unit.key.as_str()).unwrap();
        Ok(UnitOutcome::with_artifacts(vec![path]))
    }
}

fn units(n: usize) -> Vec<UnitIdentity> {
    (0..n)
        .map(|i| UnitIdentity::new(UnitKey::from_parts(["06".to_string(), format!("{:05}", i)]).unwrap()))
        .collect()
}

fn runner(store: Arc<SqliteCheckpointStore>, workers: usize) -> StageRunner {
    StageRunner::new(store, workers, Duration::from_secs(30))
}

#[tokio::test]
async fn test_second_run_has_no_side_effects() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("checkpoints.db");
    let action = Arc::new(WriteAction::new(dir.path()));

    let first = runner(Arc::new(SqliteCheckpointStore::open(&db).unwrap()), 4)
        .run(Stage::Fetch, units(12), action.clone())
        .await
        .unwrap();
    assert_eq!(first.succeeded, 12);
    assert_eq!(action.executed().len(), 12);

    let second = runner(Arc::new(SqliteCheckpointStore::open(&db).unwrap()), 4)
        .run(Stage::Fetch, units(12), action.clone())
        .await
        .unwrap();
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.skipped, 12);
    assert_eq!(action.executed().len(), 12);
}

#[tokio::test]
async fn test_interrupted_run_resumes_remaining_units() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("checkpoints.db");
    let stop = Arc::new(AtomicBool::new(false));

    let mut interrupted = WriteAction::new(dir.path());
    interrupted.stop_after = Some((4, stop.clone()));
    let interrupted = Arc::new(interrupted);

    let first = runner(Arc::new(SqliteCheckpointStore::open(&db).unwrap()), 1)
        .with_stop_flag(stop)
        .run(Stage::Fetch, units(10), interrupted.clone())
        .await
        .unwrap();
    assert_eq!(first.succeeded, 4);
    assert_eq!(first.cancelled, 6);

    // Fresh process: reopen the store from disk
    let resumed = Arc::new(WriteAction::new(dir.path()));
    let store = Arc::new(SqliteCheckpointStore::open(&db).unwrap());
    let second = runner(store.clone(), 3)
        .run(Stage::Fetch, units(10), resumed.clone())
        .await
        .unwrap();
    assert_eq!(second.skipped, 4);
    assert_eq!(second.succeeded, 6);

    let first_keys: HashSet<UnitKey> = interrupted.executed().into_iter().collect();
    let second_keys: HashSet<UnitKey> = resumed.executed().into_iter().collect();
    assert_eq!(second_keys.len(), 6);
    assert!(first_keys.is_disjoint(&second_keys));
    assert_eq!(first_keys.len() + second_keys.len(), 10);

    // Same checkpoint state as one uninterrupted run
    assert_eq!(store.summary(Stage::Fetch).await.unwrap().succeeded, 10);
    assert_eq!(store.latest_records(Stage::Fetch, None).await.unwrap().len(), 10);
}

#[tokio::test]
async fn test_failed_units_are_retried() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("checkpoints.db");
    let store = Arc::new(SqliteCheckpointStore::open(&db).unwrap());

    let mut flaky = WriteAction::new(dir.path());
    flaky.failing.insert("06/00001".to_string());
    let first = runner(store.clone(), 2)
        .run(Stage::Fetch, units(3), Arc::new(flaky))
        .await
        .unwrap();
    assert_eq!(first.succeeded, 2);
    assert_eq!(first.failed, 1);
    let failure = first.failures().next().unwrap();
    assert_eq!(failure.unit_key.as_str(), "06/00001");
    assert!(failure.detail.as_deref().unwrap().contains("HTTP 503"));

    let healthy = Arc::new(WriteAction::new(dir.path()));
    let second = runner(store.clone(), 2)
        .run(Stage::Fetch, units(3), healthy.clone())
        .await
        .unwrap();
    assert_eq!(second.skipped, 2);
    assert_eq!(second.succeeded, 1);
    assert_eq!(healthy.executed(), vec![UnitKey::parse("06/00001").unwrap()]);

    let summary = store.summary(Stage::Fetch).await.unwrap();
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn test_invalidated_prefix_runs_again() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("checkpoints.db");
    let store = Arc::new(SqliteCheckpointStore::open(&db).unwrap());

    let mut all = units(3);
    all.push(UnitIdentity::new(UnitKey::parse("48/00000").unwrap()));

    runner(store.clone(), 2)
        .run(Stage::Extract, all.clone(), Arc::new(WriteAction::new(dir.path())))
        .await
        .unwrap();

    let removed = store
        .invalidate(Stage::Extract, Some(&UnitKey::parse("06").unwrap()))
        .await
        .unwrap();
    assert_eq!(removed, 3);
    assert!(store.is_done(Stage::Extract, &UnitKey::parse("48/00000").unwrap()).await.unwrap());

    let again = Arc::new(WriteAction::new(dir.path()));
    let report = runner(store, 2)
        .run(Stage::Extract, all, again.clone())
        .await
        .unwrap();
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.skipped, 1);
    assert!(again.executed().iter().all(|k| k.as_str().starts_with("06/")));
}
