//! Stage wiring: fetch -> extract -> convert -> merge
//!
//! [`Pipeline`] owns the shared collaborators (checkpoint store, geometry tool,
//! fetcher, extractor) and builds the enumerator and action for each stage.
//! Stages are chained only through the checkpoint store.

pub mod actions;
pub mod report;

use crate::checkpoint::{CheckpointStore, SqliteCheckpointStore, StageSummary};
use crate::config::PipelineConfig;
use crate::extract::{Extractor, ZipExtractor};
use crate::fetch::{BlobFetcher, HttpBlobFetcher};
use crate::merge::MergeEngine;
use crate::schema::{SchemaCatalog, SchemaRules};
use crate::sources::{CheckpointEnumerator, ManifestEnumerator, MergeGroupEnumerator, SourceEnumerator};
use crate::stage::{StageAction, StageReport, StageRunner};
use crate::tool::{GeometryTool, OgrTool};
use geoharvest_common::{CheckpointStatus, Result, Stage, UnitKey};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub use actions::{ConvertAction, ExtractAction, FetchAction, MergeAction};

/// Outcome of a force-rebuild request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub records_removed: usize,
    pub artifacts_removed: usize,
    /// Artifacts that could not be deleted
    pub artifacts_failed: Vec<PathBuf>,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn CheckpointStore>,
    tool: Arc<dyn GeometryTool>,
    fetcher: Arc<dyn BlobFetcher>,
    extractor: Arc<dyn Extractor>,
    catalog: Arc<SchemaCatalog>,
    show_progress: bool,
    stop: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn CheckpointStore>,
        tool: Arc<dyn GeometryTool>,
        fetcher: Arc<dyn BlobFetcher>,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        let catalog = Arc::new(SchemaCatalog::new(
            tool.clone(),
            SchemaRules::from_config(&config.schema),
        ));
        Self {
            config,
            store,
            tool,
            fetcher,
            extractor,
            catalog,
            show_progress: false,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Production wiring: SQLite store, GDAL tools, HTTP fetcher, zip extractor
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let store = Arc::new(SqliteCheckpointStore::open(&config.database.path)?);
        let tool = Arc::new(OgrTool::new(&config.tool));
        let fetcher = Arc::new(HttpBlobFetcher::new(&config.processing)?);
        Ok(Self::new(config, store, tool, fetcher, Arc::new(ZipExtractor)))
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Flag checked between units; set it to stop dispatching new work
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    fn runner(&self) -> StageRunner {
        StageRunner::new(
            Arc::clone(&self.store),
            self.config.processing.workers,
            self.config.processing.unit_timeout(),
        )
        .with_progress(self.show_progress)
        .with_stop_flag(Arc::clone(&self.stop))
    }

    fn enumerator(&self, stage: Stage) -> Box<dyn SourceEnumerator> {
        let store = Arc::clone(&self.store);
        match stage {
            Stage::Fetch => Box::new(ManifestEnumerator::new(&self.config.paths.manifest)),
            Stage::Extract => {
                Box::new(CheckpointEnumerator::new(store, Stage::Fetch).with_extensions(["zip"]))
            },
            Stage::Convert => {
                Box::new(CheckpointEnumerator::new(store, Stage::Extract).with_extensions(["shp"]))
            },
            Stage::Merge => Box::new(MergeGroupEnumerator::new(store, self.config.merge.groups.clone())),
        }
    }

    fn action(&self, stage: Stage) -> Arc<dyn StageAction> {
        let paths = &self.config.paths;
        match stage {
            Stage::Fetch => Arc::new(FetchAction::new(Arc::clone(&self.fetcher), &paths.download_dir)),
            Stage::Extract => {
                Arc::new(ExtractAction::new(Arc::clone(&self.extractor), &paths.extract_dir))
            },
            Stage::Convert => Arc::new(ConvertAction::new(
                Arc::clone(&self.tool),
                self.config.tool.clone(),
                &paths.temp_dir,
                &paths.converted_dir,
            )),
            Stage::Merge => Arc::new(MergeAction::new(
                Arc::clone(&self.catalog),
                MergeEngine::new(Arc::clone(&self.tool), &paths.temp_dir),
                &paths.merged_dir,
                &self.config.tool.output_extension,
                self.config.merge.layer_name.clone(),
            )),
        }
    }

    pub async fn run_stage(&self, stage: Stage) -> Result<StageReport> {
        let enumerator = self.enumerator(stage);
        self.runner()
            .run_enumerated(stage, enumerator.as_ref(), self.action(stage))
            .await
    }

    /// Every stage in order. A fatal error stops the chain; unit failures do not.
    pub async fn run_all(&self) -> Result<Vec<StageReport>> {
        let mut reports = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            if self.stop.load(Ordering::SeqCst) {
                warn!(stage = %stage, "Stopped before stage");
                break;
            }
            reports.push(self.run_stage(stage).await?);
        }
        Ok(reports)
    }

    pub async fn status(&self) -> Result<Vec<(Stage, StageSummary)>> {
        let mut rows = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            rows.push((stage, self.store.summary(stage).await?));
        }
        Ok(rows)
    }

    /// Artifacts recorded by the latest checkpoints that `invalidate` would clear
    pub async fn recorded_artifacts(&self, stage: Stage, prefix: Option<&UnitKey>) -> Result<Vec<PathBuf>> {
        Ok(self
            .store
            .latest_records(stage, Some(CheckpointStatus::Succeeded))
            .await?
            .into_iter()
            .filter(|r| prefix.map_or(true, |p| r.unit_key.has_prefix(p)))
            .flat_map(|r| r.artifacts)
            .collect())
    }

    /// Force rebuild: drop checkpoints, optionally deleting their artifacts
    ///
    /// Records are removed before files so a crash in between only leaves
    /// orphaned files, never a checkpoint pointing at a deleted artifact.
    pub async fn invalidate(
        &self,
        stage: Stage,
        prefix: Option<&UnitKey>,
        delete_artifacts: bool,
    ) -> Result<InvalidationReport> {
        let artifacts = if delete_artifacts {
            self.recorded_artifacts(stage, prefix).await?
        } else {
            Vec::new()
        };

        let mut report = InvalidationReport {
            records_removed: self.store.invalidate(stage, prefix).await?,
            ..InvalidationReport::default()
        };

        for path in artifacts {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => report.artifacts_removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not delete artifact");
                    report.artifacts_failed.push(path);
                },
            }
        }

        info!(
            stage = %stage,
            prefix = prefix.map(|p| p.as_str()).unwrap_or("*"),
            records = report.records_removed,
            artifacts = report.artifacts_removed,
            "Invalidated checkpoints"
        );

        Ok(report)
    }
}
