//! The four stage actions

use crate::config::ToolConfig;
use crate::extract::Extractor;
use crate::fetch::BlobFetcher;
use crate::merge::{persist, FailedSource, MergeEngine, MergeGroup, MergeSource, TempFile};
use crate::schema::{SchemaCatalog, SchemaReconciler};
use crate::sources::{MEMBERS_ATTRIBUTE, PATH_ATTRIBUTE};
use crate::stage::{StageAction, UnitOutcome};
use crate::tool::{GeometryTool, TranslateRequest};
use async_trait::async_trait;
use geoharvest_common::{PipelineError, Result, UnitIdentity, UnitKey};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Directory holding a unit's outputs: one path segment per key component
///
/// `06/06037C.zip/S_FLD_HAZ_AR.shp~2` lands in
/// `<base>/06/06037C.zip/S_FLD_HAZ_AR.shp~2`, so distinct keys never share a
/// directory.
fn unit_dir(base: &Path, key: &UnitKey) -> PathBuf {
    key.parts().fold(base.to_path_buf(), |dir, part| dir.join(part))
}

/// Downloads a manifest unit
pub struct FetchAction {
    fetcher: Arc<dyn BlobFetcher>,
    dest_dir: PathBuf,
}

impl FetchAction {
    pub fn new(fetcher: Arc<dyn BlobFetcher>, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            dest_dir: dest_dir.into(),
        }
    }
}

#[async_trait]
impl StageAction for FetchAction {
    async fn execute(&self, unit: &UnitIdentity) -> Result<UnitOutcome> {
        let dir = unit_dir(&self.dest_dir, &unit.key);
        let path = self.fetcher.fetch(unit, &dir).await?;
        Ok(UnitOutcome::with_artifacts(vec![path]))
    }
}

/// Unpacks one downloaded archive
pub struct ExtractAction {
    extractor: Arc<dyn Extractor>,
    dest_dir: PathBuf,
}

impl ExtractAction {
    pub fn new(extractor: Arc<dyn Extractor>, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            extractor,
            dest_dir: dest_dir.into(),
        }
    }
}

#[async_trait]
impl StageAction for ExtractAction {
    async fn execute(&self, unit: &UnitIdentity) -> Result<UnitOutcome> {
        let archive = PathBuf::from(unit.require(PATH_ATTRIBUTE)?);
        let dir = unit_dir(&self.dest_dir, &unit.key);
        let files = self.extractor.extract(&archive, &dir).await?;

        let count = files.len();
        Ok(UnitOutcome::with_artifacts(files.into_iter().map(|f| f.path).collect())
            .detail(format!("{} files", count)))
    }
}

/// Converts one extracted shapefile into the output format
///
/// Output lands at `<dest>/<unit key components>/<shapefile stem>.<ext>` so the
/// file stem still names the logical layer for merge grouping.
pub struct ConvertAction {
    tool: Arc<dyn GeometryTool>,
    config: ToolConfig,
    temp_dir: PathBuf,
    dest_dir: PathBuf,
}

impl ConvertAction {
    pub fn new(
        tool: Arc<dyn GeometryTool>,
        config: ToolConfig,
        temp_dir: impl Into<PathBuf>,
        dest_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tool,
            config,
            temp_dir: temp_dir.into(),
            dest_dir: dest_dir.into(),
        }
    }

    fn extension(&self) -> &str {
        self.config.output_extension.trim_start_matches('.')
    }
}

#[async_trait]
impl StageAction for ConvertAction {
    async fn execute(&self, unit: &UnitIdentity) -> Result<UnitOutcome> {
        let source = PathBuf::from(unit.require(PATH_ATTRIBUTE)?);
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| PipelineError::tool(format!("'{}' has no file name", source.display())))?;

        let output = unit_dir(&self.dest_dir, &unit.key).join(format!("{}.{}", stem, self.extension()));

        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let temp = TempFile::new(
            self.temp_dir
                .join(format!("{}.{}", uuid::Uuid::new_v4().simple(), self.extension())),
        );

        let request = TranslateRequest::new(&source, temp.path())
            .dest_layer(&stem)
            .promote_to_multi(true)
            .assign_srs(self.config.target_srs.clone())
            .skip_failures(self.config.skip_failures);

        let outcome = self.tool.translate(&request).await?;
        if !outcome.success {
            return Err(PipelineError::tool(format!("{}: {}", source.display(), outcome.diagnostic)));
        }

        persist(temp.path(), &output).await?;
        temp.disarm();

        let converted = UnitOutcome::with_artifacts(vec![output]);
        // Features dropped under -skipfailures are reported without failing the unit
        Ok(match outcome.diagnostic.lines().next() {
            Some(first) if !first.trim().is_empty() => converted.detail(first.trim()),
            _ => converted,
        })
    }
}

/// Merges one group of converted sources
pub struct MergeAction {
    catalog: Arc<SchemaCatalog>,
    reconciler: SchemaReconciler,
    engine: MergeEngine,
    merged_dir: PathBuf,
    extension: String,
    layer_name: Option<String>,
}

impl MergeAction {
    pub fn new(
        catalog: Arc<SchemaCatalog>,
        engine: MergeEngine,
        merged_dir: impl Into<PathBuf>,
        extension: &str,
        layer_name: Option<String>,
    ) -> Self {
        let reconciler = SchemaReconciler::new(catalog.rules().clone());
        Self {
            catalog,
            reconciler,
            engine,
            merged_dir: merged_dir.into(),
            extension: extension.trim_start_matches('.').to_string(),
            layer_name,
        }
    }

    pub fn output_path(&self, group_key: &str) -> PathBuf {
        self.merged_dir.join(format!("{}.{}", group_key, self.extension))
    }
}

#[async_trait]
impl StageAction for MergeAction {
    async fn execute(&self, unit: &UnitIdentity) -> Result<UnitOutcome> {
        let group_key = unit.key.file_stem();
        let members: Vec<MergeSource> = serde_json::from_str(unit.require(MEMBERS_ATTRIBUTE)?)?;

        let mut datasets = Vec::with_capacity(members.len());
        let mut readable = Vec::with_capacity(members.len());
        let mut unreadable = Vec::new();
        for member in members {
            match self
                .catalog
                .introspect(&member.source_id, &member.path, member.layer.as_deref())
                .await
            {
                Ok(dataset) => {
                    datasets.push(dataset);
                    readable.push(member);
                },
                Err(e) => {
                    warn!(group = %group_key, source = %member.source_id, error = %e, "Excluding unreadable source");
                    unreadable.push(FailedSource {
                        source_id: member.source_id,
                        reason: e.to_string(),
                    });
                },
            }
        }

        let schema = self.reconciler.reconcile(&datasets);
        info!(
            group = %group_key,
            sources = datasets.len(),
            columns = schema.canonical_columns.len(),
            geometry = %schema.canonical_geometry,
            "Reconciled group schema"
        );

        let group = MergeGroup {
            layer_name: self.layer_name.clone().unwrap_or_else(|| group_key.clone()),
            output_path: self.output_path(&group_key),
            group_key,
            members: readable,
        };

        let mut result = self.engine.merge(&group, &schema).await?;
        unreadable.append(&mut result.failed_sources);
        result.failed_sources = unreadable;

        let mut detail = format!("merged {} sources", result.succeeded_sources.len());
        if !result.failed_sources.is_empty() {
            let failed: Vec<String> = result
                .failed_sources
                .iter()
                .map(|f| format!("{} ({})", f.source_id, f.reason))
                .collect();
            detail.push_str(&format!("; {} failed: {}", failed.len(), failed.join("; ")));
        }

        Ok(UnitOutcome::with_artifacts(vec![result.output_path]).detail(detail))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::tool::{LayerMetadata, ToolOutcome};
    use tempfile::TempDir;

    struct CopyTool {
        fail: bool,
    }

    #[async_trait]
    impl GeometryTool for CopyTool {
        async fn describe(&self, _path: &Path, _layer: Option<&str>) -> Result<LayerMetadata> {
            Ok(LayerMetadata::default())
        }

        async fn translate(&self, request: &TranslateRequest) -> Result<ToolOutcome> {
            assert!(request.promote_to_multi);
            std::fs::write(&request.destination, b"partial").unwrap();
            if self.fail {
                Ok(ToolOutcome::failed("ERROR 1: Unable to open datasource"))
            } else {
                std::fs::copy(&request.source, &request.destination).unwrap();
                Ok(ToolOutcome {
                    success: true,
                    diagnostic: "Warning 1: 2 features skipped\n".to_string(),
                })
            }
        }
    }

    fn shp_unit(dir: &TempDir) -> UnitIdentity {
        let shp = dir.path().join("S_FLD_HAZ_AR.shp");
        std::fs::write(&shp, b"shape").unwrap();
        UnitIdentity::new(UnitKey::parse("06/06037C.zip/S_FLD_HAZ_AR.shp").unwrap())
            .with_attribute(PATH_ATTRIBUTE, shp.to_string_lossy())
    }

    #[test]
    fn test_unit_dir_keeps_every_component() {
        let base = Path::new("/c");
        assert_eq!(
            unit_dir(base, &UnitKey::parse("06/a.zip/x.shp~2").unwrap()),
            Path::new("/c/06/a.zip/x.shp~2")
        );
        // Underscores in a single component do not alias a multi-component key
        assert_ne!(
            unit_dir(base, &UnitKey::parse("06_a.zip").unwrap()),
            unit_dir(base, &UnitKey::parse("06/a.zip").unwrap())
        );
    }

    #[tokio::test]
    async fn test_convert_keeps_layer_stem() {
        let dir = TempDir::new().unwrap();
        let action = ConvertAction::new(
            Arc::new(CopyTool { fail: false }),
            ToolConfig::default(),
            dir.path().join("tmp"),
            dir.path().join("converted"),
        );

        let outcome = action.execute(&shp_unit(&dir)).await.unwrap();
        let expected = dir
            .path()
            .join("converted/06/06037C.zip/S_FLD_HAZ_AR.shp/S_FLD_HAZ_AR.gpkg");
        assert_eq!(outcome.artifacts, vec![expected.clone()]);
        assert_eq!(std::fs::read(expected).unwrap(), b"shape");
        assert_eq!(outcome.detail.as_deref(), Some("Warning 1: 2 features skipped"));
        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_convert_failure_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let action = ConvertAction::new(
            Arc::new(CopyTool { fail: true }),
            ToolConfig::default(),
            dir.path().join("tmp"),
            dir.path().join("converted"),
        );

        let err = action.execute(&shp_unit(&dir)).await.unwrap_err();
        assert!(matches!(err, PipelineError::ToolInvocation { .. }));
        assert!(!dir.path().join("converted").exists());
        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_same_named_shapefiles_convert_to_distinct_outputs() {
        use crate::checkpoint::{CheckpointRecord, CheckpointStore, SqliteCheckpointStore};
        use crate::sources::{CheckpointEnumerator, SourceEnumerator};
        use geoharvest_common::Stage;

        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a/S_FLD_HAZ_AR.shp");
        let b = dir.path().join("b/S_FLD_HAZ_AR.shp");
        for (path, body) in [(&a, "AAAA"), (&b, "BBBB")] {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }

        let store = Arc::new(SqliteCheckpointStore::open_in_memory().unwrap());
        store
            .record(CheckpointRecord::succeeded(
                Stage::Extract,
                UnitKey::parse("06/06037C.zip").unwrap(),
                vec![a, b],
            ))
            .await
            .unwrap();
        let units = CheckpointEnumerator::new(store, Stage::Extract)
            .with_extensions(["shp"])
            .enumerate()
            .await
            .unwrap();
        assert_eq!(units.len(), 2);

        let action = ConvertAction::new(
            Arc::new(CopyTool { fail: false }),
            ToolConfig::default(),
            dir.path().join("tmp"),
            dir.path().join("converted"),
        );
        let mut outputs = Vec::new();
        for unit in &units {
            outputs.extend(action.execute(unit).await.unwrap().artifacts);
        }

        assert_eq!(outputs.len(), 2);
        assert_ne!(outputs[0], outputs[1]);
        assert_eq!(std::fs::read(&outputs[0]).unwrap(), b"AAAA");
        assert_eq!(std::fs::read(&outputs[1]).unwrap(), b"BBBB");
        assert!(outputs
            .iter()
            .all(|p| p.file_name().unwrap() == "S_FLD_HAZ_AR.gpkg"));
    }

    /// Never returns from translate
    struct StallingTool;

    #[async_trait]
    impl GeometryTool for StallingTool {
        async fn describe(&self, _path: &Path, _layer: Option<&str>) -> Result<LayerMetadata> {
            Ok(LayerMetadata::default())
        }

        async fn translate(&self, request: &TranslateRequest) -> Result<ToolOutcome> {
            std::fs::write(&request.destination, b"partial").unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(ToolOutcome::ok())
        }
    }

    #[tokio::test]
    async fn test_abandoned_convert_removes_temp_output() {
        let dir = TempDir::new().unwrap();
        let action = ConvertAction::new(
            Arc::new(StallingTool),
            ToolConfig::default(),
            dir.path().join("tmp"),
            dir.path().join("converted"),
        );

        let unit = shp_unit(&dir);
        let elapsed =
            tokio::time::timeout(std::time::Duration::from_millis(200), action.execute(&unit)).await;

        assert!(elapsed.is_err());
        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
        assert!(!dir.path().join("converted").exists());
    }

    #[tokio::test]
    async fn test_extract_action_lists_files() {
        use crate::extract::ZipExtractor;
        use std::io::Write;

        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("06037C.zip");
        let mut zip = zip::ZipWriter::new(std::fs::File::create(&archive).unwrap());
        zip.start_file("S_FIRM_PAN.shp", zip::write::FileOptions::default())
            .unwrap();
        zip.write_all(b"x").unwrap();
        zip.finish().unwrap();

        let action = ExtractAction::new(Arc::new(ZipExtractor), dir.path().join("extracted"));
        let unit = UnitIdentity::new(UnitKey::parse("06/06037C.zip").unwrap())
            .with_attribute(PATH_ATTRIBUTE, archive.to_string_lossy());

        let outcome = action.execute(&unit).await.unwrap();
        assert_eq!(
            outcome.artifacts,
            vec![dir.path().join("extracted/06/06037C.zip/S_FIRM_PAN.shp")]
        );
        assert_eq!(outcome.detail.as_deref(), Some("1 files"));
    }

    #[tokio::test]
    async fn test_merge_action_requires_members() {
        let dir = TempDir::new().unwrap();
        let tool: Arc<dyn GeometryTool> = Arc::new(CopyTool { fail: false });
        let catalog = Arc::new(SchemaCatalog::new(tool.clone(), Default::default()));
        let action = MergeAction::new(
            catalog,
            MergeEngine::new(tool, dir.path().join("tmp")),
            dir.path().join("merged"),
            "gpkg",
            None,
        );

        assert_eq!(action.output_path("s_fld_haz_ar"), dir.path().join("merged").join("s_fld_haz_ar.gpkg"));
        let bare = UnitIdentity::new(UnitKey::parse("s_fld_haz_ar").unwrap());
        assert!(action.execute(&bare).await.is_err());
    }
}
