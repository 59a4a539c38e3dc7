//! Enumerators fed by upstream stage checkpoints

use crate::checkpoint::CheckpointStore;
use crate::merge::MergeSource;
use crate::sources::{SourceEnumerator, MEMBERS_ATTRIBUTE, PATH_ATTRIBUTE, UPSTREAM_ATTRIBUTE};
use async_trait::async_trait;
use geoharvest_common::{CheckpointStatus, PipelineError, Result, Stage, UnitIdentity, UnitKey};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    extensions.is_empty()
        || path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
}

/// One unit per artifact of the upstream stage's succeeded units
///
/// The unit key is the upstream key plus the artifact's file name, so
/// `06/06037` fetching `06037C.zip` yields extract unit `06/06037/06037C.zip`.
pub struct CheckpointEnumerator {
    store: Arc<dyn CheckpointStore>,
    upstream: Stage,
    extensions: Vec<String>,
}

impl CheckpointEnumerator {
    pub fn new(store: Arc<dyn CheckpointStore>, upstream: Stage) -> Self {
        Self {
            store,
            upstream,
            extensions: Vec::new(),
        }
    }

    /// Only yield artifacts with one of these extensions (case-insensitive, no dot)
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.into().trim_start_matches('.').to_string())
            .collect();
        self
    }
}

#[async_trait]
impl SourceEnumerator for CheckpointEnumerator {
    async fn enumerate(&self) -> Result<Vec<UnitIdentity>> {
        let records = self
            .store
            .latest_records(self.upstream, Some(CheckpointStatus::Succeeded))
            .await
            .map_err(|e| PipelineError::enumeration(format!("reading {} checkpoints: {}", self.upstream, e)))?;

        let mut units = Vec::new();
        for record in records {
            let mut used: HashSet<String> = HashSet::new();
            for artifact in &record.artifacts {
                if !has_extension(artifact, &self.extensions) {
                    continue;
                }
                let Some(name) = artifact.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                    continue;
                };

                // Same file name in two archive folders
                let mut component = name.clone();
                let mut n = 2;
                while !used.insert(component.clone()) {
                    component = format!("{}~{}", name, n);
                    n += 1;
                }

                let key = match record.unit_key.child(&component) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(upstream = %record.unit_key, artifact = %artifact.display(), error = %e, "Skipping artifact");
                        continue;
                    },
                };

                units.push(
                    UnitIdentity::new(key)
                        .with_attribute(PATH_ATTRIBUTE, artifact.to_string_lossy())
                        .with_attribute(UPSTREAM_ATTRIBUTE, record.unit_key.as_str()),
                );
            }
        }

        Ok(units)
    }
}

/// Lower-cased file stem: the logical layer a converted file belongs to
pub fn group_key_of(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .filter(|s| !s.is_empty())
}

/// One unit per merge group, members taken from converted artifacts
///
/// Groups are the configured list, or every distinct group key observed.
/// Members keep checkpoint order (by unit key), which fixes the seed source.
pub struct MergeGroupEnumerator {
    store: Arc<dyn CheckpointStore>,
    upstream: Stage,
    groups: Option<Vec<String>>,
}

impl MergeGroupEnumerator {
    pub fn new(store: Arc<dyn CheckpointStore>, groups: Option<Vec<String>>) -> Self {
        Self {
            store,
            upstream: Stage::Convert,
            groups: groups.map(|g| g.into_iter().map(|s| s.to_lowercase()).collect()),
        }
    }

    /// Members of every group, keyed by group
    pub async fn groups(&self) -> Result<BTreeMap<String, Vec<MergeSource>>> {
        let records = self
            .store
            .latest_records(self.upstream, Some(CheckpointStatus::Succeeded))
            .await
            .map_err(|e| PipelineError::enumeration(format!("reading {} checkpoints: {}", self.upstream, e)))?;

        let mut observed: BTreeMap<String, Vec<MergeSource>> = BTreeMap::new();
        for record in records {
            let many = record.artifacts.len() > 1;
            for (i, artifact) in record.artifacts.iter().enumerate() {
                let Some(group) = group_key_of(artifact) else {
                    continue;
                };
                let source_id = if many {
                    format!("{}#{}", record.unit_key, i)
                } else {
                    record.unit_key.to_string()
                };
                observed
                    .entry(group)
                    .or_default()
                    .push(MergeSource::new(source_id, artifact));
            }
        }

        match &self.groups {
            None => Ok(observed),
            Some(wanted) => {
                let mut selected = BTreeMap::new();
                for group in wanted {
                    match observed.remove(group) {
                        Some(members) => {
                            selected.insert(group.clone(), members);
                        },
                        None => warn!(group = %group, "Configured merge group has no converted sources"),
                    }
                }
                Ok(selected)
            },
        }
    }
}

#[async_trait]
impl SourceEnumerator for MergeGroupEnumerator {
    async fn enumerate(&self) -> Result<Vec<UnitIdentity>> {
        let mut units = Vec::new();
        for (group, members) in self.groups().await? {
            let key = UnitKey::parse(&group)
                .map_err(|e| PipelineError::enumeration(format!("group '{}': {}", group, e)))?;
            let members = serde_json::to_string(&members)?;
            units.push(UnitIdentity::new(key).with_attribute(MEMBERS_ATTRIBUTE, members));
        }
        Ok(units)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointRecord, SqliteCheckpointStore};
    use std::path::PathBuf;

    async fn store_with(records: Vec<CheckpointRecord>) -> Arc<SqliteCheckpointStore> {
        let store = Arc::new(SqliteCheckpointStore::open_in_memory().unwrap());
        for r in records {
            store.record(r).await.unwrap();
        }
        store
    }

    fn key(s: &str) -> UnitKey {
        UnitKey::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_artifacts_become_child_units() {
        let store = store_with(vec![
            CheckpointRecord::succeeded(
                Stage::Extract,
                key("06/06037"),
                vec![
                    PathBuf::from("/x/06037/S_FLD_HAZ_AR.shp"),
                    PathBuf::from("/x/06037/S_FLD_HAZ_AR.dbf"),
                    PathBuf::from("/x/06037/other/S_FLD_HAZ_AR.SHP"),
                ],
            ),
            CheckpointRecord::failed(Stage::Extract, key("48/48201"), "bad zip"),
        ])
        .await;

        let units = CheckpointEnumerator::new(store, Stage::Extract)
            .with_extensions([".shp"])
            .enumerate()
            .await
            .unwrap();

        let keys: Vec<&str> = units.iter().map(|u| u.key.as_str()).collect();
        assert_eq!(keys, vec!["06/06037/S_FLD_HAZ_AR.shp", "06/06037/S_FLD_HAZ_AR.SHP"]);
        assert_eq!(units[0].attribute(PATH_ATTRIBUTE), Some("/x/06037/S_FLD_HAZ_AR.shp"));
        assert_eq!(units[0].attribute(UPSTREAM_ATTRIBUTE), Some("06/06037"));
    }

    #[tokio::test]
    async fn test_duplicate_file_names_get_distinct_keys() {
        let store = store_with(vec![CheckpointRecord::succeeded(
            Stage::Extract,
            key("06"),
            vec![PathBuf::from("/a/x.shp"), PathBuf::from("/b/x.shp")],
        )])
        .await;

        let units = CheckpointEnumerator::new(store, Stage::Extract)
            .enumerate()
            .await
            .unwrap();
        assert_eq!(units[0].key.as_str(), "06/x.shp");
        assert_eq!(units[1].key.as_str(), "06/x.shp~2");
    }

    #[tokio::test]
    async fn test_groups_by_lowercased_stem() {
        let store = store_with(vec![
            CheckpointRecord::succeeded(
                Stage::Convert,
                key("06/a.zip/S_FLD_HAZ_AR.shp"),
                vec![PathBuf::from("/c/06_a.zip/S_FLD_HAZ_AR.gpkg")],
            ),
            CheckpointRecord::succeeded(
                Stage::Convert,
                key("48/b.zip/s_fld_haz_ar.shp"),
                vec![PathBuf::from("/c/48_b.zip/s_fld_haz_ar.gpkg")],
            ),
            CheckpointRecord::succeeded(
                Stage::Convert,
                key("48/b.zip/S_FIRM_PAN.shp"),
                vec![PathBuf::from("/c/48_b.zip/S_FIRM_PAN.gpkg")],
            ),
        ])
        .await;

        let all = MergeGroupEnumerator::new(store.clone(), None).groups().await.unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["s_firm_pan", "s_fld_haz_ar"]);
        let haz = &all["s_fld_haz_ar"];
        assert_eq!(haz.len(), 2);
        assert_eq!(haz[0].source_id, "06/a.zip/S_FLD_HAZ_AR.shp");

        let units = MergeGroupEnumerator::new(store, Some(vec!["S_FLD_HAZ_AR".into(), "s_nope".into()]))
            .enumerate()
            .await
            .unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].key.as_str(), "s_fld_haz_ar");

        let members: Vec<MergeSource> =
            serde_json::from_str(units[0].attribute(MEMBERS_ATTRIBUTE).unwrap()).unwrap();
        assert_eq!(members.len(), 2);
    }
}
