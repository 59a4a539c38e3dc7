//! Schema-reconciling merge engine
//!
//! A group is merged in two phases: the first usable source seeds a private
//! temporary dataset (creating the output layer with the canonical columns),
//! then every other source is appended through its projection plan. A source
//! whose append fails is recorded and skipped. Only when every source has been
//! attempted is the temporary file moved to the final path, so a crash never
//! leaves a partial output there.

use crate::schema::ReconciledSchema;
use crate::tool::{GeometryTool, TranslateRequest};
use geoharvest_common::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One input of a merge group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSource {
    pub source_id: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
}

impl MergeSource {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
            layer: None,
        }
    }
}

/// Sources that merge into one output layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeGroup {
    pub group_key: String,
    /// Stable input order; the first usable member seeds the output
    pub members: Vec<MergeSource>,
    pub output_path: PathBuf,
    pub layer_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedSource {
    pub source_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeResult {
    pub group_key: String,
    pub succeeded_sources: Vec<String>,
    pub failed_sources: Vec<FailedSource>,
    pub output_path: PathBuf,
}

pub struct MergeEngine {
    tool: Arc<dyn GeometryTool>,
    temp_dir: PathBuf,
}

impl MergeEngine {
    pub fn new(tool: Arc<dyn GeometryTool>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            temp_dir: temp_dir.into(),
        }
    }

    /// Merge every planned member of `group` into `group.output_path`
    ///
    /// Members without a plan in `schema` count as failed. A seed failure
    /// returns [`PipelineError::Seed`] and leaves no output behind.
    pub async fn merge(&self, group: &MergeGroup, schema: &ReconciledSchema) -> Result<MergeResult> {
        let mut succeeded_sources = Vec::new();
        let mut failed_sources = Vec::new();

        let mut planned = Vec::with_capacity(group.members.len());
        for member in &group.members {
            match schema.plan(&member.source_id) {
                Some(plan) => planned.push((member, plan)),
                None => failed_sources.push(FailedSource {
                    source_id: member.source_id.clone(),
                    reason: "schema could not be read".to_string(),
                }),
            }
        }

        let Some(((seed, seed_plan), rest)) = planned.split_first() else {
            return Err(PipelineError::seed(&group.group_key, "group has no readable sources"));
        };

        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let temp = TempFile::new(self.temp_path(group));

        debug!(group = %group.group_key, source = %seed.source_id, temp = %temp.path().display(), "Seeding merge output");
        let request = TranslateRequest::new(&seed.path, temp.path())
            .projection(seed_plan.to_sql())
            .dest_layer(&group.layer_name)
            .promote_to_multi(true);

        if let Err(diagnostic) = self.run(&request).await {
            return Err(PipelineError::seed(
                &group.group_key,
                format!("{}: {}", seed.source_id, diagnostic),
            ));
        }
        succeeded_sources.push(seed.source_id.clone());

        for (member, plan) in rest {
            let request = TranslateRequest::new(&member.path, temp.path())
                .projection(plan.to_sql())
                .dest_layer(&group.layer_name)
                .promote_to_multi(true)
                .append(true);

            match self.run(&request).await {
                Ok(()) => succeeded_sources.push(member.source_id.clone()),
                Err(reason) => {
                    warn!(group = %group.group_key, source = %member.source_id, %reason, "Append failed, skipping source");
                    failed_sources.push(FailedSource {
                        source_id: member.source_id.clone(),
                        reason,
                    });
                },
            }
        }

        persist(temp.path(), &group.output_path).await?;
        temp.disarm();

        info!(
            group = %group.group_key,
            succeeded = succeeded_sources.len(),
            failed = failed_sources.len(),
            output = %group.output_path.display(),
            "Merge complete"
        );

        Ok(MergeResult {
            group_key: group.group_key.clone(),
            succeeded_sources,
            failed_sources,
            output_path: group.output_path.clone(),
        })
    }

    fn temp_path(&self, group: &MergeGroup) -> PathBuf {
        let extension = group
            .output_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("gpkg");
        self.temp_dir.join(format!(
            "{}-{}.{}",
            group.group_key,
            uuid::Uuid::new_v4().simple(),
            extension
        ))
    }

    /// Run one translate, flattening tool errors and tool-reported failures
    async fn run(&self, request: &TranslateRequest) -> std::result::Result<(), String> {
        match self.tool.translate(request).await {
            Ok(outcome) if outcome.success => Ok(()),
            Ok(outcome) => Err(outcome.diagnostic),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Move a finished file into place without ever exposing a partial file at `dest`
///
/// Tries a rename first; across filesystems, copies into a sibling of `dest`
/// and renames that.
pub async fn persist(temp: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    if tokio::fs::rename(temp, dest).await.is_ok() {
        return Ok(());
    }

    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let staging = TempFile::new(dest.with_file_name(format!(
        ".{}.partial-{}",
        file_name,
        uuid::Uuid::new_v4().simple()
    )));

    let moved = async {
        tokio::fs::copy(temp, staging.path()).await?;
        tokio::fs::rename(staging.path(), dest).await
    }
    .await;

    match moved {
        Ok(()) => {
            staging.disarm();
            remove_quietly(temp).await;
            Ok(())
        },
        Err(e) => Err(PipelineError::Io(e)),
    }
}

/// A private temporary output, deleted on drop unless disarmed
///
/// Covers every early exit, including a unit timeout or cancellation dropping
/// the future mid-merge.
pub struct TempFile {
    path: PathBuf,
    armed: bool,
}

impl TempFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep whatever is at the path (it has been moved into place)
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove temporary file");
            }
        }
    }
}

pub(crate) async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove temporary file");
        }
    }
}
