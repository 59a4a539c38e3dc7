//! `ogr2ogr` / `ogrinfo` subprocess implementation of [`GeometryTool`]

use crate::config::ToolConfig;
use crate::tool::metadata::{parse_ogrinfo_json, LayerMetadata};
use crate::tool::{GeometryTool, ToolOutcome, TranslateRequest};
use async_trait::async_trait;
use geoharvest_common::{PipelineError, Result};
use std::ffi::OsString;
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// GDAL command-line tools run as child processes
#[derive(Debug, Clone)]
pub struct OgrTool {
    ogr2ogr: String,
    ogrinfo: String,
    output_format: String,
    timeout: Duration,
}

impl OgrTool {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            ogr2ogr: config.ogr2ogr.clone(),
            ogrinfo: config.ogrinfo.clone(),
            output_format: config.output_format.clone(),
            timeout: config.timeout(),
        }
    }

    /// Command line for one translate, without the executable
    pub fn translate_args(&self, request: &TranslateRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        let mut push = |s: &str| args.push(OsString::from(s));

        push("-f");
        push(&self.output_format);

        if request.append {
            push("-update");
            push("-append");
        }
        if let Some(layer) = &request.dest_layer {
            push("-nln");
            push(layer);
        }
        if request.promote_to_multi {
            push("-nlt");
            push("PROMOTE_TO_MULTI");
        }
        if let Some(srs) = &request.assign_srs {
            push("-a_srs");
            push(srs);
        }
        if request.skip_failures {
            push("-skipfailures");
        }
        if let Some(sql) = &request.projection {
            push("-dialect");
            push("SQLite");
            push("-sql");
            push(sql);
        }

        args.push(request.destination.clone().into_os_string());
        args.push(request.source.clone().into_os_string());

        // With -sql the layer is named inside the query
        if request.projection.is_none() {
            if let Some(layer) = &request.source_layer {
                args.push(OsString::from(layer));
            }
        }

        args
    }

    async fn run(&self, program: &str, args: &[OsString]) -> Result<Output> {
        debug!(program, ?args, "Invoking geometry tool");

        let child = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(PipelineError::tool(format!("failed to run {}: {}", program, e))),
            Err(_) => {
                warn!(program, timeout_secs = self.timeout.as_secs(), "Geometry tool timed out");
                Err(PipelineError::Timeout {
                    what: program.to_string(),
                    secs: self.timeout.as_secs(),
                })
            },
        }
    }
}

fn diagnostic_of(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout = stdout.trim();
    if stdout.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stdout.to_string()
    }
}

#[async_trait]
impl GeometryTool for OgrTool {
    async fn describe(&self, path: &Path, layer: Option<&str>) -> Result<LayerMetadata> {
        let mut args: Vec<OsString> = vec!["-json".into(), "-so".into(), "-ro".into()];
        args.push(path.as_os_str().to_owned());
        if let Some(layer) = layer {
            args.push(layer.into());
        }

        let output = self.run(&self.ogrinfo, &args).await.map_err(|e| match e {
            PipelineError::ToolInvocation { diagnostic } => {
                PipelineError::introspection(path.display().to_string(), diagnostic)
            },
            other => other,
        })?;

        if !output.status.success() {
            return Err(PipelineError::introspection(
                path.display().to_string(),
                diagnostic_of(&output),
            ));
        }

        parse_ogrinfo_json(path, &String::from_utf8_lossy(&output.stdout), layer)
    }

    async fn translate(&self, request: &TranslateRequest) -> Result<ToolOutcome> {
        let args = self.translate_args(request);
        let output = self.run(&self.ogr2ogr, &args).await?;

        if output.status.success() {
            // -skipfailures reports dropped features on stderr while still exiting 0
            let diagnostic = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if !diagnostic.is_empty() {
                debug!(destination = %request.destination.display(), %diagnostic, "ogr2ogr warnings");
            }
            Ok(ToolOutcome {
                success: true,
                diagnostic,
            })
        } else {
            Ok(ToolOutcome::failed(diagnostic_of(&output)))
        }
    }
}
