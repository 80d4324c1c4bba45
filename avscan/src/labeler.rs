//! External consensus-labeling tool runner
//!
//! Stages every label-bridge file of a directory into a scratch directory,
//! runs the tool once over it and reads back its plain-text report.
//!
//! Invocation: `[interpreter] <tool> -d <staging_dir> [extra_args...] -o <report>`

use crate::label::is_label_file_name;
use avscan_common::config::LabelerConfig;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Labeling tool errors
#[derive(Debug, Error)]
pub enum LabelerError {
    #[error("Labeling tool not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to stage label files: {0}")]
    Staging(#[source] std::io::Error),

    #[error("Failed to execute labeling tool: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Labeling tool failed (exit code {status:?}): {stderr}")]
    Failed { status: Option<i32>, stderr: String },

    #[error("Labeling tool produced no report at {0}")]
    ReportMissing(PathBuf),

    #[error("No label files to process in {0}")]
    NothingToLabel(PathBuf),

    #[error("Labeling task join error: {0}")]
    Join(String),
}

/// Result of one tool run
#[derive(Debug, Clone, Serialize)]
pub struct LabelerRun {
    /// Number of label files handed to the tool
    pub staged: usize,
    pub report_path: PathBuf,
    /// Report text, verbatim
    pub report: String,
}

/// Configured labeling tool
#[derive(Debug, Clone)]
pub struct Labeler {
    tool: PathBuf,
    interpreter: Option<String>,
    extra_args: Vec<String>,
    report_file: String,
}

impl Labeler {
    /// Build a runner for the tool at `tool`
    ///
    /// With no configured interpreter, `.py` tools run under `python3` and
    /// anything else is executed directly.
    pub fn from_config(tool: impl Into<PathBuf>, config: &LabelerConfig) -> Self {
        let tool = tool.into();
        let interpreter = config.interpreter.clone().or_else(|| {
            (tool.extension().and_then(|e| e.to_str()) == Some("py")).then(|| "python3".to_string())
        });
        Self {
            tool,
            interpreter,
            extra_args: config.extra_args.clone(),
            report_file: config.report_file.clone(),
        }
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }

    /// Program and arguments for one invocation
    fn command_line(&self, staging_dir: &Path, report_path: &Path) -> (String, Vec<String>) {
        let mut args = Vec::new();
        let program = match &self.interpreter {
            Some(interpreter) => {
                args.push(self.tool.display().to_string());
                interpreter.clone()
            }
            None => self.tool.display().to_string(),
        };
        args.push("-d".to_string());
        args.push(staging_dir.display().to_string());
        args.extend(self.extra_args.iter().cloned());
        args.push("-o".to_string());
        args.push(report_path.display().to_string());
        (program, args)
    }

    /// Run the tool over the label files in `label_dir`, writing the report into `report_dir`
    pub async fn run(&self, label_dir: &Path, report_dir: &Path) -> Result<LabelerRun, LabelerError> {
        let tool_is_file = tokio::fs::metadata(&self.tool)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !tool_is_file {
            return Err(LabelerError::NotFound(self.tool.clone()));
        }

        let source_dir = label_dir.to_path_buf();
        let (staging, staged) = tokio::task::spawn_blocking(move || {
            let staging = tempfile::Builder::new().prefix("avscan-labels-").tempdir()?;
            let staged = stage_label_files(&source_dir, staging.path())?;
            Ok::<_, std::io::Error>((staging, staged))
        })
        .await
        .map_err(|e| LabelerError::Join(e.to_string()))?
        .map_err(LabelerError::Staging)?;
        if staged == 0 {
            return Err(LabelerError::NothingToLabel(label_dir.to_path_buf()));
        }

        let report_path = report_dir.join(&self.report_file);
        match tokio::fs::remove_file(&report_path).await {
            // A report left from an earlier run must not pass for this one
            Ok(()) => tracing::debug!(report = %report_path.display(), "Removed stale report"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(LabelerError::Staging(e)),
        }

        let (program, args) = self.command_line(staging.path(), &report_path);
        tracing::info!(tool = %self.tool.display(), staged, "Running labeling tool");
        tracing::debug!(%program, ?args, "Labeling tool command line");

        let output = tokio::task::spawn_blocking(move || Command::new(&program).args(&args).output())
            .await
            .map_err(|e| LabelerError::Join(e.to_string()))?
            .map_err(LabelerError::Spawn)?;

        if !output.status.success() {
            return Err(LabelerError::Failed {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let report = match tokio::fs::read_to_string(&report_path).await {
            Ok(report) => report,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LabelerError::ReportMissing(report_path));
            }
            Err(e) => return Err(LabelerError::Staging(e)),
        };

        tracing::info!(report = %report_path.display(), "Labeling tool finished");
        Ok(LabelerRun {
            staged,
            report_path,
            report,
        })
    }
}

/// Copy label-bridge files from `source_dir` into `staging_dir`
///
/// Returns how many were copied. Anything not named like a label file stays behind.
pub fn stage_label_files(source_dir: &Path, staging_dir: &Path) -> std::io::Result<usize> {
    let mut staged = 0;
    for entry in std::fs::read_dir(source_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        if file_name.to_str().is_some_and(is_label_file_name) {
            std::fs::copy(entry.path(), staging_dir.join(&file_name))?;
            staged += 1;
        }
    }
    Ok(staged)
}
