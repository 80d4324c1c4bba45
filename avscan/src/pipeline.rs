//! Batch pipeline
//!
//! checksum inputs → scan → repair / statistics / label bridge per record →
//! labeling tool. Only setup problems (unreadable input directory, unwritable
//! output directory) fail a run; everything else degrades one file's output and
//! ends up in the [`PipelineReport`].

use crate::checksum::compute_identifier;
use crate::label::{label_file_name, to_label_record, write_label_file};
use crate::labeler::{Labeler, LabelerError, LabelerRun};
use crate::orchestrator::{BatchReport, ScanEvent, ScanInput, ScanOrchestrator};
use crate::record_store::{
    discover_records, load_record, persist_record, record_name, RecordPaths, PRETTY_SUFFIX,
};
use crate::repair::repair_attributes;
use crate::service::AnalysisService;
use crate::stats::{collect_unique_values, compute_rates, DetectionRates, UniqueValueSets};
use crate::error::RecordError;
use avscan_common::config::{IdentifierAlgorithm, TomlConfig};
use avscan_common::{Error, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;
use walkdir::WalkDir;

/// Pipeline settings
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    pub concurrency: usize,
    pub identifier_algorithm: IdentifierAlgorithm,
    /// Accepted input extensions without the dot; empty accepts every file
    pub extensions: Vec<String>,
    pub recursive: bool,
}

impl PipelineConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            concurrency: 4,
            identifier_algorithm: IdentifierAlgorithm::default(),
            extensions: Vec::new(),
            recursive: false,
        }
    }

    pub fn from_toml(output_dir: impl Into<PathBuf>, config: &TomlConfig) -> Self {
        Self {
            output_dir: output_dir.into(),
            concurrency: config.concurrency,
            identifier_algorithm: config.identifier_algorithm,
            extensions: config.scan.extensions.clone(),
            recursive: config.scan.recursive,
        }
    }
}

/// Input excluded from the batch before scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedInput {
    pub path: PathBuf,
    pub reason: String,
}

/// Post-processing result of one normalized record
#[derive(Debug, Clone, Default)]
pub struct RecordReport {
    pub name: String,
    pub identifier: String,
    /// `attributes` was string-encoded and has been rewritten as a mapping
    pub repaired: bool,
    pub rates: Option<DetectionRates>,
    pub unique_values: Option<UniqueValueSets>,
    pub label_path: Option<PathBuf>,
    /// Recoverable problems, in the order they were hit
    pub problems: Vec<String>,
}

impl RecordReport {
    fn new(name: &str, identifier: &str) -> Self {
        Self {
            name: name.to_string(),
            identifier: identifier.to_string(),
            ..Self::default()
        }
    }
}

impl fmt::Display for RecordReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({})", self.name, self.identifier)?;
        if let Some(rates) = &self.rates {
            writeln!(f, "Detection Rate: {}", rates.detection_rate)?;
            writeln!(f, "Evasion Rate: {}", rates.evasion_rate)?;
        }
        if let Some(sets) = &self.unique_values {
            for (title, items) in [("Unique Methods", &sets.methods), ("Unique Results", &sets.results)] {
                writeln!(f, "{}:", title)?;
                for item in items {
                    writeln!(f, " - {}", item)?;
                }
            }
        }
        for problem in &self.problems {
            writeln!(f, "Problem: {}", problem)?;
        }
        Ok(())
    }
}

/// What happened at the labeling step
#[derive(Debug, Clone)]
pub enum LabelingOutcome {
    /// No labeling tool configured
    NotConfigured,
    /// Tool ran and produced a report
    Ran(LabelerRun),
    /// Nothing to hand to the tool
    Skipped(String),
    /// Tool missing, failed, or produced no report
    Failed(String),
}

/// Everything a run produced
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub batch_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub skipped: Vec<SkippedInput>,
    /// Absent in relabel mode
    pub scan: Option<BatchReport>,
    pub records: Vec<RecordReport>,
    pub labeling: LabelingOutcome,
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = (self.finished_at - self.started_at).num_seconds();
        writeln!(f, "Batch {} finished in {}s", self.batch_id, elapsed)?;

        match &self.scan {
            Some(scan) => {
                writeln!(
                    f,
                    "Scanned: {} completed, {} failed",
                    scan.completed_count(),
                    scan.failed_count()
                )?;
                for outcome in scan.failed() {
                    let reason = outcome
                        .failure
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| outcome.state.to_string());
                    writeln!(f, "  failed: {}: {}", outcome.input.name, reason)?;
                }
            }
            None => writeln!(f, "Relabeled {} existing records", self.records.len())?,
        }

        if !self.skipped.is_empty() {
            writeln!(f, "Skipped: {}", self.skipped.len())?;
            for skipped in &self.skipped {
                writeln!(f, "  skipped: {}: {}", skipped.path.display(), skipped.reason)?;
            }
        }

        let labeled = self.records.iter().filter(|r| r.label_path.is_some()).count();
        writeln!(f, "Label files written: {}", labeled)?;

        match &self.labeling {
            LabelingOutcome::NotConfigured => write!(f, "Labeling: not run (no labeling tool configured)"),
            LabelingOutcome::Ran(run) => write!(
                f,
                "Labeling: ran over {} files, report at {}",
                run.staged,
                run.report_path.display()
            ),
            LabelingOutcome::Skipped(reason) => write!(f, "Labeling: skipped ({})", reason),
            LabelingOutcome::Failed(reason) => write!(f, "Labeling: failed ({})", reason),
        }
    }
}

/// Batch coordinator
pub struct Pipeline {
    config: PipelineConfig,
    labeler: Option<Labeler>,
    event_tx: Option<mpsc::Sender<ScanEvent>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            labeler: None,
            event_tx: None,
        }
    }

    pub fn with_labeler(mut self, labeler: Labeler) -> Self {
        self.labeler = Some(labeler);
        self
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<ScanEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Scan every input file of `input_dir` and post-process the results
    pub async fn run(&self, service: Arc<dyn AnalysisService>, input_dir: &Path) -> Result<PipelineReport> {
        let batch_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(%batch_id, input_dir = %input_dir.display(), "Pipeline run starting");

        self.prepare_output_dir().await?;
        let (paths, mut skipped) = self.discover(input_dir).await?;

        let mut inputs = Vec::with_capacity(paths.len());
        for (name, file_path) in paths {
            match compute_identifier(&file_path, self.config.identifier_algorithm).await {
                Ok(identifier) => inputs.push(ScanInput {
                    file_path,
                    name,
                    identifier,
                }),
                Err(e) => {
                    tracing::warn!(file = %file_path.display(), error = %e, "Checksum failed, skipping file");
                    skipped.push(SkippedInput {
                        path: file_path,
                        reason: format!("checksum failed: {}", e),
                    });
                }
            }
        }

        let mut orchestrator =
            ScanOrchestrator::new(service, &self.config.output_dir, self.config.concurrency);
        if let Some(tx) = &self.event_tx {
            orchestrator = orchestrator.with_events(tx.clone());
        }
        let scan = orchestrator.run_batch(inputs).await;

        let mut records = Vec::with_capacity(scan.completed_count());
        for outcome in scan.completed() {
            let Some(record) = outcome.record.clone() else {
                continue;
            };
            records.push(
                self.process_record(&outcome.input.name, &outcome.input.identifier, record)
                    .await,
            );
        }

        let labeling = self.run_labeler().await;
        let report = PipelineReport {
            batch_id,
            started_at,
            finished_at: Utc::now(),
            skipped,
            scan: Some(scan),
            records,
            labeling,
        };
        tracing::info!(%batch_id, "Pipeline run finished");
        Ok(report)
    }

    /// Re-run post-processing over records already in the output directory
    ///
    /// Each record is matched to the input file of the same name for its
    /// identifier; records without one are skipped.
    pub async fn relabel(&self, input_dir: &Path) -> Result<PipelineReport> {
        let batch_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(%batch_id, output_dir = %self.config.output_dir.display(), "Relabel run starting");

        let output_dir = self.config.output_dir.clone();
        let stored = tokio::task::spawn_blocking(move || discover_records(&output_dir))
            .await
            .map_err(|e| Error::Internal(format!("Record discovery task failed: {}", e)))?
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let (paths, mut skipped) = self.discover(input_dir).await?;
        let inputs: BTreeMap<String, PathBuf> = paths.into_iter().collect();

        let mut records = Vec::with_capacity(stored.len());
        for (name, record_path) in stored {
            let Some(file_path) = inputs.get(&name) else {
                tracing::warn!(record = %name, "No input file matches record, skipping");
                skipped.push(SkippedInput {
                    path: record_path,
                    reason: "no input file with this name".to_string(),
                });
                continue;
            };

            let record = match load_record(&record_path).await {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(record = %name, error = %e, "Failed to load record, skipping");
                    skipped.push(SkippedInput {
                        path: record_path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            match compute_identifier(file_path, self.config.identifier_algorithm).await {
                Ok(identifier) => records.push(self.process_record(&name, &identifier, record).await),
                Err(e) => skipped.push(SkippedInput {
                    path: file_path.clone(),
                    reason: format!("checksum failed: {}", e),
                }),
            }
        }

        let labeling = self.run_labeler().await;
        Ok(PipelineReport {
            batch_id,
            started_at,
            finished_at: Utc::now(),
            skipped,
            scan: None,
            records,
            labeling,
        })
    }

    /// [`discover_inputs`] on the blocking pool
    async fn discover(&self, input_dir: &Path) -> Result<(Vec<(String, PathBuf)>, Vec<SkippedInput>)> {
        let input_dir = input_dir.to_path_buf();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || discover_inputs(&input_dir, &config))
            .await
            .map_err(|e| Error::Internal(format!("Input discovery task failed: {}", e)))?
    }

    async fn prepare_output_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.output_dir).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create output directory {}: {}",
                    self.config.output_dir.display(),
                    e
                ),
            ))
        })
    }

    /// Repair, then statistics and label bridge; problems are collected, never raised
    async fn process_record(&self, name: &str, identifier: &str, mut record: Value) -> RecordReport {
        let mut report = RecordReport::new(name, identifier);

        let repaired = match record.as_object_mut() {
            Some(map) => repair_attributes(map),
            None => Err(RecordError::NotAMapping),
        };
        match repaired {
            Ok(repaired) => report.repaired = repaired,
            Err(e) => {
                tracing::warn!(record = %name, error = %e, "Skipping statistics and labels for record");
                report.problems.push(e.to_string());
                return report;
            }
        }

        if report.repaired {
            tracing::info!(record = %name, "Rewrote string-encoded attributes");
            let paths = RecordPaths::for_name(&self.config.output_dir, name);
            if let Err(e) = persist_record(&paths, &record).await {
                report.problems.push(format!("failed to store repaired record: {}", e));
            }
        }

        match compute_rates(&record) {
            Ok(rates) => report.rates = Some(rates),
            Err(e) => {
                tracing::warn!(record = %name, error = %e, "No detection rates for record");
                report.problems.push(e.to_string());
            }
        }

        match collect_unique_values(&record) {
            Ok(sets) => report.unique_values = Some(sets),
            Err(e) => {
                tracing::warn!(record = %name, error = %e, "No unique values for record");
                report.problems.push(e.to_string());
            }
        }

        match to_label_record(&record, identifier) {
            Ok(label) => match write_label_file(&self.config.output_dir, name, &label).await {
                Ok(path) => report.label_path = Some(path),
                Err(e) => report.problems.push(format!("failed to write label file: {}", e)),
            },
            Err(e) => {
                tracing::warn!(record = %name, error = %e, "No label file for record");
                report.problems.push(e.to_string());
            }
        }

        report
    }

    async fn run_labeler(&self) -> LabelingOutcome {
        let Some(labeler) = &self.labeler else {
            tracing::info!("Labeling tool not configured, skipping labeling step");
            return LabelingOutcome::NotConfigured;
        };

        match labeler.run(&self.config.output_dir, &self.config.output_dir).await {
            Ok(run) => LabelingOutcome::Ran(run),
            Err(e @ LabelerError::NothingToLabel(_)) => {
                tracing::info!(error = %e, "Labeling step skipped");
                LabelingOutcome::Skipped(e.to_string())
            }
            Err(e) => {
                tracing::warn!(tool = %labeler.tool().display(), error = %e, "Labeling step failed");
                LabelingOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Regular files of `input_dir` as `(name, path)`, sorted by path
///
/// Files failing the extension filter are ignored silently. An input is
/// skipped with a reason when its name was already taken, when one of its
/// output files (compact record, pretty copy, label file) would land on an
/// output of an earlier input, or when its record would not be read back as
/// its own (names ending in `_pretty` or starting with the label prefix).
pub fn discover_inputs(
    input_dir: &Path,
    config: &PipelineConfig,
) -> Result<(Vec<(String, PathBuf)>, Vec<SkippedInput>)> {
    if !input_dir.is_dir() {
        return Err(Error::InvalidInput(format!(
            "Input directory does not exist: {}",
            input_dir.display()
        )));
    }

    let max_depth = if config.recursive { usize::MAX } else { 1 };
    let mut inputs = Vec::new();
    let mut skipped = Vec::new();
    let mut seen = HashSet::new();
    // output file name -> input that writes it
    let mut claimed: HashMap<String, String> = HashMap::new();

    for entry in WalkDir::new(input_dir)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.into_path();
        if !extension_allowed(&path, &config.extensions) {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            skipped.push(SkippedInput {
                path,
                reason: "file name is not valid UTF-8".to_string(),
            });
            continue;
        };
        if !seen.insert(name.clone()) {
            skipped.push(SkippedInput {
                path,
                reason: format!("another input is already named {}", name),
            });
            continue;
        }

        let outputs = output_file_names(&name);
        if let Some((file, owner)) = outputs
            .iter()
            .find_map(|file| claimed.get(file).map(|owner| (file, owner)))
        {
            tracing::warn!(input = %name, output = %file, other = %owner, "Output collision, skipping input");
            skipped.push(SkippedInput {
                path,
                reason: format!("output {} would overwrite an output of {}", file, owner),
            });
            continue;
        }
        if record_name(&outputs[0]) != Some(name.as_str()) {
            tracing::warn!(input = %name, "Input name is reserved for output files, skipping");
            skipped.push(SkippedInput {
                path,
                reason: format!("name {} is reserved for pretty copies and label files", name),
            });
            continue;
        }

        claimed.extend(outputs.into_iter().map(|file| (file, name.clone())));
        inputs.push((name, path));
    }

    tracing::debug!(found = inputs.len(), skipped = skipped.len(), "Input discovery done");
    Ok((inputs, skipped))
}

/// Compact record, pretty copy and label file names written for input `name`
fn output_file_names(name: &str) -> [String; 3] {
    [
        format!("{}.json", name),
        format!("{}{}", name, PRETTY_SUFFIX),
        label_file_name(name),
    ]
}

fn extension_allowed(path: &Path, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
}
