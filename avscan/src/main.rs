//! avscan command line
//!
//! `avscan <INPUT_DIR> <OUTPUT_DIR> [API_KEY] [-l LABELER]`

use anyhow::{Context, Result};
use avscan::labeler::Labeler;
use avscan::orchestrator::{ScanEvent, TaskState};
use avscan::pipeline::{LabelingOutcome, Pipeline, PipelineConfig};
use avscan::VirusTotalClient;
use avscan_common::config::{load_config, resolve_api_key};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for avscan
#[derive(Parser, Debug)]
#[command(name = "avscan")]
#[command(about = "Scan a directory with a multi-engine analysis service and bridge results to a labeling tool")]
#[command(version, long_version = avscan::LONG_VERSION)]
struct Args {
    /// Directory of files to scan
    input_dir: PathBuf,

    /// Directory for result records, label files and the labeling report
    output_dir: PathBuf,

    /// Analysis service API key (else AVSCAN_API_KEY, else config file)
    api_key: Option<String>,

    /// Path to the external labeling tool
    #[arg(short, long)]
    labeler: Option<PathBuf>,

    /// Maximum number of files in flight at once
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Configuration file (else AVSCAN_CONFIG, else the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Skip scanning; post-process records already in OUTPUT_DIR
    #[arg(long)]
    relabel: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    config.validate()?;

    let level = config.logging.level.as_str();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("avscan={level},avscan_common={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting avscan {}", avscan::LONG_VERSION);
    info!("Input: {}", args.input_dir.display());
    info!("Output: {}", args.output_dir.display());

    let mut pipeline = Pipeline::new(PipelineConfig::from_toml(&args.output_dir, &config));
    match args.labeler.clone().or_else(|| config.labeler.path.clone()) {
        Some(tool) => pipeline = pipeline.with_labeler(Labeler::from_config(tool, &config.labeler)),
        None => println!("Labeler path not provided. Skipping labeling step."),
    }

    let report = if args.relabel {
        pipeline.relabel(&args.input_dir).await?
    } else {
        let api_key = resolve_api_key(args.api_key.as_deref(), &config)?;
        let client = VirusTotalClient::new(&api_key, &config.service)?;

        let (event_tx, event_rx) = mpsc::channel(100);
        let progress = tokio::spawn(print_progress(event_rx));

        println!("Starting scan of {}", args.input_dir.display());
        // Scoped so the pipeline's sender is dropped and the progress task can finish
        let report = {
            let pipeline = pipeline.with_events(event_tx);
            pipeline.run(Arc::new(client), &args.input_dir).await?
        };
        if let Err(e) = progress.await {
            tracing::warn!(error = %e, "Progress printer stopped abnormally");
        }
        report
    };

    for record in &report.records {
        println!("{}", record);
    }
    if let LabelingOutcome::Ran(run) = &report.labeling {
        print!("{}", run.report);
    }
    println!("{}", report);

    Ok(())
}

/// Print per-file progress as tasks move along
async fn print_progress(mut event_rx: mpsc::Receiver<ScanEvent>) {
    let mut queued = 0usize;
    let mut finished = 0usize;
    while let Some(event) = event_rx.recv().await {
        match event {
            ScanEvent::TaskQueued { .. } => queued += 1,
            ScanEvent::StateChanged { name, transition } => match transition.new_state {
                TaskState::Submitted => println!("Scanning file: {}", name),
                TaskState::Polling => println!("Waiting for analysis completion for file: {}", name),
                _ => {}
            },
            ScanEvent::TaskFinished { name, failure, .. } => {
                finished += 1;
                match failure {
                    None => println!("[{}/{}] Results saved for file: {}", finished, queued, name),
                    Some(failure) => println!(
                        "[{}/{}] Error processing file {}: {}",
                        finished, queued, name, failure
                    ),
                }
            }
        }
    }
}
