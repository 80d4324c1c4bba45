//! avscan - batch malware scanning and label bridging
//!
//! Submits a directory of files to a multi-engine analysis service, normalizes
//! each result into a plain JSON record, computes detection statistics and
//! writes label-bridge files for an external consensus-labeling tool.

pub mod checksum;
pub mod error;
pub mod label;
pub mod labeler;
pub mod literal;
pub mod normalizer;
pub mod orchestrator;
pub mod pipeline;
pub mod record_store;
pub mod repair;
pub mod service;
pub mod stats;
pub mod value;

pub use error::RecordError;
pub use normalizer::{normalize, NormalizedRecord};
pub use orchestrator::{BatchReport, ScanEvent, ScanInput, ScanOrchestrator, TaskState};
pub use pipeline::{Pipeline, PipelineConfig, PipelineReport};
pub use service::{AnalysisId, AnalysisService, ServiceError, VirusTotalClient};
pub use value::RawValue;

/// Version string with build identification
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("AVSCAN_REVISION"),
    ", ",
    env!("AVSCAN_BUILD_TARGET"),
    ", built ",
    env!("AVSCAN_BUILD_DATE"),
    ")"
);
