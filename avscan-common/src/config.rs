//! Configuration loading and credential resolution
//!
//! Configuration file resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`AVSCAN_CONFIG`)
//! 3. Platform config directory (`<config_dir>/avscan/config.toml`)
//! 4. Built-in defaults (fallback)
//!
//! API key resolution priority: command-line → `AVSCAN_API_KEY` → TOML.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming a config file
pub const CONFIG_ENV_VAR: &str = "AVSCAN_CONFIG";

/// Environment variable carrying the analysis service API key
pub const API_KEY_ENV_VAR: &str = "AVSCAN_API_KEY";

/// Content hash used as the record identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierAlgorithm {
    #[default]
    Sha1,
    Sha256,
}

/// Top-level configuration loaded from TOML
///
/// Every field has a built-in default, so an empty file (or no file) is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Analysis service API key (lowest priority source)
    pub api_key: Option<String>,

    /// Maximum number of scan tasks in flight at once
    pub concurrency: usize,

    /// Hash used to identify files in label-bridge records
    pub identifier_algorithm: IdentifierAlgorithm,

    pub service: ServiceConfig,
    pub labeler: LabelerConfig,
    pub scan: ScanConfig,
    pub logging: LoggingConfig,
}

/// Remote analysis service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// API root, without trailing slash
    pub base_url: String,
    /// Delay between completion polls
    pub poll_interval_secs: u64,
    /// Give up waiting for an analysis after this long
    pub completion_timeout_secs: u64,
    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,
    /// Request quota shared by every task in the batch
    pub requests_per_minute: u32,
}

/// External consensus-labeling tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelerConfig {
    /// Path to the labeling tool; labeling is skipped when unset
    pub path: Option<PathBuf>,
    /// Interpreter to launch the tool with (defaults to `python3` for `.py` tools)
    pub interpreter: Option<String>,
    /// Extra flags passed after the input directory
    pub extra_args: Vec<String>,
    /// Report file name, written into the output directory
    pub report_file: String,
}

/// Input discovery settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Only submit files with one of these extensions (empty = all files)
    pub extensions: Vec<String>,
    /// Descend into subdirectories of the input directory
    pub recursive: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            concurrency: 4,
            identifier_algorithm: IdentifierAlgorithm::default(),
            service: ServiceConfig::default(),
            labeler: LabelerConfig::default(),
            scan: ScanConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.virustotal.com/api/v3".to_string(),
            poll_interval_secs: 20,
            completion_timeout_secs: 900,
            request_timeout_secs: 60,
            requests_per_minute: 4,
        }
    }
}

impl Default for LabelerConfig {
    fn default() -> Self {
        Self {
            path: None,
            interpreter: None,
            extra_args: vec!["-t".to_string()],
            report_file: "output.txt".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl TomlConfig {
    /// Parse configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        let config: TomlConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or break the pipeline
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }
        if self.service.requests_per_minute == 0 {
            return Err(Error::Config(
                "service.requests_per_minute must be at least 1".to_string(),
            ));
        }
        if self.service.poll_interval_secs == 0 {
            return Err(Error::Config(
                "service.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.labeler.report_file.trim().is_empty() {
            return Err(Error::Config("labeler.report_file must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Locate the configuration file, if any
///
/// An explicit path (CLI or environment) is returned even when it does not exist,
/// so that a typo surfaces as an error instead of silently falling back to defaults.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config directory, only if present
    dirs::config_dir()
        .map(|d| d.join("avscan").join("config.toml"))
        .filter(|p| p.exists())
}

/// Load configuration following the resolution priority, or built-in defaults
pub fn load_config(cli_arg: Option<&Path>) -> Result<TomlConfig> {
    match resolve_config_path(cli_arg) {
        Some(path) => {
            let config = TomlConfig::load(&path)?;
            info!("Configuration loaded from {}", path.display());
            Ok(config)
        }
        None => Ok(TomlConfig::default()),
    }
}

/// Resolve the analysis service API key from 3-tier configuration
///
/// **Priority:** CLI → ENV → TOML
pub fn resolve_api_key(cli_arg: Option<&str>, toml_config: &TomlConfig) -> Result<String> {
    let env_key = std::env::var(API_KEY_ENV_VAR).ok();

    let candidates = [
        ("command line", cli_arg.map(str::to_string)),
        ("environment", env_key),
        ("TOML", toml_config.api_key.clone()),
    ];

    let valid: Vec<(&str, String)> = candidates
        .into_iter()
        .filter_map(|(source, key)| key.filter(|k| is_valid_key(k)).map(|k| (source, k)))
        .collect();

    // Warn if multiple sources (potential misconfiguration)
    if valid.len() > 1 {
        let sources: Vec<&str> = valid.iter().map(|(s, _)| *s).collect();
        warn!(
            "API key found in multiple sources: {}. Using {} (highest priority).",
            sources.join(", "),
            sources[0]
        );
    }

    match valid.into_iter().next() {
        Some((source, key)) => {
            info!("API key loaded from {}", source);
            Ok(key)
        }
        None => Err(Error::Config(format!(
            "API key not configured. Supply it using one of:\n\
             1. Command line: avscan <INPUT_DIR> <OUTPUT_DIR> <API_KEY>\n\
             2. Environment: {}=your-key-here\n\
             3. TOML config: api_key = \"your-key\"",
            API_KEY_ENV_VAR
        ))),
    }
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}
