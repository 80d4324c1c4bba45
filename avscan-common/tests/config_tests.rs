//! Unit tests for configuration loading and API key resolution
//!
//! Note: Uses serial_test crate to prevent ENV variable race conditions.
//! Tests that manipulate AVSCAN_API_KEY or AVSCAN_CONFIG are marked with #[serial]
//! to ensure they run sequentially, not in parallel.

use avscan_common::config::{
    is_valid_key, load_config, resolve_api_key, IdentifierAlgorithm, TomlConfig,
    API_KEY_ENV_VAR, CONFIG_ENV_VAR,
};
use serial_test::serial;
use std::path::PathBuf;
use tempfile::TempDir;

fn config_with_key(key: Option<&str>) -> TomlConfig {
    TomlConfig {
        api_key: key.map(str::to_string),
        ..TomlConfig::default()
    }
}

// ============================================================================
// API key resolution
// ============================================================================

#[test]
#[serial]
fn test_cli_overrides_env_and_toml() {
    std::env::set_var(API_KEY_ENV_VAR, "env-key");

    let result = resolve_api_key(Some("cli-key"), &config_with_key(Some("toml-key"))).unwrap();
    assert_eq!(result, "cli-key");

    std::env::remove_var(API_KEY_ENV_VAR);
}

#[test]
#[serial]
fn test_env_fallback_when_cli_missing() {
    std::env::set_var(API_KEY_ENV_VAR, "env-key");

    let result = resolve_api_key(None, &config_with_key(Some("toml-key"))).unwrap();
    assert_eq!(result, "env-key");

    std::env::remove_var(API_KEY_ENV_VAR);
}

#[test]
#[serial]
fn test_toml_fallback_when_cli_and_env_missing() {
    std::env::remove_var(API_KEY_ENV_VAR);

    let result = resolve_api_key(None, &config_with_key(Some("toml-key"))).unwrap();
    assert_eq!(result, "toml-key");
}

#[test]
#[serial]
fn test_whitespace_keys_are_skipped() {
    std::env::set_var(API_KEY_ENV_VAR, "   ");

    let result = resolve_api_key(Some(""), &config_with_key(Some("toml-key"))).unwrap();
    assert_eq!(result, "toml-key");

    std::env::remove_var(API_KEY_ENV_VAR);
}

#[test]
#[serial]
fn test_error_when_no_key_found() {
    std::env::remove_var(API_KEY_ENV_VAR);

    let err = resolve_api_key(None, &config_with_key(None)).unwrap_err();
    assert!(err.to_string().contains("API key not configured"));
}

#[test]
fn test_is_valid_key() {
    assert!(is_valid_key("abc"));
    assert!(!is_valid_key(""));
    assert!(!is_valid_key(" \t\n"));
}

// ============================================================================
// TOML loading
// ============================================================================

#[test]
fn test_empty_file_yields_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(&path, "").unwrap();

    let config = TomlConfig::load(&path).unwrap();
    assert_eq!(config.concurrency, 4);
    assert_eq!(config.identifier_algorithm, IdentifierAlgorithm::Sha1);
    assert_eq!(config.service.requests_per_minute, 4);
    assert_eq!(config.labeler.extra_args, vec!["-t".to_string()]);
    assert_eq!(config.labeler.report_file, "output.txt");
    assert!(config.labeler.path.is_none());
    assert!(!config.scan.recursive);
}

#[test]
fn test_partial_file_overrides_selected_fields() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
concurrency = 8
identifier_algorithm = "sha256"

[service]
poll_interval_secs = 5

[labeler]
path = "/opt/avclass/labeler.py"

[scan]
extensions = ["exe", "dll"]
"#,
    )
    .unwrap();

    let config = TomlConfig::load(&path).unwrap();
    assert_eq!(config.concurrency, 8);
    assert_eq!(config.identifier_algorithm, IdentifierAlgorithm::Sha256);
    assert_eq!(config.service.poll_interval_secs, 5);
    assert_eq!(config.service.completion_timeout_secs, 900);
    assert_eq!(
        config.labeler.path,
        Some(PathBuf::from("/opt/avclass/labeler.py"))
    );
    assert_eq!(config.scan.extensions, vec!["exe", "dll"]);
}

#[test]
fn test_zero_concurrency_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(&path, "concurrency = 0\n").unwrap();

    let err = TomlConfig::load(&path).unwrap_err();
    assert!(err.to_string().contains("concurrency"));
}

#[test]
fn test_malformed_toml_is_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(&path, "concurrency = [").unwrap();

    let err = TomlConfig::load(&path).unwrap_err();
    assert!(err.to_string().starts_with("Configuration error"));
}

#[test]
#[serial]
fn test_explicit_missing_path_is_error() {
    std::env::remove_var(CONFIG_ENV_VAR);
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope.toml");

    assert!(load_config(Some(&missing)).is_err());
}

#[test]
#[serial]
fn test_env_config_path_used_when_cli_missing() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("env.toml");
    std::fs::write(&path, "concurrency = 2\n").unwrap();
    std::env::set_var(CONFIG_ENV_VAR, &path);

    let config = load_config(None).unwrap();
    assert_eq!(config.concurrency, 2);

    std::env::remove_var(CONFIG_ENV_VAR);
}
