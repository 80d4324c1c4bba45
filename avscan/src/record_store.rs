//! Normalized record persistence
//!
//! Each completed scan is written twice: `<name>.json` (compact) and
//! `<name>_pretty.json` (four-space indent). Both hold the same record.

use crate::label::is_label_file_name;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const PRETTY_SUFFIX: &str = "_pretty.json";

/// Record persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error on {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Output locations of one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordPaths {
    pub compact: PathBuf,
    pub pretty: PathBuf,
}

impl RecordPaths {
    /// Paths for the record of input file `name` inside `output_dir`
    pub fn for_name(output_dir: &Path, name: &str) -> Self {
        Self {
            compact: output_dir.join(format!("{}.json", name)),
            pretty: output_dir.join(format!("{}{}", name, PRETTY_SUFFIX)),
        }
    }
}

/// Compact JSON, no whitespace
pub fn to_compact_json(record: &Value) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(record)
}

/// Pretty JSON indented with four spaces
pub fn to_pretty_json(record: &Value) -> serde_json::Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    record.serialize(&mut serializer)?;
    Ok(out)
}

/// Write both serializations of `record`
pub async fn persist_record(paths: &RecordPaths, record: &Value) -> Result<(), StoreError> {
    write_json(&paths.compact, to_compact_json(record)).await?;
    write_json(&paths.pretty, to_pretty_json(record)).await?;
    Ok(())
}

async fn write_json(path: &Path, bytes: serde_json::Result<Vec<u8>>) -> Result<(), StoreError> {
    let bytes = bytes.map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Read a persisted record back
pub async fn load_record(path: &Path) -> Result<Value, StoreError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Record name for a compact record file (`x.exe.json` → `x.exe`)
///
/// Pretty copies and label-bridge files are not records.
pub fn record_name(file_name: &str) -> Option<&str> {
    if file_name.ends_with(PRETTY_SUFFIX) || is_label_file_name(file_name) {
        return None;
    }
    file_name.strip_suffix(".json").filter(|name| !name.is_empty())
}

/// Compact record files in `dir`, sorted by name
pub fn discover_records(dir: &Path) -> Result<Vec<(String, PathBuf)>, StoreError> {
    let io_err = |source| StoreError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut records = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if !entry.file_type().map_err(io_err)?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if let Some(name) = record_name(file_name) {
            records.push((name.to_string(), entry.path()));
        }
    }
    records.sort();
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_record() -> Value {
        json!({
            "type": "analysis",
            "id": "an-1",
            "attributes": {
                "stats": {"malicious": 1, "undetected": 2},
                "results": {"E1": {"engine_name": "E1", "result": "Trojan"}},
                "date": "2024-03-09 14:05:00"
            }
        })
    }

    #[test]
    fn test_paths_follow_input_name() {
        let paths = RecordPaths::for_name(Path::new("/out"), "sample.exe");
        assert_eq!(paths.compact, PathBuf::from("/out/sample.exe.json"));
        assert_eq!(paths.pretty, PathBuf::from("/out/sample.exe_pretty.json"));
    }

    #[test]
    fn test_compact_has_no_whitespace() {
        let bytes = to_compact_json(&json!({"a": [1, 2], "b": {"c": null}})).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"a":[1,2],"b":{"c":null}}"#);
    }

    #[test]
    fn test_pretty_uses_four_spaces() {
        let bytes = to_pretty_json(&json!({"a": {"b": 1}})).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "{\n    \"a\": {\n        \"b\": 1\n    }\n}"
        );
    }

    #[tokio::test]
    async fn test_persist_and_load_both_forms_equal() {
        let dir = TempDir::new().unwrap();
        let paths = RecordPaths::for_name(dir.path(), "sample.exe");
        let record = sample_record();

        persist_record(&paths, &record).await.unwrap();

        let compact = load_record(&paths.compact).await.unwrap();
        let pretty = load_record(&paths.pretty).await.unwrap();
        assert_eq!(compact, record);
        assert_eq!(pretty, record);
    }

    #[tokio::test]
    async fn test_load_missing_and_invalid() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(load_record(&missing).await, Err(StoreError::Io { .. })));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{not json").unwrap();
        assert!(matches!(load_record(&broken).await, Err(StoreError::Json { .. })));
    }

    #[test]
    fn test_record_name_filters() {
        assert_eq!(record_name("a.exe.json"), Some("a.exe"));
        assert_eq!(record_name("a.exe_pretty.json"), None);
        assert_eq!(record_name("avclassLbformat_a.exe.json"), None);
        assert_eq!(record_name("notes.txt"), None);
        assert_eq!(record_name(".json"), None);
    }

    #[test]
    fn test_discover_records_sorted() {
        let dir = TempDir::new().unwrap();
        for name in [
            "b.bin.json",
            "a.exe.json",
            "a.exe_pretty.json",
            "avclassLbformat_a.exe.json",
            "output.txt",
        ] {
            std::fs::write(dir.path().join(name), "{}").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.json")).unwrap();

        let records = discover_records(dir.path()).unwrap();
        let names: Vec<&str> = records.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a.exe", "b.bin"]);
    }
}
