//! Label-bridge records for the consensus labeling tool
//!
//! Projects a repaired record into `{"sha1": <identifier>, "av_labels": [[engine, verdict], ...]}`.
//! Engines whose `result` is null ("did not flag") are dropped; every other entry
//! is kept in the iteration order of `attributes.results`.

use crate::error::RecordError;
use crate::stats::engine_results;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// File name prefix of label-bridge files
pub const LABEL_FILE_PREFIX: &str = "avclassLbformat_";

/// Compact per-file record consumed by the labeling tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRecord {
    /// Content hash of the scanned file
    #[serde(rename = "sha1")]
    pub identifier: String,
    /// `(engine, verdict)` pairs, none with a null verdict
    pub av_labels: Vec<(String, String)>,
}

impl LabelRecord {
    /// Serialize without any whitespace
    pub fn to_compact_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Build the label-bridge record for one repaired record
pub fn to_label_record(record: &Value, identifier: &str) -> Result<LabelRecord, RecordError> {
    let results = engine_results(record)?;

    let mut av_labels = Vec::with_capacity(results.len());
    for (engine_key, entry) in results {
        let entry = entry.as_object().ok_or_else(|| {
            RecordError::MissingResults(format!("entry for {:?} is not a mapping", engine_key))
        })?;

        let verdict = match entry.get("result") {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        if verdict.is_empty() {
            // Kept as-is: some engines may use "" where others use null
            tracing::debug!(engine = %engine_key, "Engine reported an empty verdict");
        }

        let engine = entry
            .get("engine_name")
            .and_then(Value::as_str)
            .unwrap_or(engine_key);
        av_labels.push((engine.to_string(), verdict));
    }

    Ok(LabelRecord {
        identifier: identifier.to_string(),
        av_labels,
    })
}

/// Label-bridge file name for a record named `record_name`
pub fn label_file_name(record_name: &str) -> String {
    format!("{}{}.json", LABEL_FILE_PREFIX, record_name)
}

/// Whether `file_name` follows the label-bridge naming convention
pub fn is_label_file_name(file_name: &str) -> bool {
    file_name.starts_with(LABEL_FILE_PREFIX) && file_name.ends_with(".json")
}

/// Write `label` as `<dir>/avclassLbformat_<record_name>.json`
pub async fn write_label_file(
    dir: &Path,
    record_name: &str,
    label: &LabelRecord,
) -> std::io::Result<PathBuf> {
    let path = dir.join(label_file_name(record_name));
    let json = label.to_compact_json().map_err(std::io::Error::other)?;
    tokio::fs::write(&path, json).await?;
    tracing::debug!(path = %path.display(), labels = label.av_labels.len(), "Label file written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_results_dropped_order_kept() {
        let record = json!({"attributes": {"results": {
            "E1": {"result": null},
            "E2": {"result": "trojan"},
            "E3": {"result": "clean"}
        }}});

        let label = to_label_record(&record, "id").unwrap();
        assert_eq!(
            label.av_labels,
            vec![
                ("E2".to_string(), "trojan".to_string()),
                ("E3".to_string(), "clean".to_string())
            ]
        );
    }

    #[test]
    fn test_compact_serialization_shape() {
        let record = json!({"attributes": {"results": {
            "EngineA": {"engine_name": "EngineA", "result": "Trojan.Gen"},
            "EngineB": {"engine_name": "EngineB", "result": null}
        }}});

        let label = to_label_record(&record, "abc123").unwrap();
        assert_eq!(
            label.to_compact_json().unwrap(),
            r#"{"sha1":"abc123","av_labels":[["EngineA","Trojan.Gen"]]}"#
        );
    }

    #[test]
    fn test_engine_name_field_preferred_over_key() {
        let record = json!({"attributes": {"results": {
            "key-one": {"engine_name": "Engine One", "result": "Worm"},
            "key-two": {"result": "Adware"}
        }}});

        let label = to_label_record(&record, "id").unwrap();
        assert_eq!(label.av_labels[0].0, "Engine One");
        assert_eq!(label.av_labels[1].0, "key-two");
    }

    #[test]
    fn test_empty_verdict_kept_and_missing_result_dropped() {
        let record = json!({"attributes": {"results": {
            "E1": {"result": ""},
            "E2": {"category": "undetected"}
        }}});

        let label = to_label_record(&record, "id").unwrap();
        assert_eq!(label.av_labels, vec![("E1".to_string(), String::new())]);
    }

    #[test]
    fn test_missing_results_is_error() {
        assert!(matches!(
            to_label_record(&json!({"attributes": {}}), "id"),
            Err(RecordError::MissingResults(_))
        ));
    }

    #[test]
    fn test_label_file_naming() {
        assert_eq!(label_file_name("sample.exe"), "avclassLbformat_sample.exe.json");
        assert!(is_label_file_name("avclassLbformat_sample.exe.json"));
        assert!(!is_label_file_name("sample.exe.json"));
        assert!(!is_label_file_name("avclassLbformat_sample.exe.txt"));
    }

    #[tokio::test]
    async fn test_write_label_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let label = LabelRecord {
            identifier: "abc".to_string(),
            av_labels: vec![("E".to_string(), "Mal".to_string())],
        };

        let path = write_label_file(dir.path(), "x.bin", &label).await.unwrap();
        assert_eq!(path.file_name().unwrap(), "avclassLbformat_x.bin.json");

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, r#"{"sha1":"abc","av_labels":[["E","Mal"]]}"#);
        let parsed: LabelRecord = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed, label);
    }
}
