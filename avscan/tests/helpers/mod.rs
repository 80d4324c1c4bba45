//! Shared test doubles and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use avscan::service::{AnalysisId, AnalysisService, ServiceError};
use avscan::value::{RawValue, ServiceObject};
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Epoch seconds of 2024-03-09 16:00:00 UTC
pub const ANALYSIS_DATE: i64 = 1_710_000_000;

/// In-memory analysis service with per-file scripted failures
///
/// Analysis ids are `analysis-<file name>`, so every step can be matched back
/// to its input file.
#[derive(Default)]
pub struct ScriptedService {
    results: HashMap<String, RawValue>,
    fail_submit: HashSet<String>,
    fail_wait: HashSet<String>,
    fail_fetch: HashSet<String>,
    panic_submit: HashSet<String>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    submitted: Mutex<Vec<String>>,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, name: &str, result: RawValue) -> Self {
        self.results.insert(name.to_string(), result);
        self
    }

    pub fn failing_submit(mut self, name: &str) -> Self {
        self.fail_submit.insert(name.to_string());
        self
    }

    pub fn failing_wait(mut self, name: &str) -> Self {
        self.fail_wait.insert(name.to_string());
        self
    }

    pub fn failing_fetch(mut self, name: &str) -> Self {
        self.fail_fetch.insert(name.to_string());
        self
    }

    pub fn panicking_submit(mut self, name: &str) -> Self {
        self.panic_submit.insert(name.to_string());
        self
    }

    /// Every service call sleeps this long
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Highest number of service calls observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    async fn call(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn name_of(id: &AnalysisId) -> &str {
    id.0.strip_prefix("analysis-").unwrap_or(&id.0)
}

#[async_trait]
impl AnalysisService for ScriptedService {
    async fn submit(&self, file_name: &str, _content: Vec<u8>) -> Result<AnalysisId, ServiceError> {
        if self.panic_submit.contains(file_name) {
            panic!("scripted panic for {}", file_name);
        }
        self.call().await;
        if self.fail_submit.contains(file_name) {
            return Err(ServiceError::NetworkError(format!("upload of {} refused", file_name)));
        }
        self.submitted.lock().unwrap().push(file_name.to_string());
        Ok(AnalysisId(format!("analysis-{}", file_name)))
    }

    async fn await_completion(&self, id: &AnalysisId) -> Result<(), ServiceError> {
        self.call().await;
        if self.fail_wait.contains(name_of(id)) {
            return Err(ServiceError::Timeout {
                id: id.to_string(),
                waited: Duration::from_secs(900),
            });
        }
        Ok(())
    }

    async fn fetch(&self, id: &AnalysisId) -> Result<RawValue, ServiceError> {
        self.call().await;
        let name = name_of(id);
        if self.fail_fetch.contains(name) {
            return Err(ServiceError::ApiError(500, "internal error".to_string()));
        }
        Ok(self
            .results
            .get(name)
            .cloned()
            .unwrap_or_else(|| default_result(name)))
    }
}

/// Analysis object flagged by one engine of two
pub fn default_result(name: &str) -> RawValue {
    let date = Utc.timestamp_opt(ANALYSIS_DATE, 0).unwrap();
    RawValue::Object(
        ServiceObject::new("analysis", format!("analysis-{}", name))
            .with_attribute("date", RawValue::Timestamp(date))
            .with_attribute("status", RawValue::from("completed"))
            .with_attribute("stats", RawValue::from(json!({"malicious": 1, "undetected": 1})))
            .with_attribute(
                "results",
                RawValue::from(json!({
                    "EngineA": {"engine_name": "EngineA", "method": "blacklist", "result": format!("Trojan.{}", name)},
                    "EngineB": {"engine_name": "EngineB", "method": "blacklist", "result": null}
                })),
            ),
    )
}

/// Write `names` as small files under `dir`; returns their paths
pub fn write_inputs(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
    names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            std::fs::write(&path, format!("content of {}", name)).unwrap();
            path
        })
        .collect()
}
