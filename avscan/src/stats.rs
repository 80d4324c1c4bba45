//! Detection statistics
//!
//! Reads `attributes.stats` (category → engine count) and `attributes.results`
//! (engine → verdict entry) of a repaired record.

use crate::error::RecordError;
use crate::repair::json_type_name;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Verdict category counted as a detection
pub const MALICIOUS_CATEGORY: &str = "malicious";

/// Aggregate detection figures for one record
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DetectionRates {
    /// Sum of every category count
    pub total: u64,
    /// Count of the `malicious` category
    pub malicious: u64,
    /// malicious / total, 0 when total is 0
    pub detection_rate: f64,
    /// (total - malicious) / total, 0 when total is 0
    pub evasion_rate: f64,
}

/// Distinct detection methods and verdict strings across all engines
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UniqueValueSets {
    pub methods: BTreeSet<String>,
    pub results: BTreeSet<String>,
}

impl DetectionRates {
    pub fn from_counts(total: u64, malicious: u64) -> Self {
        let (detection_rate, evasion_rate) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                malicious as f64 / total as f64,
                total.saturating_sub(malicious) as f64 / total as f64,
            )
        };
        Self {
            total,
            malicious,
            detection_rate,
            evasion_rate,
        }
    }
}

/// Compute detection and evasion rates from `attributes.stats`
///
/// Every category count must be a non-negative integer. Integral floats such
/// as `3.0` are accepted as that integer; negative, fractional or non-finite
/// numbers, strings, booleans and nulls fail with
/// [`RecordError::MissingStats`], as do missing or non-mapping `attributes`
/// and `stats`. Counts are summed across all categories, so an empty `stats`
/// mapping yields zero rates.
pub fn compute_rates(record: &Value) -> Result<DetectionRates, RecordError> {
    let stats = attributes(record)
        .map_err(RecordError::MissingStats)?
        .get("stats")
        .ok_or_else(|| RecordError::MissingStats("no stats in attributes".to_string()))?
        .as_object()
        .ok_or_else(|| RecordError::MissingStats("stats is not a mapping".to_string()))?;

    let mut total = 0u64;
    let mut malicious = 0u64;
    for (category, count) in stats {
        let count = as_count(count).ok_or_else(|| {
            RecordError::MissingStats(format!(
                "count for {:?} is {} instead of a non-negative integer",
                category,
                json_type_name(count)
            ))
        })?;
        total = total.saturating_add(count);
        if category == MALICIOUS_CATEGORY {
            malicious = count;
        }
    }

    Ok(DetectionRates::from_counts(total, malicious))
}

/// Gather non-empty `method` and `result` strings from `attributes.results`
pub fn collect_unique_values(record: &Value) -> Result<UniqueValueSets, RecordError> {
    let mut sets = UniqueValueSets::default();
    for (engine, entry) in engine_results(record)? {
        let entry = entry.as_object().ok_or_else(|| {
            RecordError::MissingResults(format!("entry for {:?} is not a mapping", engine))
        })?;
        if let Some(method) = non_empty_str(entry.get("method")) {
            sets.methods.insert(method.to_string());
        }
        if let Some(result) = non_empty_str(entry.get("result")) {
            sets.results.insert(result.to_string());
        }
    }
    Ok(sets)
}

/// `attributes.results` as a mapping, or `MissingResults`
pub(crate) fn engine_results(record: &Value) -> Result<&Map<String, Value>, RecordError> {
    attributes(record)
        .map_err(RecordError::MissingResults)?
        .get("results")
        .ok_or_else(|| RecordError::MissingResults("no results in attributes".to_string()))?
        .as_object()
        .ok_or_else(|| RecordError::MissingResults("results is not a mapping".to_string()))
}

fn attributes(record: &Value) -> Result<&Map<String, Value>, String> {
    match record.get("attributes") {
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(format!("attributes is {}", json_type_name(other))),
        None => Err("record has no attributes".to_string()),
    }
}

fn as_count(value: &Value) -> Option<u64> {
    if let Some(count) = value.as_u64() {
        return Some(count);
    }
    value
        .as_f64()
        .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
        .map(|f| f as u64)
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}
