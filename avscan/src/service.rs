//! Remote analysis service
//!
//! [`AnalysisService`] is the seam the orchestrator talks to: submit a file,
//! wait for its analysis to finish, fetch the result graph. Implementations are
//! shared by every in-flight task and must be safe for concurrent use.
//!
//! [`VirusTotalClient`] implements it over the VirusTotal v3 REST API.

use crate::value::{RawValue, ServiceObject};
use async_trait::async_trait;
use avscan_common::config::ServiceConfig;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = concat!("avscan/", env!("CARGO_PKG_VERSION"));

/// Uploads above this size must go through a one-time upload URL
const DIRECT_UPLOAD_LIMIT: usize = 32 * 1024 * 1024;

/// Remote service errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("API error {0}: {1}")]
    ApiError(u16, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Analysis {id} not completed after {waited:?}")]
    Timeout { id: String, waited: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque handle of a submitted analysis
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnalysisId(pub String);

impl fmt::Display for AnalysisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operations the scan orchestrator needs from a remote analysis service
#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Upload `content` for analysis
    async fn submit(&self, file_name: &str, content: Vec<u8>) -> Result<AnalysisId, ServiceError>;

    /// Return once the analysis is terminal on the service side
    async fn await_completion(&self, id: &AnalysisId) -> Result<(), ServiceError>;

    /// Retrieve the full analysis object
    async fn fetch(&self, id: &AnalysisId) -> Result<RawValue, ServiceError>;
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ObjectRef {
    id: String,
}

/// VirusTotal v3 client
///
/// One HTTP session and one rate limiter shared by every task of a batch.
pub struct VirusTotalClient {
    http_client: reqwest::Client,
    rate_limiter: governor::DefaultDirectRateLimiter,
    base_url: String,
    poll_interval: Duration,
    completion_timeout: Duration,
}

impl VirusTotalClient {
    pub fn new(api_key: &str, config: &ServiceConfig) -> Result<Self, ServiceError> {
        let mut key = reqwest::header::HeaderValue::from_str(api_key.trim())
            .map_err(|_| ServiceError::InvalidApiKey)?;
        key.set_sensitive(true);
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("x-apikey", key);

        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ServiceError::NetworkError(e.to_string()))?;

        let per_minute = NonZeroU32::new(config.requests_per_minute).ok_or_else(|| {
            ServiceError::ParseError("requests_per_minute must be at least 1".to_string())
        })?;
        let rate_limiter = governor::RateLimiter::direct(governor::Quota::per_minute(per_minute));

        Ok(Self {
            http_client,
            rate_limiter,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            completion_timeout: Duration::from_secs(config.completion_timeout_secs),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, ServiceError> {
        self.rate_limiter.until_ready().await;

        let response = request
            .send()
            .await
            .map_err(|e| ServiceError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ServiceError::InvalidApiKey);
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ServiceError::ApiError(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ServiceError::ParseError(e.to_string()))
    }

    async fn upload_url(&self) -> Result<String, ServiceError> {
        let body = self.send(self.http_client.get(self.url("files/upload_url"))).await?;
        let envelope: DataEnvelope<String> =
            serde_json::from_value(body).map_err(|e| ServiceError::ParseError(e.to_string()))?;
        Ok(envelope.data)
    }

    async fn analysis_status(&self, id: &AnalysisId) -> Result<String, ServiceError> {
        let body = self
            .send(self.http_client.get(self.url(&format!("analyses/{}", id))))
            .await?;
        body.pointer("/data/attributes/status")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ServiceError::ParseError("analysis response has no status".to_string()))
    }
}

#[async_trait]
impl AnalysisService for VirusTotalClient {
    async fn submit(&self, file_name: &str, content: Vec<u8>) -> Result<AnalysisId, ServiceError> {
        let size = content.len();
        let url = if size > DIRECT_UPLOAD_LIMIT {
            self.upload_url().await?
        } else {
            self.url("files")
        };

        let part = reqwest::multipart::Part::bytes(content).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);

        tracing::debug!(file = %file_name, size, "Uploading file for analysis");
        let body = self.send(self.http_client.post(url).multipart(form)).await?;

        let envelope: DataEnvelope<ObjectRef> =
            serde_json::from_value(body).map_err(|e| ServiceError::ParseError(e.to_string()))?;
        Ok(AnalysisId(envelope.data.id))
    }

    async fn await_completion(&self, id: &AnalysisId) -> Result<(), ServiceError> {
        let started = tokio::time::Instant::now();
        loop {
            let status = self.analysis_status(id).await?;
            if status == "completed" {
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= self.completion_timeout {
                return Err(ServiceError::Timeout {
                    id: id.to_string(),
                    waited,
                });
            }
            tracing::debug!(analysis_id = %id, %status, "Analysis not finished, polling again");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn fetch(&self, id: &AnalysisId) -> Result<RawValue, ServiceError> {
        let body = self
            .send(self.http_client.get(self.url(&format!("analyses/{}", id))))
            .await?;
        let data = body
            .get("data")
            .ok_or_else(|| ServiceError::ParseError("response has no data object".to_string()))?;
        object_from_json(data)
    }
}

/// Convert a v3 API `data` object into a [`RawValue::Object`]
///
/// Integer attributes named `date` or ending in `_date` are epoch seconds and
/// become [`RawValue::Timestamp`].
pub fn object_from_json(data: &Value) -> Result<RawValue, ServiceError> {
    let field = |name: &str| {
        data.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ServiceError::ParseError(format!("object has no {} field", name)))
    };

    let mut object = ServiceObject::new(field("type")?, field("id")?);
    if let Some(attributes) = data.get("attributes").and_then(Value::as_object) {
        object.attributes = attributes
            .iter()
            .map(|(key, value)| (key.clone(), attribute_value(key, value)))
            .collect();
    }
    if let Some(context) = data.get("context_attributes").and_then(Value::as_object) {
        object.context_attributes = context
            .iter()
            .map(|(key, value)| (key.clone(), RawValue::from(value.clone())))
            .collect();
    }
    Ok(RawValue::Object(object))
}

fn attribute_value(key: &str, value: &Value) -> RawValue {
    if key == "date" || key.ends_with("_date") {
        if let Some(ts) = value.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()) {
            return RawValue::Timestamp(ts);
        }
    }
    RawValue::from(value.clone())
}
