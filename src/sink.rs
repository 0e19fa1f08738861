//! Remote append-only log service.
//!
//! The pipeline only needs two calls from the service: create a log once at
//! startup, then publish ordered batches of records to it. [`Sink`] is that
//! seam; [`KlevSink`] talks to the klev HTTP API.

use std::fmt;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SinkError;
use crate::record::Record;

pub const DEFAULT_BASE_URL: &str = "https://api.klev.dev";

/// Opaque identifier of the destination log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogId(pub String);

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Descriptive metadata attached to the log when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogMetadata {
    /// Origin tag, e.g. `journal`.
    pub source: String,
    /// Unit name, e.g. `system`.
    pub unit: String,
    /// Unix timestamp (seconds) of pipeline start.
    pub start: i64,
}

impl LogMetadata {
    /// Metadata stamped with the current time.
    pub fn now(source: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            unit: unit.into(),
            start: chrono::Utc::now().timestamp(),
        }
    }

    pub fn to_json(&self) -> Result<String, SinkError> {
        serde_json::to_string(self).map_err(SinkError::Encode)
    }
}

/// Append-only log service used by the batch publisher.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    /// Create the target log and return its identifier.
    async fn create_log(&self, metadata: &LogMetadata) -> Result<LogId, SinkError>;

    /// Append `batch` in order. Returns the log's next offset.
    async fn publish(&self, log: &LogId, batch: &[Record]) -> Result<u64, SinkError>;
}

/// Client settings, read once at startup and passed in explicitly.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub base_url: String,
    pub token: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct CreateLogRequest<'a> {
    metadata: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateLogResponse {
    log_id: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct PublishRequest {
    encoding: &'static str,
    messages: Vec<PublishMessage>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct PublishMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    value: String,
}

impl PublishRequest {
    fn encode(batch: &[Record]) -> Self {
        let messages = batch
            .iter()
            .map(|record| PublishMessage {
                key: record.key.as_ref().map(|k| STANDARD.encode(k)),
                value: STANDARD.encode(&record.value),
            })
            .collect();
        Self {
            encoding: "base64",
            messages,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    next_offset: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

fn error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .map(|e| e.message)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string())
}

/// HTTP client for the klev log service.
#[derive(Debug, Clone)]
pub struct KlevSink {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl KlevSink {
    pub fn new(config: SinkConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    async fn post<B, R>(&self, path: &str, body: &B, log: Option<&LogId>) -> Result<R, SinkError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let body = response.bytes().await?;
            return decode(status, &body);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body, log))
    }
}

/// Parse a success body. A failure here means the call already took effect,
/// so it must not be reported as a transport error.
fn decode<R: DeserializeOwned>(status: StatusCode, body: &[u8]) -> Result<R, SinkError> {
    serde_json::from_slice(body).map_err(|source| SinkError::Decode {
        status: status.as_u16(),
        source,
    })
}

fn classify(status: StatusCode, body: &str, log: Option<&LogId>) -> SinkError {
    match (status, log) {
        (StatusCode::NOT_FOUND, Some(log)) => SinkError::LogNotFound {
            log_id: log.0.clone(),
        },
        _ => SinkError::Service {
            status: status.as_u16(),
            message: error_message(status, body),
        },
    }
}

#[async_trait::async_trait]
impl Sink for KlevSink {
    async fn create_log(&self, metadata: &LogMetadata) -> Result<LogId, SinkError> {
        let metadata = metadata.to_json()?;
        let request = CreateLogRequest {
            metadata: &metadata,
        };
        let response: CreateLogResponse = self.post("/logs", &request, None).await?;
        debug!(log_id = %response.log_id, "Log created");
        Ok(LogId(response.log_id))
    }

    async fn publish(&self, log: &LogId, batch: &[Record]) -> Result<u64, SinkError> {
        let request = PublishRequest::encode(batch);
        let path = format!("/messages/{}", log.0);
        let response: PublishResponse = self.post(&path, &request, Some(log)).await?;
        Ok(response.next_offset)
    }
}

/// In-memory sink that records every batch it accepts.
#[cfg(test)]
pub mod fake {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct State {
        created: Vec<LogMetadata>,
        batches: Vec<Vec<Record>>,
        publish_calls: usize,
        fail_create: bool,
        failures: VecDeque<SinkError>,
        hang: bool,
        delay: Option<Duration>,
    }

    #[derive(Clone, Default)]
    pub struct FakeSink {
        state: Arc<Mutex<State>>,
    }

    enum Step {
        Fail(SinkError),
        Hang,
        Accept(Option<Duration>),
    }

    impl FakeSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_create(self) -> Self {
            self.state.lock().unwrap().fail_create = true;
            self
        }

        /// Make the next publish calls fail, one error per call.
        pub fn fail_publish(self, err: SinkError) -> Self {
            self.state.lock().unwrap().failures.push_back(err);
            self
        }

        /// Every publish call waits forever.
        pub fn hang(self) -> Self {
            self.state.lock().unwrap().hang = true;
            self
        }

        pub fn with_delay(self, delay: Duration) -> Self {
            self.state.lock().unwrap().delay = Some(delay);
            self
        }

        pub fn created(&self) -> Vec<LogMetadata> {
            self.state.lock().unwrap().created.clone()
        }

        pub fn batches(&self) -> Vec<Vec<Record>> {
            self.state.lock().unwrap().batches.clone()
        }

        pub fn batch_sizes(&self) -> Vec<usize> {
            self.batches().iter().map(Vec::len).collect()
        }

        pub fn records(&self) -> Vec<Record> {
            self.batches().into_iter().flatten().collect()
        }

        pub fn publish_calls(&self) -> usize {
            self.state.lock().unwrap().publish_calls
        }
    }

    #[async_trait::async_trait]
    impl Sink for FakeSink {
        async fn create_log(&self, metadata: &LogMetadata) -> Result<LogId, SinkError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_create {
                return Err(SinkError::Service {
                    status: 401,
                    message: "unauthorized".into(),
                });
            }
            state.created.push(metadata.clone());
            Ok(LogId(format!("log_{}", state.created.len())))
        }

        async fn publish(&self, _log: &LogId, batch: &[Record]) -> Result<u64, SinkError> {
            let step = {
                let mut state = self.state.lock().unwrap();
                state.publish_calls += 1;
                match state.failures.pop_front() {
                    Some(err) => Step::Fail(err),
                    None if state.hang => Step::Hang,
                    None => Step::Accept(state.delay),
                }
            };
            match step {
                Step::Fail(err) => Err(err),
                Step::Hang => std::future::pending().await,
                Step::Accept(delay) => {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    let mut state = self.state.lock().unwrap();
                    state.batches.push(batch.to_vec());
                    Ok(state.batches.iter().map(Vec::len).sum::<usize>() as u64)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_serializes_like_the_service_expects() {
        let metadata = LogMetadata {
            source: "journal".into(),
            unit: "system".into(),
            start: 1_700_000_000,
        };
        assert_eq!(
            metadata.to_json().unwrap(),
            r#"{"source":"journal","unit":"system","start":1700000000}"#
        );
    }

    #[test]
    fn publish_request_base64_encodes_in_order() {
        let batch = vec![
            Record::value("first"),
            Record::new(Some(b"host".to_vec()), "second"),
        ];
        let json = serde_json::to_value(PublishRequest::encode(&batch)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "encoding": "base64",
                "messages": [
                    {"value": "Zmlyc3Q="},
                    {"key": "aG9zdA==", "value": "c2Vjb25k"},
                ]
            })
        );
    }

    #[test]
    fn not_found_on_publish_is_distinguished() {
        let log = LogId("log_42".into());
        let err = classify(StatusCode::NOT_FOUND, "", Some(&log));
        assert!(matches!(err, SinkError::LogNotFound { ref log_id } if log_id == "log_42"));
    }

    #[test]
    fn service_error_uses_body_message() {
        let err = classify(
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"message":"try later"}"#,
            None,
        );
        match err {
            SinkError::Service { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "try later");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn service_error_falls_back_to_reason() {
        let err = classify(StatusCode::BAD_GATEWAY, "<html>", None);
        assert_eq!(err.to_string(), "service error: HTTP 502: Bad Gateway");
    }

    #[test]
    fn malformed_publish_response_is_a_final_decode_error() {
        let err = decode::<PublishResponse>(StatusCode::OK, b"<html>ok</html>").unwrap_err();
        assert!(matches!(err, SinkError::Decode { status: 200, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn publish_response_decodes_next_offset() {
        let body = br#"{"next_offset":42}"#;
        let response: PublishResponse = decode(StatusCode::OK, body).unwrap();
        assert_eq!(response.next_offset, 42);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let sink = KlevSink::new(SinkConfig {
            base_url: "http://localhost:8080/".into(),
            token: "t".into(),
            request_timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert_eq!(sink.base_url, "http://localhost:8080");
    }
}
