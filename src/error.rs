//! Error types for the sink client and the pipeline.

use thiserror::Error;

/// Errors returned by a [`Sink`](crate::sink::Sink).
#[derive(Debug, Error)]
pub enum SinkError {
    /// The target log does not exist (or was deleted under us).
    #[error("log not found: {log_id}")]
    LogNotFound { log_id: String },

    /// The request never got a response.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("service error: HTTP {status}: {message}")]
    Service { status: u16, message: String },

    #[error("failed to encode log metadata: {0}")]
    Encode(#[source] serde_json::Error),

    /// The service accepted the call but its response could not be parsed.
    #[error("failed to decode HTTP {status} response: {source}")]
    Decode {
        status: u16,
        #[source]
        source: serde_json::Error,
    },
}

impl SinkError {
    /// Whether repeating the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SinkError::LogNotFound { .. } | SinkError::Encode(_) | SinkError::Decode { .. }
        )
    }
}

/// Fatal pipeline failures. Cancellation is not one of them.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to start source `{program}`: {source}")]
    SourceSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read source: {0}")]
    SourceRead(#[source] std::io::Error),

    #[error("failed to create target log: {0}")]
    CreateLog(#[source] SinkError),

    #[error("failed to publish batch: {0}")]
    Publish(#[source] SinkError),

    #[error("{task} task panicked: {message}")]
    TaskPanicked { task: &'static str, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_not_found_is_not_retryable() {
        let err = SinkError::LogNotFound {
            log_id: "log_1".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "log not found: log_1");
    }

    #[test]
    fn undecodable_success_is_not_retryable() {
        let source = serde_json::from_str::<u64>("not json").unwrap_err();
        let err = SinkError::Decode {
            status: 200,
            source,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn service_errors_are_retryable() {
        let err = SinkError::Service {
            status: 503,
            message: "unavailable".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn publish_error_wraps_sink_error() {
        let err = PipelineError::Publish(SinkError::Service {
            status: 500,
            message: "boom".into(),
        });
        assert_eq!(
            err.to_string(),
            "failed to publish batch: service error: HTTP 500: boom"
        );
    }
}
