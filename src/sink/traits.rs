use crate::sink::credentials::CredentialsError;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Log group and stream that batches are appended to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTarget {
    pub group: String,
    pub stream: String,
}

impl LogTarget {
    pub fn new(group: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            stream: stream.into(),
        }
    }
}

impl std::fmt::Display for LogTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.stream)
    }
}

/// One event as submitted to the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputLogEvent {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOutcome {
    pub next_sequence_token: Option<String>,
    /// Events the sink accepted the call for but dropped, if any.
    pub rejected: Option<String>,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid endpoint '{0}'")]
    Endpoint(String),

    #[error("credentials unavailable: {0}")]
    Credentials(#[from] CredentialsError),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("resource already exists: {0}")]
    ResourceAlreadyExists(String),

    #[error("data already accepted: {message}")]
    DataAlreadyAccepted {
        message: String,
        expected_sequence_token: Option<String>,
    },

    #[error("invalid sequence token: {message}")]
    InvalidSequenceToken {
        message: String,
        expected_sequence_token: Option<String>,
    },

    #[error("sink returned error status {status} ({code}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },
}

/// How the writer should react to a failed append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    TargetMissing,
    AlreadyAccepted,
    StaleToken,
    Other,
}

impl SinkError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SinkError::ResourceNotFound(_) => FailureKind::TargetMissing,
            SinkError::DataAlreadyAccepted { .. } => FailureKind::AlreadyAccepted,
            SinkError::InvalidSequenceToken { .. } => FailureKind::StaleToken,
            _ => FailureKind::Other,
        }
    }
}

/// Ordered-append log store guarded by sequence tokens.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Append `events` in order. `token` is the value returned by the
    /// previous successful append, if any.
    async fn put_log_events(
        &self,
        target: &LogTarget,
        token: Option<&str>,
        events: &[InputLogEvent],
    ) -> Result<PutOutcome, SinkError>;

    /// Create the destination. Already existing is not an error.
    async fn create_target(&self, target: &LogTarget) -> Result<(), SinkError>;

    /// The sink's current token for `target`.
    async fn describe_sequence_token(&self, target: &LogTarget)
        -> Result<Option<String>, SinkError>;
}
