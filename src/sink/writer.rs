use crate::pipeline::batch::Batch;
use crate::sink::traits::{FailureKind, InputLogEvent, LogSink, LogTarget, PutOutcome, SinkError};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("append to sink failed: {0}")]
    Append(#[from] SinkError),

    #[error("{step} for {target} failed: {source}")]
    Recovery {
        step: &'static str,
        target: LogTarget,
        #[source]
        source: SinkError,
    },
}

/// Delivers batches to one log stream, tracking the append token.
pub struct Writer<S> {
    sink: S,
    target: LogTarget,
    next_token: Option<String>,
}

impl<S: LogSink> Writer<S> {
    /// `token` is the last token persisted by a previous run, if any.
    pub fn new(sink: S, target: LogTarget, token: Option<String>) -> Self {
        Self {
            sink,
            target,
            next_token: token.filter(|t| !t.is_empty()),
        }
    }

    pub fn target(&self) -> &LogTarget {
        &self.target
    }

    pub fn token(&self) -> Option<&str> {
        self.next_token.as_deref()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Append `batch` and return the token to use for the next append.
    ///
    /// A missing target is created and a stale token is refreshed, each
    /// followed by exactly one retry. A duplicate submission counts as
    /// success and leaves the token unchanged.
    pub async fn write_batch(&mut self, batch: &Batch) -> Result<Option<String>, WriterError> {
        if batch.is_empty() {
            return Ok(self.next_token.clone());
        }
        let events = encode_events(batch)?;

        let failure = match self.put(&events).await {
            Ok(outcome) => return Ok(self.accept(outcome)),
            Err(e) => e,
        };

        match failure.kind() {
            FailureKind::AlreadyAccepted => {
                warn!(log_target = %self.target, error = %failure, "Batch already accepted by sink");
                return Ok(self.next_token.clone());
            }
            FailureKind::TargetMissing => {
                warn!(log_target = %self.target, "Log stream missing, creating it");
                self.sink
                    .create_target(&self.target)
                    .await
                    .map_err(|source| self.recovery("creating target", source))?;
                // A new stream takes its first append without a token.
                self.next_token = None;
            }
            FailureKind::StaleToken => {
                warn!(log_target = %self.target, error = %failure, "Sequence token rejected, refreshing");
                self.next_token = self
                    .sink
                    .describe_sequence_token(&self.target)
                    .await
                    .map_err(|source| self.recovery("refreshing sequence token", source))?;
            }
            FailureKind::Other => return Err(failure.into()),
        }

        match self.put(&events).await {
            Ok(outcome) => Ok(self.accept(outcome)),
            Err(e) if e.kind() == FailureKind::AlreadyAccepted => {
                warn!(log_target = %self.target, error = %e, "Retried batch already accepted by sink");
                Ok(self.next_token.clone())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, events: &[InputLogEvent]) -> Result<PutOutcome, SinkError> {
        self.sink
            .put_log_events(&self.target, self.next_token.as_deref(), events)
            .await
    }

    fn accept(&mut self, outcome: PutOutcome) -> Option<String> {
        debug!(
            log_target = %self.target,
            token = outcome.next_sequence_token.as_deref().unwrap_or(""),
            "Batch delivered"
        );
        self.next_token = outcome.next_sequence_token;
        self.next_token.clone()
    }

    fn recovery(&self, step: &'static str, source: SinkError) -> WriterError {
        WriterError::Recovery {
            step,
            target: self.target.clone(),
            source,
        }
    }
}

/// One event per record: compact JSON, stamped with the record's time.
pub fn encode_events(batch: &Batch) -> Result<Vec<InputLogEvent>, serde_json::Error> {
    batch
        .records()
        .iter()
        .map(|record| {
            Ok(InputLogEvent {
                timestamp: record.timestamp.timestamp_millis(),
                message: record.to_json()?,
            })
        })
        .collect()
}
