use crate::source::decode::decode_record;
use crate::source::record::Record;
use crate::source::traits::{LogSource, SourceError};
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Backoff after a failed advance, and the longest single wait for new data.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// How long to wait for the very first entry at startup.
pub const FIRST_ENTRY_TIMEOUT: Duration = Duration::from_secs(10);

pub const BOOT_ID_FIELD: &str = "_BOOT_ID";

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("unable to seek to first item in journal")]
    EmptyJournal,

    #[error("record channel closed")]
    OutputClosed,

    #[error("cancelled while positioning the journal")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Restarted within the same boot: tail the journal, skip one entry.
    SameBoot,
    /// Rebooted, or never ran: read from the earliest entry.
    FreshStart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    pub mode: ResumeMode,
    /// Boot id of the first available entry.
    pub boot_id: String,
    pub skip: u64,
}

/// Position `source` for this run based on the checkpointed boot id.
///
/// Moves to the first available entry and compares its boot id with
/// `last_boot_id`. On a match the source is moved to the tail and one entry
/// is skipped, which resumes streaming without replay at the cost of
/// anything logged while we were down.
///
/// Every wait gives way to `cancel`, which yields [`ReaderError::Cancelled`].
pub async fn plan_resume<S>(
    source: &mut S,
    last_boot_id: &str,
    cancel: &CancellationToken,
) -> Result<ResumePlan, ReaderError>
where
    S: LogSource + ?Sized,
{
    if !source.next().await? {
        tokio::select! {
            _ = cancel.cancelled() => return Err(ReaderError::Cancelled),
            result = source.wait(FIRST_ENTRY_TIMEOUT) => result?,
        }
        if !source.next().await? {
            return Err(ReaderError::EmptyJournal);
        }
    }

    let boot_id = source.field(BOOT_ID_FIELD)?.unwrap_or_default().to_string();

    if !boot_id.is_empty() && boot_id == last_boot_id {
        tokio::select! {
            _ = cancel.cancelled() => return Err(ReaderError::Cancelled),
            result = source.seek_tail() => result?,
        }
        info!(boot_id = %boot_id, "Same boot as last run, resuming at the tail of the journal");
        Ok(ResumePlan {
            mode: ResumeMode::SameBoot,
            boot_id,
            skip: 1,
        })
    } else {
        info!(
            boot_id = %boot_id,
            last_boot_id = %last_boot_id,
            "New boot since last run, reading from the earliest entry"
        );
        Ok(ResumePlan {
            mode: ResumeMode::FreshStart,
            boot_id,
            skip: 0,
        })
    }
}

/// Tail `source`, sending decoded records to `output` until cancelled.
///
/// The source must already be positioned on an entry (see [`plan_resume`]).
/// The first `skip` successfully decoded entries are discarded. Dropping the
/// sender on return closes the channel.
pub async fn read_records<S: LogSource>(
    instance_id: String,
    source: S,
    output: mpsc::Sender<Record>,
    skip: u64,
    cancel: CancellationToken,
) -> Result<(), ReaderError> {
    RecordReader::new(instance_id, source, output, skip, cancel)
        .run()
        .await
}

pub struct RecordReader<S> {
    instance_id: String,
    source: S,
    output: mpsc::Sender<Record>,
    skip: u64,
    cancel: CancellationToken,
    last_timestamp: DateTime<Utc>,
    retry_interval: Duration,
}

enum Step {
    Continue,
    Stop,
}

impl<S: LogSource> RecordReader<S> {
    pub fn new(
        instance_id: String,
        source: S,
        output: mpsc::Sender<Record>,
        skip: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            instance_id,
            source,
            output,
            skip,
            cancel,
            last_timestamp: DateTime::<Utc>::MIN_UTC,
            retry_interval: RETRY_INTERVAL,
        }
    }

    /// Override the advance backoff and wait interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub async fn run(mut self) -> Result<(), ReaderError> {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match decode_record(&self.source) {
                Ok(record) if self.skip > 0 => {
                    self.skip -= 1;
                    debug!(boot_id = %record.boot_id, remaining = self.skip, "Skipping entry");
                }
                Ok(record) => {
                    if let Step::Stop = self.emit(record).await? {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to decode journal entry");
                    let record = Record::synthetic(format!("error unmarshalling record: {e}"));
                    if let Step::Stop = self.emit(record).await? {
                        break;
                    }
                }
            }

            if let Step::Stop = self.advance().await? {
                break;
            }
        }

        debug!("Record reader stopped");
        Ok(())
    }

    /// Move to the next entry, waiting for new data and backing off on errors.
    async fn advance(&mut self) -> Result<Step, ReaderError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(Step::Stop);
            }

            match self.source.next().await {
                Ok(true) => return Ok(Step::Continue),
                Ok(false) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(Step::Stop),
                        result = self.source.wait(self.retry_interval) => {
                            if let Err(e) = result {
                                warn!(error = %e, "Error waiting for journal data");
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Error reading from journal");
                    let record = Record::synthetic(format!("error reading from journal: {e}"));
                    if let Step::Stop = self.emit(record).await? {
                        return Ok(Step::Stop);
                    }
                    // Most likely we didn't move; don't spin on the error.
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(Step::Stop),
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                }
            }
        }
    }

    async fn emit(&mut self, mut record: Record) -> Result<Step, ReaderError> {
        // Keep timestamps non-decreasing within a run.
        let now = Utc::now().max(self.last_timestamp);
        self.last_timestamp = now;
        record.timestamp = now;
        record.instance_id.clone_from(&self.instance_id);

        tokio::select! {
            _ = self.cancel.cancelled() => Ok(Step::Stop),
            result = self.output.send(record) => match result {
                Ok(()) => Ok(Step::Continue),
                Err(_) => Err(ReaderError::OutputClosed),
            },
        }
    }
}
