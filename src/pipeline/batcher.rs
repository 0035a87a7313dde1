use crate::pipeline::batch::Batch;
use crate::pipeline::PipelineError;
use crate::source::record::Record;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Longest time a partial batch is held before it is flushed.
pub const DEFAULT_LINGER: Duration = Duration::from_secs(1);

/// Group records from `input` into batches of at most `max_size`.
///
/// A batch is flushed as soon as it is full, or `linger` after its first
/// record arrived, whichever comes first. The linger timer only runs while
/// records are buffered, so idle periods never produce empty batches. When
/// `input` closes, any remainder goes out as a final batch and `output` is
/// closed by dropping it.
pub async fn batch_records(
    mut input: mpsc::Receiver<Record>,
    output: mpsc::Sender<Batch>,
    max_size: usize,
    linger: Duration,
) -> Result<(), PipelineError> {
    let max_size = max_size.max(1);
    let mut buffer: Vec<Record> = Vec::with_capacity(max_size);
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            received = input.recv() => match received {
                Some(record) => {
                    if buffer.is_empty() {
                        deadline = Some(Instant::now() + linger);
                    }
                    buffer.push(record);
                    if buffer.len() < max_size {
                        continue;
                    }
                }
                None => {
                    if !buffer.is_empty() {
                        debug!(size = buffer.len(), "Flushing final batch");
                        flush(&mut buffer, max_size, &output).await?;
                    }
                    return Ok(());
                }
            },
            _ = linger_expired(deadline) => {}
        }

        // Full, or the linger timer fired.
        deadline = None;
        if !buffer.is_empty() {
            flush(&mut buffer, max_size, &output).await?;
        }
    }
}

async fn linger_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Publish the buffered records and start a fresh buffer.
async fn flush(
    buffer: &mut Vec<Record>,
    max_size: usize,
    output: &mpsc::Sender<Batch>,
) -> Result<(), PipelineError> {
    let records = std::mem::replace(buffer, Vec::with_capacity(max_size));
    output
        .send(Batch::new(records))
        .await
        .map_err(|_| PipelineError::ChannelSend)
}
