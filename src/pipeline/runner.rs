use crate::pipeline::batch::Batch;
use crate::pipeline::batcher::{batch_records, DEFAULT_LINGER};
use crate::pipeline::channel::handoff_channel;
use crate::sink::traits::{LogSink, LogTarget};
use crate::sink::writer::{Writer, WriterError};
use crate::source::reader::{plan_resume, ReaderError, RecordReader, ResumeMode, RETRY_INTERVAL};
use crate::source::record::Record;
use crate::source::traits::LogSource;
use crate::storage::checkpoint::{CheckpointError, CheckpointStore};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that end a pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("channel send error")]
    ChannelSend,

    #[error("reader error: {0}")]
    Reader(#[from] ReaderError),

    #[error("writer error: {0}")]
    Writer(#[from] WriterError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub instance_id: String,
    pub max_batch_size: usize,
    pub linger: Duration,
    /// Reader backoff and wait interval.
    pub retry_interval: Duration,
}

impl PipelineOptions {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            max_batch_size: 100,
            linger: DEFAULT_LINGER,
            retry_interval: RETRY_INTERVAL,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }
}

/// What a run did, reported once it drains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// `None` when cancelled before the journal was positioned.
    pub mode: Option<ResumeMode>,
    pub boot_id: String,
    pub batches: usize,
    pub records: usize,
    pub final_token: Option<String>,
}

/// Ship `source` to `target` until `cancel` fires.
///
/// Resumes from the checkpoint in `store`, pins the observed boot id before
/// anything is sent, and rewrites the checkpoint after every delivered
/// batch. Once cancelled, buffered records are drained and delivered before
/// returning. A failed batch stops the run after a best-effort final
/// checkpoint write. Cancellation while the journal is still being
/// positioned ends the run without touching the checkpoint.
pub async fn run_pipeline<S, K>(
    mut source: S,
    sink: K,
    target: LogTarget,
    store: &mut CheckpointStore,
    options: &PipelineOptions,
    cancel: CancellationToken,
) -> Result<RunSummary, PipelineError>
where
    S: LogSource + 'static,
    K: LogSink,
{
    let checkpoint = store.last_state();
    let plan = match plan_resume(&mut source, &checkpoint.boot_id, &cancel).await {
        Ok(plan) => plan,
        Err(ReaderError::Cancelled) => {
            info!("Cancelled during startup, checkpoint left as is");
            return Ok(RunSummary {
                mode: None,
                boot_id: checkpoint.boot_id,
                batches: 0,
                records: 0,
                final_token: Some(checkpoint.sequence_token).filter(|t| !t.is_empty()),
            });
        }
        Err(e) => return Err(e.into()),
    };
    store.set_state(&plan.boot_id, &checkpoint.sequence_token)?;

    let mut writer = Writer::new(sink, target, Some(checkpoint.sequence_token));
    let mut summary = RunSummary {
        mode: Some(plan.mode),
        boot_id: plan.boot_id.clone(),
        batches: 0,
        records: 0,
        final_token: writer.token().map(str::to_string),
    };

    let (record_tx, record_rx) = handoff_channel::<Record>();
    let (batch_tx, mut batch_rx) = handoff_channel::<Batch>();

    let reader = RecordReader::new(
        options.instance_id.clone(),
        source,
        record_tx,
        plan.skip,
        cancel.clone(),
    )
    .with_retry_interval(options.retry_interval);
    let reader_handle = tokio::spawn(reader.run());
    let batcher_handle = tokio::spawn(batch_records(
        record_rx,
        batch_tx,
        options.max_batch_size,
        options.linger,
    ));

    info!(log_target = %writer.target(), mode = ?plan.mode, "Pipeline started");

    let mut failure: Option<PipelineError> = None;
    while let Some(batch) = batch_rx.recv().await {
        let token = match writer.write_batch(&batch).await {
            Ok(token) => token,
            Err(e) => {
                error!(error = %e, size = batch.len(), "Failed to deliver batch");
                failure = Some(e.into());
                break;
            }
        };

        summary.batches += 1;
        summary.records += batch.len();
        debug!(
            size = batch.len(),
            token = token.as_deref().unwrap_or(""),
            "Delivered batch"
        );

        if let Err(e) = store.set_state(&plan.boot_id, token.as_deref().unwrap_or("")) {
            error!(error = %e, "Failed to save checkpoint");
            failure = Some(e.into());
            break;
        }
    }

    summary.final_token = writer.token().map(str::to_string);

    if let Some(failure) = failure {
        cancel.cancel();
        drop(batch_rx);
        if let Err(e) = store.set_state(&plan.boot_id, writer.token().unwrap_or("")) {
            warn!(error = %e, "Final checkpoint write failed");
        }
        // The stages only fail here because we stopped listening to them.
        match reader_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Reader stopped after failure"),
            Err(e) => debug!(error = %e, "Reader task join error"),
        }
        match batcher_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Batcher stopped after failure"),
            Err(e) => debug!(error = %e, "Batcher task join error"),
        }
        return Err(failure);
    }

    info!("Draining pipeline");
    reader_handle.await??;
    batcher_handle.await??;
    store.set_state(&plan.boot_id, writer.token().unwrap_or(""))?;

    info!(
        batches = summary.batches,
        records = summary.records,
        "Pipeline stopped"
    );
    Ok(summary)
}
