use crate::config::{
    load_config_with, resolve_config_path, Config, ConfigError, HostFacts, JournalConfig,
    DEFAULT_CONFIG_PATHS,
};
use crate::pipeline::{run_pipeline, PipelineError, PipelineOptions, RunSummary};
use crate::sink::{
    CloudWatchLogsClient, Credentials, CredentialsError, CredentialsProvider, InstanceMetadata,
    LogTarget, MetadataError, SinkError,
};
use crate::source::{JournalctlOptions, JournalctlSource, SourceError};
use crate::storage::{CheckpointError, CheckpointStore};
use crate::terminate::Terminator;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config not found; searched {}", DEFAULT_CONFIG_PATHS.join(", "))]
    ConfigNotFound,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("credentials error: {0}")]
    Credentials(#[from] CredentialsError),

    #[error("instance metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("error initializing writer: {0}")]
    Sink(#[from] SinkError),

    #[error("error opening journal: {0}")]
    Source(#[from] SourceError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] std::io::Error),

    #[error("{0}")]
    Pipeline(#[from] PipelineError),
}

/// Ship the local journal to CloudWatch Logs until SIGINT/SIGTERM.
pub async fn run(config_path: Option<PathBuf>) -> Result<RunSummary, RunError> {
    let config_path =
        resolve_config_path(config_path.as_deref()).ok_or(RunError::ConfigNotFound)?;

    let env = |name: &str| std::env::var(name).ok();
    let metadata = InstanceMetadata::from_env(env)?;
    let host = match &metadata {
        Some(metadata) => host_facts(metadata).await,
        None => HostFacts::default(),
    };

    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config_with(&config_path, &host)?;
    info!(
        log_group = %config.log_group,
        log_stream = %config.log_stream,
        instance_id = %config.instance_id,
        region = %config.aws.region,
        "Configuration loaded"
    );

    let terminator = Terminator::install().map_err(RunError::Signal)?;

    let credentials = CredentialsProvider::chain(Credentials::from_env(env), metadata)?;
    // Fail at startup rather than on the first batch.
    credentials.credentials().await?;
    let sink = CloudWatchLogsClient::new(&config.aws, credentials)?;

    info!(path = %config.state_file.display(), "Opening checkpoint");
    let mut store = CheckpointStore::open(&config.state_file)?;

    if let Some(directory) = &config.journal.directory {
        info!(directory = %directory.display(), "Using journal directory");
    }
    let source = JournalctlSource::open(journal_options(&config.journal))?;

    let summary = run_pipeline(
        source,
        sink,
        target(&config),
        &mut store,
        &pipeline_options(&config),
        terminator.token(),
    )
    .await?;

    info!(
        mode = ?summary.mode,
        batches = summary.batches,
        records = summary.records,
        "Shutdown complete"
    );
    Ok(summary)
}

/// Instance identity, or nothing when the metadata service can't be reached.
pub async fn host_facts(metadata: &InstanceMetadata) -> HostFacts {
    match metadata.identity_document().await {
        Ok(document) => {
            info!(
                instance_id = document.instance_id.as_deref().unwrap_or(""),
                region = document.region.as_deref().unwrap_or(""),
                "Running on EC2"
            );
            HostFacts::new(document.variables())
        }
        Err(e) => {
            debug!(error = %e, "Instance metadata unavailable");
            HostFacts::default()
        }
    }
}

pub fn journal_options(config: &JournalConfig) -> JournalctlOptions {
    JournalctlOptions {
        directory: config.directory.clone(),
        max_priority: config.priority,
        units: config.units.clone(),
        ..JournalctlOptions::default()
    }
}

pub fn pipeline_options(config: &Config) -> PipelineOptions {
    PipelineOptions::new(config.instance_id.clone())
        .with_max_batch_size(config.batch.max_size)
        .with_linger(config.batch.linger)
}

pub fn target(config: &Config) -> LogTarget {
    LogTarget::new(config.log_group.clone(), config.log_stream.clone())
}
