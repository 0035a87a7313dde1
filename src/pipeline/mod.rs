pub mod batch;
pub mod batcher;
pub mod channel;
pub mod runner;

pub use batch::Batch;
pub use batcher::batch_records;
pub use channel::{handoff_channel, Receiver, Sender};
pub use runner::{run_pipeline, PipelineError, PipelineOptions, RunSummary};
