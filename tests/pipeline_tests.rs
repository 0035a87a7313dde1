use async_trait::async_trait;
use journald_cloudwatch::pipeline::{run_pipeline, PipelineError, PipelineOptions, RunSummary};
use journald_cloudwatch::sink::{InputLogEvent, LogSink, LogTarget, PutOutcome, SinkError};
use journald_cloudwatch::sink::WriterError;
use journald_cloudwatch::source::{JournalEntry, MemoryJournal, MemorySource, ResumeMode};
use journald_cloudwatch::storage::CheckpointStore;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct StreamState {
    created: bool,
    token: Option<String>,
    appends: usize,
    batches: Vec<Vec<InputLogEvent>>,
    creates: usize,
    describes: usize,
    failures: VecDeque<SinkError>,
}

/// Ordered-append stream with CloudWatch's token rules.
#[derive(Clone, Default)]
struct FakeStream {
    state: Arc<Mutex<StreamState>>,
}

impl FakeStream {
    fn existing(token: Option<&str>) -> Self {
        let stream = Self::default();
        {
            let mut state = stream.state.lock().unwrap();
            state.created = true;
            state.token = token.map(str::to_string);
        }
        stream
    }

    fn fail_next(&self, err: SinkError) {
        self.state.lock().unwrap().failures.push_back(err);
    }

    fn messages(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .batches
            .iter()
            .flatten()
            .map(|event| {
                let json: serde_json::Value = serde_json::from_str(&event.message).unwrap();
                json["message"].as_str().unwrap_or_default().to_string()
            })
            .collect()
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().unwrap().batches.iter().map(Vec::len).collect()
    }

    fn token(&self) -> Option<String> {
        self.state.lock().unwrap().token.clone()
    }

    async fn wait_for_events(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.messages().len() < n {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("timed out waiting for events");
    }
}

#[async_trait]
impl LogSink for FakeStream {
    async fn put_log_events(
        &self,
        target: &LogTarget,
        token: Option<&str>,
        events: &[InputLogEvent],
    ) -> Result<PutOutcome, SinkError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        if !state.created {
            return Err(SinkError::ResourceNotFound(format!("{target} does not exist")));
        }
        if token != state.token.as_deref() {
            return Err(SinkError::InvalidSequenceToken {
                message: "The given sequenceToken is invalid.".to_string(),
                expected_sequence_token: state.token.clone(),
            });
        }

        state.appends += 1;
        let next = format!("tok-{}", state.appends);
        state.token = Some(next.clone());
        state.batches.push(events.to_vec());
        Ok(PutOutcome {
            next_sequence_token: Some(next),
            rejected: None,
        })
    }

    async fn create_target(&self, _target: &LogTarget) -> Result<(), SinkError> {
        let mut state = self.state.lock().unwrap();
        state.creates += 1;
        state.created = true;
        Ok(())
    }

    async fn describe_sequence_token(
        &self,
        _target: &LogTarget,
    ) -> Result<Option<String>, SinkError> {
        let mut state = self.state.lock().unwrap();
        state.describes += 1;
        Ok(state.token.clone())
    }
}

fn entry(boot_id: &str, message: &str) -> JournalEntry {
    JournalEntry::new()
        .with_field("_BOOT_ID", boot_id)
        .with_field("_PID", "42")
        .with_field("PRIORITY", "6")
        .with_field("MESSAGE", message)
}

fn journal(boot_id: &str, messages: &[&str]) -> (MemorySource, MemoryJournal) {
    let (source, journal) = MemorySource::new();
    for message in messages {
        journal.append(entry(boot_id, message));
    }
    (source, journal)
}

fn options(max_batch_size: usize, linger: Duration) -> PipelineOptions {
    PipelineOptions::new("i-test")
        .with_max_batch_size(max_batch_size)
        .with_linger(linger)
        .with_retry_interval(Duration::from_millis(50))
}

fn state_path(dir: &TempDir) -> PathBuf {
    dir.path().join("state")
}

fn read_state(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

fn spawn_pipeline(
    source: MemorySource,
    sink: FakeStream,
    path: PathBuf,
    options: PipelineOptions,
) -> (CancellationToken, JoinHandle<Result<RunSummary, PipelineError>>) {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        let mut store = CheckpointStore::open(&path).unwrap();
        run_pipeline(
            source,
            sink,
            LogTarget::new("app", "i-test"),
            &mut store,
            &options,
            token,
        )
        .await
    });
    (cancel, handle)
}

async fn finish(
    handle: JoinHandle<Result<RunSummary, PipelineError>>,
) -> Result<RunSummary, PipelineError> {
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("pipeline did not stop")
        .unwrap()
}

#[tokio::test]
async fn test_fresh_start_creates_stream_and_delivers_in_order() {
    let dir = TempDir::new().unwrap();
    let (source, _journal) = journal("boot-1", &["one", "two", "three", "four", "five"]);
    let sink = FakeStream::default();

    let (cancel, handle) = spawn_pipeline(
        source,
        sink.clone(),
        state_path(&dir),
        options(2, Duration::from_millis(50)),
    );
    sink.wait_for_events(5).await;
    cancel.cancel();
    let summary = finish(handle).await.unwrap();

    assert_eq!(summary.mode, Some(ResumeMode::FreshStart));
    assert_eq!(summary.boot_id, "boot-1");
    assert_eq!(summary.records, 5);
    assert_eq!(sink.messages(), vec!["one", "two", "three", "four", "five"]);
    assert!(sink.batch_sizes().iter().all(|&n| n <= 2));
    assert_eq!(sink.state.lock().unwrap().creates, 1);

    let token = sink.token().unwrap();
    assert_eq!(summary.final_token.as_deref(), Some(token.as_str()));
    assert_eq!(read_state(&state_path(&dir)), format!("boot-1\n{token}\n"));
}

#[tokio::test]
async fn test_events_carry_instance_id_and_priority_label() {
    let dir = TempDir::new().unwrap();
    let (source, _journal) = journal("boot-1", &["hello"]);
    let sink = FakeStream::existing(None);

    let (cancel, handle) = spawn_pipeline(
        source,
        sink.clone(),
        state_path(&dir),
        options(10, Duration::from_millis(50)),
    );
    sink.wait_for_events(1).await;
    cancel.cancel();
    finish(handle).await.unwrap();

    let state = sink.state.lock().unwrap();
    let event = &state.batches[0][0];
    let json: serde_json::Value = serde_json::from_str(&event.message).unwrap();
    assert_eq!(json["instanceId"], "i-test");
    assert_eq!(json["priority"], "INFO");
    assert_eq!(json["pid"], 42);
    assert_eq!(json["bootId"], "boot-1");
    assert!(event.timestamp > 0);
}

#[tokio::test]
async fn test_same_boot_restart_skips_tail_entry() {
    let dir = TempDir::new().unwrap();
    std::fs::write(state_path(&dir), "boot-1\ntok-3\n").unwrap();
    let (source, journal) = journal("boot-1", &["old 1", "old 2", "old 3"]);
    let sink = FakeStream::existing(Some("tok-3"));
    sink.state.lock().unwrap().appends = 3;

    let (cancel, handle) = spawn_pipeline(
        source,
        sink.clone(),
        state_path(&dir),
        options(10, Duration::from_millis(50)),
    );
    // Let the pipeline position itself on the tail before new entries arrive.
    tokio::time::sleep(Duration::from_millis(300)).await;
    journal.append(entry("boot-1", "new 1"));
    journal.append(entry("boot-1", "new 2"));

    sink.wait_for_events(2).await;
    cancel.cancel();
    let summary = finish(handle).await.unwrap();

    assert_eq!(summary.mode, Some(ResumeMode::SameBoot));
    assert_eq!(sink.messages(), vec!["new 1", "new 2"]);
    assert_eq!(read_state(&state_path(&dir)), "boot-1\ntok-4\n");
}

#[tokio::test]
async fn test_reboot_reads_from_earliest_entry() {
    let dir = TempDir::new().unwrap();
    std::fs::write(state_path(&dir), "boot-0\ntok-1\n").unwrap();
    let (source, _journal) = journal("boot-2", &["a", "b", "c"]);
    let sink = FakeStream::existing(Some("tok-1"));
    sink.state.lock().unwrap().appends = 1;

    let (cancel, handle) = spawn_pipeline(
        source,
        sink.clone(),
        state_path(&dir),
        options(10, Duration::from_millis(50)),
    );
    sink.wait_for_events(3).await;
    cancel.cancel();
    let summary = finish(handle).await.unwrap();

    assert_eq!(summary.mode, Some(ResumeMode::FreshStart));
    assert_eq!(sink.messages(), vec!["a", "b", "c"]);
    assert!(read_state(&state_path(&dir)).starts_with("boot-2\ntok-"));
}

#[tokio::test]
async fn test_recreated_stream_starts_without_checkpoint_token() {
    let dir = TempDir::new().unwrap();
    std::fs::write(state_path(&dir), "boot-0\ntok-9\n").unwrap();
    let (source, _journal) = journal("boot-1", &["a", "b"]);
    // The stream behind the checkpointed token has since been deleted.
    let sink = FakeStream::default();

    let (cancel, handle) = spawn_pipeline(
        source,
        sink.clone(),
        state_path(&dir),
        options(10, Duration::from_millis(50)),
    );
    sink.wait_for_events(2).await;
    cancel.cancel();
    finish(handle).await.unwrap();

    let state = sink.state.lock().unwrap();
    assert_eq!(state.creates, 1);
    assert_eq!(state.describes, 0);
    drop(state);
    assert_eq!(sink.messages(), vec!["a", "b"]);
    assert_eq!(read_state(&state_path(&dir)), "boot-1\ntok-1\n");
}

#[tokio::test]
async fn test_stale_checkpoint_token_is_refreshed() {
    let dir = TempDir::new().unwrap();
    std::fs::write(state_path(&dir), "boot-0\ntok-stale\n").unwrap();
    let (source, _journal) = journal("boot-1", &["x"]);
    let sink = FakeStream::existing(Some("tok-7"));
    sink.state.lock().unwrap().appends = 7;

    let (cancel, handle) = spawn_pipeline(
        source,
        sink.clone(),
        state_path(&dir),
        options(10, Duration::from_millis(50)),
    );
    sink.wait_for_events(1).await;
    cancel.cancel();
    finish(handle).await.unwrap();

    assert_eq!(sink.state.lock().unwrap().describes, 1);
    assert_eq!(read_state(&state_path(&dir)), "boot-1\ntok-8\n");
}

#[tokio::test]
async fn test_malformed_entry_becomes_error_record() {
    let dir = TempDir::new().unwrap();
    let (source, journal) = journal("boot-1", &["before"]);
    journal.append_malformed("binary garbage");
    journal.append(entry("boot-1", "after"));
    let sink = FakeStream::existing(None);

    let (cancel, handle) = spawn_pipeline(
        source,
        sink.clone(),
        state_path(&dir),
        options(10, Duration::from_millis(50)),
    );
    sink.wait_for_events(3).await;
    cancel.cancel();
    finish(handle).await.unwrap();

    let messages = sink.messages();
    assert_eq!(messages[0], "before");
    assert!(messages[1].starts_with("error unmarshalling record"), "{messages:?}");
    assert_eq!(messages[2], "after");
}

#[tokio::test]
async fn test_cancellation_drains_buffered_records() {
    let dir = TempDir::new().unwrap();
    let (source, _journal) = journal("boot-1", &["1", "2", "3"]);
    let sink = FakeStream::existing(None);

    // Linger far longer than the test: only shutdown can flush this batch.
    let (cancel, handle) = spawn_pipeline(
        source,
        sink.clone(),
        state_path(&dir),
        options(100, Duration::from_secs(60)),
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(sink.messages().is_empty());

    cancel.cancel();
    let summary = finish(handle).await.unwrap();

    assert_eq!(sink.batch_sizes(), vec![3]);
    assert_eq!(summary.batches, 1);
    assert_eq!(read_state(&state_path(&dir)), "boot-1\ntok-1\n");
}

#[tokio::test]
async fn test_failed_batch_stops_run_and_keeps_last_good_checkpoint() {
    let dir = TempDir::new().unwrap();
    std::fs::write(state_path(&dir), "boot-0\ntok-2\n").unwrap();
    let (source, _journal) = journal("boot-1", &["a", "b"]);
    let sink = FakeStream::existing(Some("tok-2"));
    sink.state.lock().unwrap().appends = 2;
    sink.fail_next(SinkError::Service {
        status: 400,
        code: "ThrottlingException".to_string(),
        message: "Rate exceeded".to_string(),
    });

    let (_cancel, handle) = spawn_pipeline(
        source,
        sink.clone(),
        state_path(&dir),
        options(10, Duration::from_millis(50)),
    );
    let err = finish(handle).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Writer(WriterError::Append(SinkError::Service { .. }))
    ));
    assert!(sink.messages().is_empty());
    assert_eq!(read_state(&state_path(&dir)), "boot-1\ntok-2\n");
}

#[tokio::test]
async fn test_empty_checkpoint_file_is_fresh_start() {
    let dir = TempDir::new().unwrap();
    std::fs::write(state_path(&dir), "not a checkpoint").unwrap();
    let (source, _journal) = journal("boot-1", &["only"]);
    let sink = FakeStream::existing(None);

    let (cancel, handle) = spawn_pipeline(
        source,
        sink.clone(),
        state_path(&dir),
        options(10, Duration::from_millis(50)),
    );
    sink.wait_for_events(1).await;
    cancel.cancel();
    let summary = finish(handle).await.unwrap();

    assert_eq!(summary.mode, Some(ResumeMode::FreshStart));
    assert_eq!(read_state(&state_path(&dir)), "boot-1\ntok-1\n");
}

#[tokio::test]
async fn test_cancel_while_waiting_for_first_entry() {
    let dir = TempDir::new().unwrap();
    std::fs::write(state_path(&dir), "boot-0\ntok-2\n").unwrap();
    let (source, _journal) = MemorySource::new();
    let sink = FakeStream::existing(Some("tok-2"));

    let (cancel, handle) = spawn_pipeline(
        source,
        sink.clone(),
        state_path(&dir),
        options(10, Duration::from_millis(50)),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("startup ignored cancellation")
        .unwrap()
        .unwrap();

    assert_eq!(summary.mode, None);
    assert_eq!(summary.batches, 0);
    assert!(sink.messages().is_empty());
    assert_eq!(read_state(&state_path(&dir)), "boot-0\ntok-2\n");
}
