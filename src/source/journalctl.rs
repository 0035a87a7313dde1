use crate::source::record::Priority;
use crate::source::traits::{JournalEntry, LogSource, SourceError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, info, warn};

const CURSOR_FIELD: &str = "__CURSOR";
const LINE_BUFFER: usize = 256;

/// How long `open`/`seek_tail` wait for journalctl to produce its first line.
pub const POSITION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct JournalctlOptions {
    pub program: PathBuf,
    pub directory: Option<PathBuf>,
    /// Only entries at this priority or more severe.
    pub max_priority: Option<Priority>,
    /// Only entries with one of these syslog identifiers.
    pub units: Vec<String>,
}

impl Default for JournalctlOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from("journalctl"),
            directory: None,
            max_priority: None,
            units: Vec::new(),
        }
    }
}

/// Where a (re)spawned journalctl starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StartAt {
    Head,
    Tail,
    AfterCursor(String),
}

type Line = Result<JournalEntry, String>;

struct Follower {
    child: Child,
    lines: mpsc::Receiver<Line>,
}

/// Log source backed by `journalctl --output=json --follow`.
pub struct JournalctlSource {
    options: JournalctlOptions,
    follower: Option<Follower>,
    // Set when the follower died; the next advance restarts it.
    restart_from: Option<StartAt>,
    pending: Option<Line>,
    current: Option<Line>,
    last_cursor: Option<String>,
}

impl JournalctlSource {
    /// Start following the journal from its earliest entry.
    pub fn open(options: JournalctlOptions) -> Result<Self, SourceError> {
        let follower = spawn_follower(&options, &StartAt::Head)?;
        info!(program = %options.program.display(), "Following journal");
        Ok(Self {
            options,
            follower: Some(follower),
            restart_from: None,
            pending: None,
            current: None,
            last_cursor: None,
        })
    }

    pub fn options(&self) -> &JournalctlOptions {
        &self.options
    }

    fn set_current(&mut self, line: Line) {
        if let Ok(entry) = &line {
            if let Some(cursor) = entry.field(CURSOR_FIELD) {
                self.last_cursor = Some(cursor.to_string());
            }
        }
        self.current = Some(line);
    }

    fn resume_point(&self) -> StartAt {
        match &self.last_cursor {
            Some(cursor) => StartAt::AfterCursor(cursor.clone()),
            None => StartAt::Head,
        }
    }

    fn restart(&mut self) -> Result<(), SourceError> {
        let start = self.restart_from.take().unwrap_or_else(|| self.resume_point());
        match spawn_follower(&self.options, &start) {
            Ok(follower) => {
                info!(start = ?start, "Restarted journal follower");
                self.follower = Some(follower);
                Ok(())
            }
            Err(e) => {
                self.restart_from = Some(start);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl LogSource for JournalctlSource {
    async fn next(&mut self) -> Result<bool, SourceError> {
        if let Some(line) = self.pending.take() {
            self.set_current(line);
            return Ok(true);
        }

        if self.follower.is_none() {
            self.restart()?;
        }
        let Some(follower) = self.follower.as_mut() else {
            return Err(SourceError::Exited);
        };

        match follower.lines.try_recv() {
            Ok(line) => {
                self.set_current(line);
                Ok(true)
            }
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Disconnected) => {
                let status = follower.child.try_wait().ok().flatten();
                warn!(status = ?status, "journalctl exited");
                self.follower = None;
                self.restart_from = Some(self.resume_point());
                Err(SourceError::Exited)
            }
        }
    }

    fn field(&self, key: &str) -> Result<Option<&str>, SourceError> {
        match &self.current {
            Some(Ok(entry)) => Ok(entry.field(key)),
            Some(Err(reason)) => Err(SourceError::Malformed(reason.clone())),
            None => Err(SourceError::NoEntry),
        }
    }

    async fn seek_tail(&mut self) -> Result<(), SourceError> {
        // Dropping the old follower kills its child.
        self.follower = None;
        self.pending = None;
        let mut follower = spawn_follower(&self.options, &StartAt::Tail)?;

        match tokio::time::timeout(POSITION_TIMEOUT, follower.lines.recv()).await {
            Ok(Some(line)) => {
                self.set_current(line);
                self.follower = Some(follower);
                Ok(())
            }
            Ok(None) => Err(SourceError::Exited),
            Err(_) => Err(SourceError::Position(
                "no entry at the tail of the journal".to_string(),
            )),
        }
    }

    async fn wait(&mut self, timeout: Duration) -> Result<(), SourceError> {
        if self.pending.is_some() {
            return Ok(());
        }
        let Some(follower) = self.follower.as_mut() else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, follower.lines.recv()).await {
            Ok(Some(line)) => self.pending = Some(line),
            // Closed; the next advance reports the exit.
            Ok(None) => {}
            Err(_) => {}
        }
        Ok(())
    }
}

fn build_args(options: &JournalctlOptions, start: &StartAt) -> Vec<String> {
    let mut args = vec![
        "--output=json".to_string(),
        // Without it, fields over 4096 bytes come back as null.
        "--all".to_string(),
        "--follow".to_string(),
        "--no-pager".to_string(),
        "--quiet".to_string(),
    ];

    match start {
        StartAt::Head => args.push("--no-tail".to_string()),
        StartAt::Tail => args.push("--lines=1".to_string()),
        StartAt::AfterCursor(cursor) => {
            args.push("--no-tail".to_string());
            args.push(format!("--after-cursor={cursor}"));
        }
    }

    if let Some(dir) = &options.directory {
        args.push(format!("--directory={}", dir.display()));
    }
    if let Some(priority) = options.max_priority {
        if priority < Priority::Debug {
            args.push(format!("--priority=0..{}", priority.ordinal()));
        }
    }
    // Matches on the same field are OR-ed by journalctl.
    for unit in options.units.iter().map(|u| u.trim()).filter(|u| !u.is_empty()) {
        args.push(format!("SYSLOG_IDENTIFIER={unit}"));
    }

    args
}

fn spawn_follower(options: &JournalctlOptions, start: &StartAt) -> Result<Follower, SourceError> {
    let args = build_args(options, start);
    debug!(args = ?args, "Spawning journalctl");

    let mut child = Command::new(&options.program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SourceError::Io(std::io::Error::other("journalctl stdout unavailable")))?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(journalctl = %line, "journalctl stderr");
            }
        });
    }

    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    let parsed = JournalEntry::from_json_line(&line).map_err(|e| e.to_string());
                    if tx.send(parsed).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(format!("error reading journalctl output: {e}"))).await;
                    break;
                }
            }
        }
    });

    Ok(Follower { child, lines: rx })
}
