use crate::source::traits::{JournalEntry, LogSource, SourceError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

type Slot = Result<JournalEntry, String>;

#[derive(Debug, Default)]
struct Shared {
    entries: Mutex<Vec<Slot>>,
    appended: Notify,
}

/// Writer half of a [`MemorySource`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MemoryJournal {
    shared: Arc<Shared>,
}

impl MemoryJournal {
    pub fn append(&self, entry: JournalEntry) {
        self.push(Ok(entry));
    }

    /// Append an entry whose fields cannot be read.
    pub fn append_malformed(&self, reason: impl Into<String>) {
        self.push(Err(reason.into()));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, slot: Slot) {
        self.lock().push(slot);
        self.shared.appended.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Slot>> {
        // A poisoned lock only means another holder panicked mid-push.
        self.shared
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-process log source, fed through a [`MemoryJournal`].
///
/// Used to replay captured entries and to drive the pipeline in tests.
#[derive(Debug)]
pub struct MemorySource {
    journal: MemoryJournal,
    // Index of the current entry; None before the first `next`.
    position: Option<usize>,
    current: Option<Slot>,
}

impl MemorySource {
    pub fn new() -> (Self, MemoryJournal) {
        let journal = MemoryJournal {
            shared: Arc::new(Shared::default()),
        };
        let source = Self {
            journal: journal.clone(),
            position: None,
            current: None,
        };
        (source, journal)
    }

    fn load(&mut self, index: usize) {
        self.current = self.journal.lock().get(index).cloned();
        self.position = Some(index);
    }
}

#[async_trait]
impl LogSource for MemorySource {
    async fn next(&mut self) -> Result<bool, SourceError> {
        let next = self.position.map_or(0, |p| p + 1);
        if next < self.journal.len() {
            self.load(next);
            Ok(true)
        } else {
            Ok(false)
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
        match self.journal.len() {
            0 => Err(SourceError::Position("journal is empty".to_string())),
            len => {
                self.load(len - 1);
                Ok(())
            }
        }
    }

    async fn wait(&mut self, timeout: Duration) -> Result<(), SourceError> {
        let notified = self.journal.shared.appended.notified();
        tokio::pin!(notified);
        // Register before checking so an append between the check and the
        // await still wakes us.
        notified.as_mut().enable();

        let next = self.position.map_or(0, |p| p + 1);
        if next < self.journal.len() {
            return Ok(());
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn entry(message: &str) -> JournalEntry {
        JournalEntry::new().with_field("MESSAGE", message)
    }

    #[tokio::test]
    async fn test_cursor_walks_entries() {
        let (mut source, journal) = MemorySource::new();
        journal.append(entry("one"));
        journal.append(entry("two"));

        assert!(matches!(source.field("MESSAGE"), Err(SourceError::NoEntry)));
        assert!(source.next().await.unwrap());
        assert_eq!(source.field("MESSAGE").unwrap(), Some("one"));
        assert!(source.next().await.unwrap());
        assert_eq!(source.field("MESSAGE").unwrap(), Some("two"));
        assert!(!source.next().await.unwrap());
        // Still on the last entry
        assert_eq!(source.field("MESSAGE").unwrap(), Some("two"));
    }

    #[tokio::test]
    async fn test_seek_tail() {
        let (mut source, journal) = MemorySource::new();
        assert!(source.seek_tail().await.is_err());

        journal.append(entry("one"));
        journal.append(entry("two"));
        journal.append(entry("three"));

        source.seek_tail().await.unwrap();
        assert_eq!(source.field("MESSAGE").unwrap(), Some("three"));
        assert!(!source.next().await.unwrap());

        journal.append(entry("four"));
        assert!(source.next().await.unwrap());
        assert_eq!(source.field("MESSAGE").unwrap(), Some("four"));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_append() {
        let (mut source, journal) = MemorySource::new();

        let writer = journal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.append(entry("late"));
        });

        let started = Instant::now();
        source.wait(Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(source.next().await.unwrap());
        assert_eq!(source.field("MESSAGE").unwrap(), Some("late"));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let (mut source, _journal) = MemorySource::new();
        let started = Instant::now();
        source.wait(Duration::from_millis(100)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
