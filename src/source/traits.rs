use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no current entry")]
    NoEntry,

    #[error("malformed entry: {0}")]
    Malformed(String),

    #[error("journal process exited")]
    Exited,

    #[error("timed out positioning the journal: {0}")]
    Position(String),
}

/// A forward cursor over an ordered, append-only structured log.
///
/// The cursor starts before the first entry; `next` must succeed once before
/// `field` returns anything.
#[async_trait]
pub trait LogSource: Send {
    /// Move to the next entry if one is available right now.
    /// Returns `false` when there is nothing new yet.
    async fn next(&mut self) -> Result<bool, SourceError>;

    /// Look up a field on the current entry. A missing key is `Ok(None)`.
    fn field(&self, key: &str) -> Result<Option<&str>, SourceError>;

    /// Position on the newest entry in the log.
    async fn seek_tail(&mut self) -> Result<(), SourceError>;

    /// Wait up to `timeout` for new data to arrive.
    async fn wait(&mut self, timeout: Duration) -> Result<(), SourceError>;
}

/// Flat key/value view of one journal entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalEntry {
    fields: HashMap<String, String>,
}

impl JournalEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Parse one line of `journalctl --output=json`.
    ///
    /// Values are strings, byte arrays for binary payloads, arrays of those
    /// when a field repeats, or null when journalctl elided a large value.
    pub fn from_json_line(line: &str) -> Result<Self, SourceError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| SourceError::Malformed(format!("invalid JSON: {e}")))?;
        let Value::Object(map) = value else {
            return Err(SourceError::Malformed(
                "expected a JSON object".to_string(),
            ));
        };

        let mut fields = HashMap::with_capacity(map.len());
        for (key, value) in map {
            if let Some(text) = field_text(&value) {
                fields.insert(key, text);
            }
        }
        Ok(Self { fields })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for JournalEntry {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) if items.iter().all(Value::is_u64) => {
            let bytes: Vec<u8> = items
                .iter()
                .filter_map(Value::as_u64)
                .map(|b| b as u8)
                .collect();
            Some(String::from_utf8_lossy(&bytes).into_owned())
        }
        // Repeated field: keep the first occurrence.
        Value::Array(items) => items.first().and_then(field_text),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
