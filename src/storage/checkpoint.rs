use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("failed to open checkpoint file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write checkpoint file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint value may not contain a newline: {0:?}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Last durably acknowledged position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub boot_id: String,
    pub sequence_token: String,
}

impl Checkpoint {
    pub fn new(boot_id: impl Into<String>, sequence_token: impl Into<String>) -> Self {
        Self {
            boot_id: boot_id.into(),
            sequence_token: sequence_token.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.boot_id.is_empty() && self.sequence_token.is_empty()
    }

    /// Parse `"<boot>\n<token>\n"`. Anything else is `None`.
    fn parse(content: &str) -> Option<Self> {
        let body = content.strip_suffix('\n')?;
        let (boot_id, sequence_token) = body.split_once('\n')?;
        if sequence_token.contains('\n') {
            return None;
        }
        Some(Self::new(boot_id, sequence_token))
    }

    fn render(&self) -> String {
        format!("{}\n{}\n", self.boot_id, self.sequence_token)
    }
}

/// Single-record checkpoint file, rewritten in full on every update.
///
/// One process is assumed to own a given path.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    file: File,
}

impl CheckpointStore {
    /// Open or create the checkpoint file without reading it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&path).map_err(|source| CheckpointError::Open {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored state. Absent, short or malformed content reads as an
    /// empty checkpoint.
    pub fn last_state(&mut self) -> Checkpoint {
        let mut content = String::new();
        let read = self
            .file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_string(&mut content));
        if let Err(e) = read {
            warn!(path = %self.path.display(), error = %e, "Could not read checkpoint, starting fresh");
            return Checkpoint::default();
        }

        match Checkpoint::parse(&content) {
            Some(checkpoint) => checkpoint,
            None => {
                if !content.is_empty() {
                    warn!(path = %self.path.display(), "Ignoring malformed checkpoint");
                }
                Checkpoint::default()
            }
        }
    }

    /// Replace the stored state and flush it to disk.
    pub fn set_state(&mut self, boot_id: &str, sequence_token: &str) -> Result<()> {
        for value in [boot_id, sequence_token] {
            if value.contains('\n') {
                return Err(CheckpointError::InvalidValue(value.to_string()));
            }
        }

        let content = Checkpoint::new(boot_id, sequence_token).render();
        let write = |file: &mut File| -> std::io::Result<()> {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(content.as_bytes())?;
            file.set_len(content.len() as u64)?;
            file.sync_data()
        };
        write(&mut self.file).map_err(|source| CheckpointError::Write {
            path: self.path.clone(),
            source,
        })?;

        debug!(boot_id, sequence_token, "Checkpoint saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::open(dir.path().join("state")).unwrap()
    }

    #[test]
    fn test_fresh_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        assert!(dir.path().join("state").exists());
        assert_eq!(store.last_state(), Checkpoint::default());
        assert!(store.last_state().is_empty());
    }

    #[test]
    fn test_set_then_read() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        store.set_state("b1", "t1").unwrap();
        assert_eq!(store.last_state(), Checkpoint::new("b1", "t1"));

        let on_disk = std::fs::read_to_string(dir.path().join("state")).unwrap();
        assert_eq!(on_disk, "b1\nt1\n");
    }

    #[test]
    fn test_shorter_value_overwrites_longer() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        store
            .set_state("0f1e2d3c4b5a69788796a5b4c3d2e1f0", "49612345678901234567890123456789")
            .unwrap();
        store.set_state("b1", "t1").unwrap();

        assert_eq!(store.last_state(), Checkpoint::new("b1", "t1"));
        let on_disk = std::fs::read_to_string(dir.path().join("state")).unwrap();
        assert_eq!(on_disk, "b1\nt1\n");
    }

    #[test]
    fn test_boot_pinned_before_first_token() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        store.set_state("b1", "").unwrap();
        assert_eq!(store.last_state(), Checkpoint::new("b1", ""));
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        store_in(&dir).set_state("b2", "t7").unwrap();

        let mut reopened = store_in(&dir);
        assert_eq!(reopened.last_state(), Checkpoint::new("b2", "t7"));
    }

    #[test]
    fn test_malformed_content_reads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state");

        for content in ["b1", "b1\n", "b1\nt1", "b1\nt1\nextra\n", "garbage without newline"] {
            std::fs::write(&path, content).unwrap();
            let mut store = CheckpointStore::open(&path).unwrap();
            assert_eq!(store.last_state(), Checkpoint::default(), "content {content:?}");
        }
    }

    #[test]
    fn test_rejects_newlines() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        let err = store.set_state("b\n1", "t1").unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidValue(_)));
        assert_eq!(store.last_state(), Checkpoint::default());
    }

    #[cfg(unix)]
    #[test]
    fn test_created_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_open_fails_for_missing_directory() {
        let dir = TempDir::new().unwrap();
        let result = CheckpointStore::open(dir.path().join("missing").join("state"));
        assert!(matches!(result, Err(CheckpointError::Open { .. })));
    }
}
