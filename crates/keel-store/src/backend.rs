use crate::layout::StoreLayout;
use crate::{fsync_dir, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::debug;

/// Current state document format. Incremented on incompatible changes.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Where the state graph goes when it is checkpointed, and who to wake when
/// someone asks for an early ensure pass.
pub trait Backend: Send + Sync {
    /// Durably store a serialized state document.
    fn checkpoint(&self, data: &[u8]) -> Result<(), StoreError>;

    /// Ask the ensure loop to run no later than `within` from now.
    fn ensure_before(&self, within: Duration) {
        let _ = within;
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    format_version: u32,
    checksum: String,
    state: Value,
}

fn payload_checksum(state: &Value) -> Result<String, StoreError> {
    let canonical = serde_json::to_vec(state)?;
    Ok(blake3::hash(&canonical).to_hex().to_string())
}

/// Wrap a serialized state in a versioned, checksummed document.
pub(crate) fn encode_document(state: Value) -> Result<Vec<u8>, StoreError> {
    let doc = StateDocument {
        format_version: STATE_FORMAT_VERSION,
        checksum: payload_checksum(&state)?,
        state,
    };
    Ok(serde_json::to_vec_pretty(&doc)?)
}

/// Unwrap a state document, verifying its version and checksum.
pub(crate) fn decode_document(bytes: &[u8]) -> Result<Value, StoreError> {
    let doc: StateDocument = serde_json::from_slice(bytes)?;
    if doc.format_version != STATE_FORMAT_VERSION {
        return Err(StoreError::VersionMismatch {
            expected: STATE_FORMAT_VERSION,
            found: doc.format_version,
        });
    }
    let actual = payload_checksum(&doc.state)?;
    if actual != doc.checksum {
        return Err(StoreError::IntegrityFailure {
            expected: doc.checksum,
            actual,
        });
    }
    Ok(doc.state)
}

/// Persists the state document to `<root>/state/state.json` with
/// write-temp-then-rename, so a crash leaves either the old or the new
/// document on disk, never a torn one.
#[derive(Debug, Clone)]
pub struct FileBackend {
    layout: StoreLayout,
}

impl FileBackend {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Read the last checkpoint, or `None` if nothing was ever written.
    pub fn read(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.layout.state_file();
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

impl Backend for FileBackend {
    fn checkpoint(&self, data: &[u8]) -> Result<(), StoreError> {
        let dir = self.layout.state_dir();
        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.layout.state_file())
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        debug!("checkpointed state ({} bytes)", data.len());
        Ok(())
    }
}

/// In-memory backend for ephemeral engines and tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    last: Mutex<Option<Vec<u8>>>,
    checkpoints: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.load(Ordering::SeqCst)
    }

    pub fn last_checkpoint(&self) -> Option<Vec<u8>> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Backend for MemoryBackend {
    fn checkpoint(&self, data: &[u8]) -> Result<(), StoreError> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(data.to_vec());
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
