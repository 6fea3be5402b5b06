//! State graph, change/task data model, and crash-safe persistence for Keel.
//!
//! This crate provides the storage layer of the orchestration engine: the
//! `State` graph of `Change`s and `Task`s guarded by a single lock, the task
//! status state machine, typed key/value payloads (`DataBag`), task sets with
//! edge markers, and the `Backend`s that checkpoint the whole graph as one
//! checksummed document written with write-temp-then-rename.

pub mod backend;
pub mod change;
pub mod data;
pub mod layout;
pub mod state;
pub mod status;
pub mod task;
pub mod types;

pub use backend::{Backend, FileBackend, MemoryBackend, STATE_FORMAT_VERSION};
pub use change::{
    Change, EdgeKind, TaskSet, BEGIN_EDGE, LAST_BEFORE_LOCAL_MODIFICATIONS_EDGE,
    MAYBE_REBOOT_EDGE,
};
pub use data::DataBag;
pub use layout::StoreLayout;
pub use state::{PruneReport, ReadyWaiter, State, StateGuard};
pub use status::{derive_change_status, Status};
pub use task::{LogEntry, LogLevel, Progress, Task, MAX_LOG_ENTRIES};
pub use types::{ChangeId, TaskId};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// POSIX does not guarantee a rename survives power loss until the parent
/// directory itself is synced.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("state checksum mismatch: expected {expected}, got {actual}")]
    IntegrityFailure { expected: String, actual: String },
    #[error("state format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("change not found: {0}")]
    ChangeNotFound(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("change {0} is already ready")]
    ChangeReady(String),
    #[error("task {task} already belongs to change {change}")]
    TaskAttached { task: String, change: String },
    #[error("invalid data under key '{key}': {reason}")]
    InvalidData { key: String, reason: String },
}
