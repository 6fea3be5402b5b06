//! Orchestration engine for Keel: runs the task graphs held in `keel-store`.
//!
//! The `TaskRunner` dispatches ready tasks to registered handlers on a bounded
//! pool of workers and drives rollback when a change fails. The `EnsureLoop`
//! wakes periodically, or early on request, to run state managers, prune old
//! changes, advance the runner, and checkpoint. `Engine` ties these together
//! over an on-disk state root guarded by an exclusive process lock.

pub mod concurrency;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod ensure;
pub mod handler;
pub mod lifecycle;
pub mod runner;

pub use concurrency::StateLock;
pub use config::EngineConfig;
pub use conflict::{
    check_change_conflict, check_change_conflict_many, set_resource, ConflictChecker,
    ConflictError, RESOURCE_KEY,
};
pub use engine::Engine;
pub use ensure::{EnsureHandle, EnsureLoop, StateManager};
pub use handler::{HandlerError, HandlerFn, HandlerRegistry, TaskContext};
pub use lifecycle::validate_transition;
pub use runner::TaskRunner;

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("store error: {0}")]
    Store(#[from] keel_store::StoreError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error("invalid task status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("state manager {name} failed: {reason}")]
    Manager { name: String, reason: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("state at {0} is locked by another process")]
    Locked(String),
    #[error("changes did not settle within {0:?}")]
    SettleTimeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
