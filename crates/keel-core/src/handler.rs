//! Handler registry and the invocation contract between the runner and
//! handler code.
//!
//! A task kind maps to a do handler and an optional undo handler. The kind
//! string is persisted with every task, so it is a durable contract: kinds are
//! registered once and never rebound.

use keel_store::{ChangeId, State, StoreError, Task, TaskId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How a handler invocation ended, when it did not succeed.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    /// Handler-requested retry: the task goes back to waiting and becomes
    /// eligible again after `after`.
    #[error("retry in {after:?}: {reason}")]
    Retry { after: Duration, reason: String },
    /// The handler observed its cancellation token and stopped early.
    #[error("cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn failed(msg: impl std::fmt::Display) -> Self {
        HandlerError::Failed(msg.to_string())
    }

    pub fn retry(after: Duration, reason: impl Into<String>) -> Self {
        HandlerError::Retry {
            after,
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        HandlerError::Failed(e.to_string())
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;
pub type HandlerFn = Arc<dyn Fn(TaskContext) -> HandlerFuture + Send + Sync>;

/// What a handler gets to work with: the shared state, the task it runs for,
/// and a token that is cancelled when the change is aborted or the engine
/// stops.
///
/// Handlers must not keep the state locked across long-running work; lock,
/// read or write the task, and drop the guard.
#[derive(Clone)]
pub struct TaskContext {
    state: State,
    task: TaskId,
    change: Option<ChangeId>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(
        state: State,
        task: TaskId,
        change: Option<ChangeId>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state,
            task,
            change,
            cancel,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task
    }

    pub fn change_id(&self) -> Option<&ChangeId> {
        self.change.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the task is asked to stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Run `f` on the task with the state lock held for just that call.
    pub fn with_task<R>(&self, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        let mut guard = self.state.lock();
        guard.task_mut(&self.task).map(f)
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        self.with_task(|t| t.log(message));
    }

    pub fn set_progress(&self, label: &str, done: u64, total: u64) {
        self.with_task(|t| t.set_progress(label, done, total));
    }
}

#[derive(Clone)]
struct HandlerPair {
    do_fn: HandlerFn,
    undo_fn: Option<HandlerFn>,
}

fn boxed<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Task kind -> (do, undo) handler table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerPair>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reversible task kind.
    ///
    /// # Panics
    ///
    /// Panics if `kind` is already registered.
    pub fn register<D, DF, U, UF>(&mut self, kind: &str, do_fn: D, undo_fn: U)
    where
        D: Fn(TaskContext) -> DF + Send + Sync + 'static,
        DF: Future<Output = Result<(), HandlerError>> + Send + 'static,
        U: Fn(TaskContext) -> UF + Send + Sync + 'static,
        UF: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.insert(kind, boxed(do_fn), Some(boxed(undo_fn)));
    }

    /// Register a task kind whose effects cannot be undone. During rollback
    /// such tasks stay `Done` and stop the rollback of everything before them.
    ///
    /// # Panics
    ///
    /// Panics if `kind` is already registered.
    pub fn register_irreversible<D, DF>(&mut self, kind: &str, do_fn: D)
    where
        D: Fn(TaskContext) -> DF + Send + Sync + 'static,
        DF: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.insert(kind, boxed(do_fn), None);
    }

    fn insert(&mut self, kind: &str, do_fn: HandlerFn, undo_fn: Option<HandlerFn>) {
        assert!(
            !self.handlers.contains_key(kind),
            "handler for task kind {kind:?} registered twice"
        );
        self.handlers
            .insert(kind.to_owned(), HandlerPair { do_fn, undo_fn });
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn has_undo(&self, kind: &str) -> bool {
        self.handlers
            .get(kind)
            .is_some_and(|h| h.undo_fn.is_some())
    }

    pub fn do_handler(&self, kind: &str) -> Option<HandlerFn> {
        self.handlers.get(kind).map(|h| h.do_fn.clone())
    }

    pub fn undo_handler(&self, kind: &str) -> Option<HandlerFn> {
        self.handlers.get(kind).and_then(|h| h.undo_fn.clone())
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
