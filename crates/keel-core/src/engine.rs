use crate::concurrency::StateLock;
use crate::config::EngineConfig;
use crate::conflict::{ConflictChecker, ConflictError};
use crate::ensure::{instant_after, EnsureHandle, EnsureLoop, StateManager};
use crate::handler::HandlerRegistry;
use crate::runner::TaskRunner;
use crate::CoreError;
use keel_store::{
    Backend, ChangeId, FileBackend, MemoryBackend, State, Status, StoreError, StoreLayout,
};
use std::path::Path;
use std::sync::{Arc, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Checkpoints through the wrapped backend and routes early-pass requests
/// to the engine's ensure loop.
struct EngineBackend {
    inner: Arc<dyn Backend>,
    handle: EnsureHandle,
}

impl Backend for EngineBackend {
    fn checkpoint(&self, data: &[u8]) -> Result<(), StoreError> {
        self.inner.checkpoint(data)
    }

    fn ensure_before(&self, within: Duration) {
        self.handle.ensure_before(within);
    }
}

pub struct Engine {
    layout: Option<StoreLayout>,
    config: EngineConfig,
    state: State,
    runner: Arc<TaskRunner>,
    ensure: Arc<EnsureLoop>,
    conflicts: ConflictChecker,
    shutdown: CancellationToken,
    loop_task: Option<JoinHandle<()>>,
    _lock: Option<StateLock>,
}

impl Engine {
    /// Open (or create) the state root at `root`, taking its exclusive lock
    /// and loading `keel.toml` and the last checkpoint.
    pub fn open(root: &Path) -> Result<Self, CoreError> {
        let layout = StoreLayout::new(root);
        layout.initialize()?;
        let lock = StateLock::try_acquire(&layout.lock_file())?
            .ok_or_else(|| CoreError::Locked(root.display().to_string()))?;
        let config = EngineConfig::load(&layout.config_file())?;

        let file = FileBackend::new(layout.clone());
        let existing = file.read()?;
        let handle = EnsureHandle::new();
        let backend: Arc<dyn Backend> = Arc::new(EngineBackend {
            inner: Arc::new(file),
            handle: handle.clone(),
        });
        let state = match existing {
            Some(bytes) => State::read_from(&bytes, backend)?,
            None => State::new(backend),
        };
        info!(
            "opened state root {} (lock {})",
            root.display(),
            lock.path().display()
        );
        Ok(Self::assemble(state, handle, config, Some(layout), Some(lock)))
    }

    /// Engine over a caller-provided backend, with no state root or lock.
    pub fn with_backend(backend: Arc<dyn Backend>, config: EngineConfig) -> Self {
        let handle = EnsureHandle::new();
        let backend: Arc<dyn Backend> = Arc::new(EngineBackend {
            inner: backend,
            handle: handle.clone(),
        });
        Self::assemble(State::new(backend), handle, config, None, None)
    }

    pub fn in_memory(config: EngineConfig) -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()), config)
    }

    fn assemble(
        state: State,
        handle: EnsureHandle,
        config: EngineConfig,
        layout: Option<StoreLayout>,
        lock: Option<StateLock>,
    ) -> Self {
        let runner = Arc::new(TaskRunner::new(state.clone(), config.max_workers));
        let ensure = Arc::new(EnsureLoop::new(
            state.clone(),
            Arc::clone(&runner),
            handle,
            config.clone(),
        ));
        Self {
            layout,
            config,
            state,
            runner,
            ensure,
            conflicts: ConflictChecker::new(),
            shutdown: CancellationToken::new(),
            loop_task: None,
            _lock: lock,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layout(&self) -> Option<&StoreLayout> {
        self.layout.as_ref()
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    /// Handler table. Register every task kind before [`Engine::start`].
    pub fn handlers_mut(&self) -> RwLockWriteGuard<'_, HandlerRegistry> {
        self.runner.handlers_mut()
    }

    pub fn add_manager(&self, manager: Arc<dyn StateManager>) {
        self.ensure.add_manager(manager);
    }

    pub fn conflicts_mut(&mut self) -> &mut ConflictChecker {
        &mut self.conflicts
    }

    /// Fail if a change in progress, other than `ignore`, operates on `resource`.
    pub fn check_change_conflict(
        &self,
        resource: &str,
        ignore: Option<&ChangeId>,
    ) -> Result<(), ConflictError> {
        let guard = self.state.lock();
        self.conflicts.check(&guard, &[resource], ignore)
    }

    pub fn ensure_before(&self, within: Duration) {
        self.ensure.handle().ensure_before(within);
    }

    /// Number of ensure passes run so far.
    pub fn passes(&self) -> u64 {
        self.ensure.passes()
    }

    /// Spawn the ensure loop. Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        if self.loop_task.is_some() {
            return;
        }
        let ensure = Arc::clone(&self.ensure);
        self.loop_task = Some(tokio::spawn(ensure.run(self.shutdown.clone())));
    }

    /// Stop the loop, cancel running handlers, wait for every worker, and
    /// write a final checkpoint.
    pub async fn stop(&mut self) -> Result<(), CoreError> {
        self.shutdown.cancel();
        if let Some(task) = self.loop_task.take() {
            if let Err(e) = task.await {
                warn!("ensure loop ended abnormally: {e}");
            }
        }
        self.runner.stop().await;
        self.state.checkpoint()?;
        Ok(())
    }

    /// Drive ensure passes until no change is in progress and no handler is
    /// running. Meant for callers that do not [`Engine::start`] the loop.
    pub async fn settle(&self, timeout: Duration) -> Result<(), CoreError> {
        let limit = instant_after(timeout);
        loop {
            self.ensure.tick()?;
            if !self.in_progress() {
                return Ok(());
            }
            if Instant::now() >= limit {
                return Err(CoreError::SettleTimeout(timeout));
            }
            self.ensure.handle().wait_until(limit).await;
        }
    }

    fn in_progress(&self) -> bool {
        if self.runner.running() > 0 {
            return true;
        }
        let guard = self.state.lock();
        let busy = guard.changes().any(|c| {
            guard
                .change_status(c.id())
                .is_some_and(|s| !s.is_ready() && s != Status::Hold)
        });
        drop(guard);
        busy
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
