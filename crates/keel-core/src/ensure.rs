//! The ensure loop: the single coordinating task that keeps the state moving.
//!
//! A pass runs every registered [`StateManager`], prunes old changes when a
//! prune is due, advances the [`TaskRunner`] by one tick, and checkpoints the
//! state. Passes happen at start, every `ensure_interval`, and earlier when
//! anything calls [`EnsureHandle::ensure_before`]. Early requests coalesce:
//! however many arrive before the loop wakes, they cause one pass.

use crate::config::EngineConfig;
use crate::runner::TaskRunner;
use crate::CoreError;
use chrono::Utc;
use keel_store::State;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wake-ups further out than this are clamped to it.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `within` from now, clamped so huge durations cannot overflow the clock.
pub(crate) fn instant_after(within: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(within.min(FAR_FUTURE)).unwrap_or(now)
}

/// A reconciliation callback run on every ensure pass.
pub trait StateManager: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "state manager"
    }

    fn ensure(&self) -> Result<(), CoreError>;
}

#[derive(Default)]
struct Wake {
    next: Mutex<Option<Instant>>,
    notify: Notify,
}

/// Shared wake-up schedule of the ensure loop.
#[derive(Clone, Default)]
pub struct EnsureHandle {
    wake: Arc<Wake>,
}

impl std::fmt::Debug for EnsureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnsureHandle")
            .field("next", &self.next_wake())
            .finish()
    }
}

impl EnsureHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a pass no later than `within` from now. A request for a later
    /// time than one already pending is absorbed by it.
    pub fn ensure_before(&self, within: Duration) {
        let when = instant_after(within);
        let mut next = lock(&self.wake.next);
        if next.is_some_and(|n| n <= when) {
            return;
        }
        *next = Some(when);
        self.wake.notify.notify_one();
    }

    pub fn next_wake(&self) -> Option<Instant> {
        *lock(&self.wake.next)
    }

    fn clear(&self) {
        *lock(&self.wake.next) = None;
    }

    /// Sleep until a requested pass is due or `limit` is reached.
    pub async fn wait_until(&self, limit: Instant) {
        loop {
            let deadline = self.next_wake().map_or(limit, |n| n.min(limit));
            if deadline <= Instant::now() {
                return;
            }
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return,
                () = self.wake.notify.notified() => {}
            }
        }
    }
}

pub struct EnsureLoop {
    state: State,
    runner: Arc<TaskRunner>,
    handle: EnsureHandle,
    config: EngineConfig,
    managers: RwLock<Vec<Arc<dyn StateManager>>>,
    last_prune: Mutex<Instant>,
    passes: AtomicU64,
}

impl EnsureLoop {
    pub fn new(
        state: State,
        runner: Arc<TaskRunner>,
        handle: EnsureHandle,
        config: EngineConfig,
    ) -> Self {
        Self {
            state,
            runner,
            handle,
            config,
            managers: RwLock::new(Vec::new()),
            last_prune: Mutex::new(Instant::now()),
            passes: AtomicU64::new(0),
        }
    }

    pub fn add_manager(&self, manager: Arc<dyn StateManager>) {
        self.managers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(manager);
    }

    pub fn handle(&self) -> &EnsureHandle {
        &self.handle
    }

    /// Number of passes run so far.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    /// Run one pass. Manager failures are logged and do not stop the pass.
    pub fn tick(&self) -> Result<(), CoreError> {
        self.handle.clear();
        self.passes.fetch_add(1, Ordering::SeqCst);

        let managers = self
            .managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for manager in managers {
            if let Err(e) = manager.ensure() {
                warn!("{} failed: {e}", manager.name());
            }
        }

        self.maybe_prune();
        let advanced = self.runner.ensure();
        let checkpointed = self.state.checkpoint();
        advanced?;
        checkpointed?;
        Ok(())
    }

    fn maybe_prune(&self) {
        let mut last = lock(&self.last_prune);
        if last.elapsed() < self.config.prune_interval() {
            return;
        }
        *last = Instant::now();
        let report = self.state.lock().prune(
            Utc::now(),
            self.config.prune_wait(),
            self.config.abort_wait(),
            self.config.max_ready_changes,
        );
        if !report.removed_changes.is_empty() || !report.aborted_changes.is_empty() {
            info!(
                "pruned {} changes, aborted {}",
                report.removed_changes.len(),
                report.aborted_changes.len()
            );
        }
    }

    /// Run passes until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("ensure loop started");
        loop {
            if let Err(e) = self.tick() {
                error!("ensure pass failed: {e}");
            }
            let limit = instant_after(self.config.ensure_interval());
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = self.handle.wait_until(limit) => {}
            }
            debug!("ensure loop woke");
        }
        info!("ensure loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_store::{MemoryBackend, Status};
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    impl StateManager for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn ensure(&self) -> Result<(), CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CoreError::Manager {
                    name: "counting".to_owned(),
                    reason: "always fails".to_owned(),
                });
            }
            Ok(())
        }
    }

    fn ensure_loop(config: EngineConfig) -> (Arc<EnsureLoop>, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let state = State::new(backend.clone());
        let runner = Arc::new(TaskRunner::new(state.clone(), config.max_workers));
        let lp = EnsureLoop::new(state, runner, EnsureHandle::new(), config);
        (Arc::new(lp), backend)
    }

    fn counting(fail: bool) -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    #[test]
    fn later_request_is_absorbed_by_earlier_one() {
        let handle = EnsureHandle::new();
        handle.ensure_before(Duration::from_secs(5));
        let first = handle.next_wake().unwrap();
        handle.ensure_before(Duration::from_secs(60));
        assert_eq!(handle.next_wake(), Some(first));
        handle.ensure_before(Duration::ZERO);
        assert!(handle.next_wake().unwrap() < first);
    }

    #[test]
    fn huge_request_is_clamped() {
        let handle = EnsureHandle::new();
        handle.ensure_before(Duration::MAX);
        let far = handle.next_wake().unwrap();
        assert!(far > Instant::now() + Duration::from_secs(86_400 * 365));
        handle.ensure_before(Duration::from_secs(1));
        assert!(handle.next_wake().unwrap() < far);
    }

    #[tokio::test]
    async fn failing_manager_does_not_stop_the_pass() {
        let (lp, backend) = ensure_loop(EngineConfig::default());
        let bad = counting(true);
        let good = counting(false);
        lp.add_manager(bad.clone());
        lp.add_manager(good.clone());
        lp.state.lock().new_change("noop", "noop");
        lp.tick().unwrap();
        assert_eq!(bad.calls.load(Ordering::SeqCst), 1);
        assert_eq!(good.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.checkpoint_count(), 1);
    }

    #[tokio::test]
    async fn prune_runs_when_due() {
        let config = EngineConfig {
            prune_interval_secs: 0,
            prune_wait_secs: 0,
            ..EngineConfig::default()
        };
        let (lp, _) = ensure_loop(config);
        let chg = {
            let mut g = lp.state.lock();
            let chg = g.new_change("noop", "noop");
            let t = g.new_task("noop", "noop");
            g.add_task(&chg, &t).unwrap();
            g.set_task_status(&t, Status::Done).unwrap();
            chg
        };
        lp.tick().unwrap();
        assert!(lp.state.lock().change(&chg).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_before_requests_coalesce() {
        let (lp, _) = ensure_loop(EngineConfig::default());
        let manager = counting(false);
        lp.add_manager(manager.clone());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&lp).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.calls.load(Ordering::SeqCst), 1);

        for _ in 0..5 {
            lp.handle().ensure_before(Duration::from_secs(1));
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(manager.calls.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(lp.passes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_wakes_on_interval() {
        let config = EngineConfig {
            ensure_interval_secs: 60,
            ..EngineConfig::default()
        };
        let (lp, _) = ensure_loop(config);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&lp).run(shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(lp.passes(), 3);
        shutdown.cancel();
        task.await.unwrap();
    }
}
