//! Dispatches ready tasks to their handlers and drives rollback.
//!
//! Each call to [`TaskRunner::ensure`] is one tick: it looks at the whole
//! graph under the state lock, settles what can be settled without running
//! anything (aborted tasks that never started, tasks that cannot be undone),
//! and spawns a worker for every task whose handler may run now, up to the
//! worker limit. Workers record their outcome under the state lock and ask
//! for another tick.

use crate::handler::{HandlerError, HandlerFn, HandlerRegistry, TaskContext};
use crate::lifecycle::validate_transition;
use crate::CoreError;
use chrono::{DateTime, TimeDelta, Utc};
use keel_store::{ChangeId, State, StateGuard, Status, StoreError, Task, TaskId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type RunningMap = HashMap<TaskId, CancellationToken>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Move a task to `to`, rejecting moves the task state machine forbids.
fn transition(g: &mut StateGuard<'_>, id: &TaskId, to: Status) -> Result<(), CoreError> {
    let from = g
        .task(id)
        .map(Task::status)
        .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))?;
    validate_transition(from, to)?;
    g.set_task_status(id, to)?;
    debug!("task {id}: {from} -> {to}");
    Ok(())
}

/// Mark a task failed. A failed do handler aborts its change; a failed undo
/// handler stops the rollback of its change where it is.
fn fail_task(
    g: &mut StateGuard<'_>,
    id: &TaskId,
    undo: bool,
    message: &str,
) -> Result<(), CoreError> {
    let change = g.task(id).and_then(|t| t.change().cloned());
    if let Some(t) = g.task_mut(id) {
        t.log_error(message);
    }
    transition(g, id, Status::Error)?;
    let Some(change) = change else {
        return Ok(());
    };
    if undo {
        g.stop_rollback(&change)?;
        let pending: Vec<TaskId> = g
            .change_tasks(&change)
            .iter()
            .filter(|t| t.status() == Status::Undo)
            .map(|t| t.id().clone())
            .collect();
        for tid in pending {
            if let Some(t) = g.task_mut(&tid) {
                t.log(format!("rollback stopped: undo of task {id} failed"));
            }
            transition(g, &tid, Status::Done)?;
        }
        error!("change {change}: undo of task {id} failed, rollback stopped: {message}");
    } else {
        warn!("change {change}: task {id} failed: {message}");
        g.abort_change(&change)?;
    }
    Ok(())
}

/// Record what a handler returned.
fn record_outcome(
    g: &mut StateGuard<'_>,
    id: &TaskId,
    undo: bool,
    reversible: bool,
    stopping: bool,
    outcome: Result<(), HandlerError>,
) -> Result<(), CoreError> {
    let Some(status) = g.task(id).map(Task::status) else {
        debug!("task {id} was removed while running");
        return Ok(());
    };
    if !matches!(status, Status::Doing | Status::Undoing | Status::Abort) {
        debug!("task {id} moved to {status} while running; outcome discarded");
        return Ok(());
    }
    let aborted = status == Status::Abort;
    let stopped = g
        .task(id)
        .and_then(Task::change)
        .is_some_and(|c| g.is_rollback_stopped(c));

    match outcome {
        Ok(()) if undo => transition(g, id, Status::Undone),
        Ok(()) if aborted && reversible && !stopped => {
            if let Some(t) = g.task_mut(id) {
                t.log("completed after abort; undoing");
            }
            transition(g, id, Status::Undo)
        }
        Ok(()) if aborted => {
            if let Some(t) = g.task_mut(id) {
                t.log("completed after abort; not undone");
            }
            transition(g, id, Status::Done)
        }
        Ok(()) => transition(g, id, Status::Done),
        Err(HandlerError::Cancelled | HandlerError::Retry { .. }) if aborted => {
            transition(g, id, Status::Undone)
        }
        Err(HandlerError::Cancelled) if stopping => {
            debug!("task {id} interrupted by shutdown; it will run again");
            Ok(())
        }
        Err(HandlerError::Retry { after, reason }) => {
            let delay = TimeDelta::from_std(after).unwrap_or_else(|_| TimeDelta::days(36_500));
            let at = Utc::now() + delay;
            if let Some(t) = g.task_mut(id) {
                t.log(format!("will retry in {after:?}: {reason}"));
                t.set_at(Some(at));
            }
            let back = if undo { Status::Undo } else { Status::Do };
            transition(g, id, back)?;
            g.ensure_before(after);
            Ok(())
        }
        Err(e) => fail_task(g, id, undo, &e.to_string()),
    }
}

/// A state change the runner can make without running a handler.
#[derive(Debug)]
enum Settle {
    /// Aborted before its handler ran.
    Unstarted(TaskId),
    /// Cannot be undone; stays `Done`.
    KeepDone(TaskId, String),
    /// No handler registered for the kind.
    NoHandler(TaskId, String),
}

#[derive(Debug)]
struct Run {
    task: TaskId,
    change: Option<ChangeId>,
    kind: String,
    undo: bool,
}

#[derive(Debug, Default)]
struct Plan {
    settle: Vec<Settle>,
    runs: Vec<Run>,
    wake: Option<DateTime<Utc>>,
}

impl Plan {
    fn wake_at(&mut self, at: DateTime<Utc>) {
        self.wake = Some(self.wake.map_or(at, |w| w.min(at)));
    }
}

/// What blocks the undo of a task: successors in the same change that are
/// still moving, or one that was kept `Done`.
fn undo_gate(g: &StateGuard<'_>, task: &Task, running: &RunningMap) -> (bool, Option<TaskId>) {
    let mut blocked = false;
    let mut kept = None;
    for h in task.halt_tasks() {
        let Some(succ) = g.task(h) else { continue };
        if succ.change() != task.change() {
            continue;
        }
        if running.contains_key(h) {
            blocked = true;
            continue;
        }
        match succ.status() {
            Status::Done => kept = Some(h.clone()),
            Status::Do | Status::Doing | Status::Undo | Status::Undoing | Status::Abort => {
                blocked = true;
            }
            Status::Hold | Status::Undone | Status::Error => {}
        }
    }
    (blocked, kept)
}

fn plan_tick(
    g: &StateGuard<'_>,
    handlers: &HandlerRegistry,
    running: &RunningMap,
    now: DateTime<Utc>,
) -> Plan {
    let mut plan = Plan::default();

    for chg in g.changes() {
        if let Some(deadline) = chg.deadline() {
            if deadline > now && !g.is_change_ready(chg.id()) {
                plan.wake_at(deadline);
            }
        }
    }

    for task in g.tasks() {
        let id = task.id();
        if running.contains_key(id) {
            continue;
        }
        let deferred = task.at().filter(|at| *at > now);
        match task.status() {
            Status::Abort => plan.settle.push(Settle::Unstarted(id.clone())),
            Status::Do | Status::Doing => {
                let preds_done = task
                    .wait_tasks()
                    .iter()
                    .all(|w| g.task(w).is_some_and(|p| p.status() == Status::Done));
                if !preds_done {
                    continue;
                }
                if let Some(at) = deferred {
                    plan.wake_at(at);
                    continue;
                }
                if !handlers.contains(task.kind()) {
                    plan.settle.push(Settle::NoHandler(
                        id.clone(),
                        format!("internal error: no handler for task kind {:?}", task.kind()),
                    ));
                    continue;
                }
                plan.runs.push(Run {
                    task: id.clone(),
                    change: task.change().cloned(),
                    kind: task.kind().to_owned(),
                    undo: false,
                });
            }
            Status::Undo | Status::Undoing => {
                if task.status() == Status::Undo && !handlers.has_undo(task.kind()) {
                    plan.settle.push(Settle::KeepDone(
                        id.clone(),
                        format!(
                            "task kind {:?} cannot be undone; keeping its effects",
                            task.kind()
                        ),
                    ));
                    continue;
                }
                let (blocked, kept) = undo_gate(g, task, running);
                if blocked {
                    continue;
                }
                if let Some(kept) = kept.filter(|_| task.status() == Status::Undo) {
                    plan.settle.push(Settle::KeepDone(
                        id.clone(),
                        format!("not undone: task {kept} that depends on it was kept"),
                    ));
                    continue;
                }
                if let Some(at) = deferred {
                    plan.wake_at(at);
                    continue;
                }
                plan.runs.push(Run {
                    task: id.clone(),
                    change: task.change().cloned(),
                    kind: task.kind().to_owned(),
                    undo: true,
                });
            }
            Status::Hold | Status::Done | Status::Undone | Status::Error => {}
        }
    }
    plan
}

pub struct TaskRunner {
    state: State,
    handlers: RwLock<HandlerRegistry>,
    max_workers: usize,
    running: Arc<Mutex<RunningMap>>,
    workers: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
}

impl TaskRunner {
    pub fn new(state: State, max_workers: usize) -> Self {
        Self {
            state,
            handlers: RwLock::new(HandlerRegistry::new()),
            max_workers: max_workers.max(1),
            running: Arc::new(Mutex::new(HashMap::new())),
            workers: Mutex::new(JoinSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Register handlers. Kinds should be registered before the first tick.
    pub fn handlers_mut(&self) -> RwLockWriteGuard<'_, HandlerRegistry> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Number of handlers currently running.
    pub fn running(&self) -> usize {
        lock(&self.running).len()
    }

    pub fn is_running(&self, task: &TaskId) -> bool {
        lock(&self.running).contains_key(task)
    }

    /// Run one tick. Must be called from within a tokio runtime.
    pub fn ensure(&self) -> Result<(), CoreError> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.reap();

        let now = Utc::now();
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut guard = self.state.lock();
        expire_deadlines(&mut guard, now)?;

        let mut running = lock(&self.running);
        for (id, token) in running.iter() {
            if !token.is_cancelled() && guard.task(id).is_some_and(|t| t.status() == Status::Abort) {
                debug!("cancelling running task {id}");
                token.cancel();
            }
        }

        let plan = loop {
            let plan = plan_tick(&guard, &handlers, &running, now);
            if plan.settle.is_empty() {
                break plan;
            }
            for step in plan.settle {
                apply_settle(&mut guard, step)?;
            }
        };

        let capacity = self.max_workers.saturating_sub(running.len());
        if plan.runs.len() > capacity {
            debug!(
                "{} tasks ready, {capacity} worker slots free",
                plan.runs.len()
            );
        }
        let mut workers = lock(&self.workers);
        for run in plan.runs.into_iter().take(capacity) {
            let handler = if run.undo {
                handlers.undo_handler(&run.kind)
            } else {
                handlers.do_handler(&run.kind)
            };
            let Some(handler) = handler else { continue };
            let next = if run.undo { Status::Undoing } else { Status::Doing };
            transition(&mut guard, &run.task, next)?;
            if let Some(t) = guard.task_mut(&run.task) {
                t.set_at(None);
            }

            let token = self.shutdown.child_token();
            running.insert(run.task.clone(), token.clone());
            debug!(
                "dispatching {} handler for task {} ({})",
                if run.undo { "undo" } else { "do" },
                run.task,
                run.kind
            );
            let job = Job {
                state: self.state.clone(),
                running: Arc::clone(&self.running),
                shutdown: self.shutdown.clone(),
                ctx: TaskContext::new(self.state.clone(), run.task, run.change, token),
                handler,
                undo: run.undo,
                reversible: handlers.has_undo(&run.kind),
            };
            workers.spawn(job.run());
        }

        if let Some(at) = plan.wake {
            guard.ensure_before((at - now).to_std().unwrap_or_default());
        }
        Ok(())
    }

    fn reap(&self) {
        let mut workers = lock(&self.workers);
        while let Some(res) = workers.try_join_next() {
            if let Err(e) = res {
                warn!("task worker failed: {e}");
            }
        }
    }

    /// Wait for every spawned worker, including ones spawned while waiting.
    pub async fn join_workers(&self) {
        loop {
            let mut set = std::mem::take(&mut *lock(&self.workers));
            if set.is_empty() {
                return;
            }
            while let Some(res) = set.join_next().await {
                if let Err(e) = res {
                    warn!("task worker failed: {e}");
                }
            }
        }
    }

    /// Cancel every running handler and wait for all workers. Interrupted
    /// tasks keep their running status and are dispatched again by the next
    /// runner over the same state.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.join_workers().await;
        info!("task runner stopped");
    }
}

fn expire_deadlines(g: &mut StateGuard<'_>, now: DateTime<Utc>) -> Result<(), CoreError> {
    let expired: Vec<(ChangeId, String)> = g
        .changes()
        .filter(|c| c.deadline().is_some_and(|d| d <= now) && c.failure().is_none())
        .filter(|c| !g.is_change_ready(c.id()))
        .map(|c| (c.id().clone(), c.summary().to_owned()))
        .collect();
    for (id, summary) in expired {
        let message = format!("change {id} ({summary}) taking too long");
        warn!("{message}");
        g.fail_change(&id, &message)?;
        g.abort_change(&id)?;
    }
    Ok(())
}

fn apply_settle(g: &mut StateGuard<'_>, step: Settle) -> Result<(), CoreError> {
    match step {
        Settle::Unstarted(id) => transition(g, &id, Status::Undone),
        Settle::KeepDone(id, reason) => {
            info!("task {id}: {reason}");
            if let Some(t) = g.task_mut(&id) {
                t.log(reason);
            }
            transition(g, &id, Status::Done)
        }
        Settle::NoHandler(id, message) => {
            error!("task {id}: {message}");
            fail_task(g, &id, false, &message)
        }
    }
}

struct Job {
    state: State,
    running: Arc<Mutex<RunningMap>>,
    shutdown: CancellationToken,
    ctx: TaskContext,
    handler: HandlerFn,
    undo: bool,
    reversible: bool,
}

/// Frees a task's running slot and asks for another tick when dropped, so a
/// worker that unwinds still releases its task.
struct RunningSlot {
    id: TaskId,
    running: Arc<Mutex<RunningMap>>,
    state: State,
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        lock(&self.running).remove(&self.id);
        self.state.ensure_before(Duration::ZERO);
    }
}

impl Job {
    async fn run(self) {
        let id = self.ctx.task_id().clone();
        let _slot = RunningSlot {
            id: id.clone(),
            running: Arc::clone(&self.running),
            state: self.state.clone(),
        };
        let outcome = match tokio::spawn((self.handler)(self.ctx)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(HandlerError::failed("handler panicked")),
            Err(_) => Err(HandlerError::Cancelled),
        };
        {
            let mut guard = self.state.lock();
            let stopping = self.shutdown.is_cancelled();
            if let Err(e) =
                record_outcome(&mut guard, &id, self.undo, self.reversible, stopping, outcome)
            {
                error!("task {id}: cannot record handler outcome: {e}");
            }
        }
    }
}
