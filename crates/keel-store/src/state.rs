use crate::backend::{decode_document, encode_document, Backend};
use crate::change::{Change, EdgeKind, TaskSet};
use crate::data::DataBag;
use crate::status::{derive_change_status, Status};
use crate::task::Task;
use crate::types::{ChangeId, TaskId};
use crate::StoreError;
use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateData {
    #[serde(default, skip_serializing_if = "DataBag::is_empty")]
    data: DataBag,
    #[serde(default)]
    changes: BTreeMap<ChangeId, Change>,
    #[serde(default)]
    tasks: BTreeMap<TaskId, Task>,
    #[serde(default)]
    last_change_id: u64,
    #[serde(default)]
    last_task_id: u64,
    #[serde(skip)]
    modified: bool,
    #[serde(skip)]
    ready_signals: HashMap<ChangeId, watch::Sender<bool>>,
}

struct Inner {
    data: Mutex<StateData>,
    backend: Arc<dyn Backend>,
}

/// Shared handle to the state graph.
///
/// Cloning is cheap; every clone refers to the same graph and the same lock.
/// All reads and writes go through [`State::lock`].
#[derive(Clone)]
pub struct State {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State").finish_non_exhaustive()
    }
}

impl State {
    /// Create an empty state that checkpoints into `backend`.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::from_data(StateData::default(), backend)
    }

    /// Rehydrate a state from a document previously produced by a checkpoint.
    pub fn read_from(bytes: &[u8], backend: Arc<dyn Backend>) -> Result<Self, StoreError> {
        let value = decode_document(bytes)?;
        let data: StateData = serde_json::from_value(value)?;
        info!(
            "loaded state: {} changes, {} tasks",
            data.changes.len(),
            data.tasks.len()
        );
        Ok(Self::from_data(data, backend))
    }

    fn from_data(data: StateData, backend: Arc<dyn Backend>) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(data),
                backend,
            }),
        }
    }

    /// Acquire the global state lock.
    ///
    /// A handler that panicked while holding the lock does not make the state
    /// unusable; the guard is recovered from the poisoned mutex.
    pub fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            data: self
                .inner
                .data
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            backend: self.inner.backend.as_ref(),
        }
    }

    /// Persist the state if anything changed since the last checkpoint.
    /// Returns whether a document was written.
    pub fn checkpoint(&self) -> Result<bool, StoreError> {
        self.lock().checkpoint()
    }

    /// Ask the ensure loop to run no later than `within` from now.
    pub fn ensure_before(&self, within: Duration) {
        self.inner.backend.ensure_before(within);
    }
}

/// Completion signal for one change. Fires once, when the change becomes ready.
#[derive(Debug, Clone)]
pub struct ReadyWaiter {
    rx: watch::Receiver<bool>,
}

impl ReadyWaiter {
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the change is ready. Also returns if the change is pruned.
    pub async fn wait(mut self) {
        let _ = self.rx.wait_for(|ready| *ready).await;
    }
}

/// Outcome of [`StateGuard::prune`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub removed_changes: Vec<ChangeId>,
    pub aborted_changes: Vec<ChangeId>,
    pub removed_tasks: usize,
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or_else(|_| TimeDelta::days(36_500))
}

/// Exclusive access to the state graph. Dropping the guard releases the lock.
pub struct StateGuard<'a> {
    data: MutexGuard<'a, StateData>,
    backend: &'a dyn Backend,
}

impl StateGuard<'_> {
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.data.data.get(key)
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        self.data.modified = true;
        self.data.data.set(key, value)
    }

    pub fn new_change(&mut self, kind: &str, summary: &str) -> ChangeId {
        self.data.last_change_id += 1;
        let id = ChangeId::from(self.data.last_change_id);
        let chg = Change::new(id.clone(), kind, summary, Utc::now());
        self.data.changes.insert(id.clone(), chg);
        self.data.modified = true;
        debug!("new change {id} ({kind}): {summary}");
        id
    }

    pub fn new_task(&mut self, kind: &str, summary: &str) -> TaskId {
        self.data.last_task_id += 1;
        let id = TaskId::from(self.data.last_task_id);
        let task = Task::new(id.clone(), kind, summary, Utc::now());
        self.data.tasks.insert(id.clone(), task);
        self.data.modified = true;
        id
    }

    /// Attach `task` to `change`. A task belongs to exactly one change.
    pub fn add_task(&mut self, change: &ChangeId, task: &TaskId) -> Result<(), StoreError> {
        if !self.data.changes.contains_key(change) {
            return Err(StoreError::ChangeNotFound(change.to_string()));
        }
        if self.is_change_ready(change) {
            return Err(StoreError::ChangeReady(change.to_string()));
        }
        let t = self
            .data
            .tasks
            .get_mut(task)
            .ok_or_else(|| StoreError::TaskNotFound(task.to_string()))?;
        match t.change() {
            Some(existing) if existing == change => return Ok(()),
            Some(existing) => {
                return Err(StoreError::TaskAttached {
                    task: task.to_string(),
                    change: existing.to_string(),
                })
            }
            None => t.set_change(change.clone()),
        }
        if let Some(chg) = self.data.changes.get_mut(change) {
            chg.push_task(task.clone());
        }
        self.data.modified = true;
        Ok(())
    }

    /// Attach every task of `set` to `change` and record the set's edges on it.
    pub fn add_all(&mut self, change: &ChangeId, set: &TaskSet) -> Result<(), StoreError> {
        for task in set.tasks() {
            self.add_task(change, task)?;
        }
        if let Some(chg) = self.data.changes.get_mut(change) {
            for (edge, task) in set.edges() {
                chg.set_edge(edge, task.clone());
            }
        }
        Ok(())
    }

    /// Make `task` wait for `predecessor`.
    ///
    /// # Panics
    ///
    /// Panics if the new edge would create a dependency cycle; callers build
    /// task graphs, so a cycle is a defect in the caller.
    pub fn wait_for(&mut self, task: &TaskId, predecessor: &TaskId) -> Result<(), StoreError> {
        for id in [task, predecessor] {
            if !self.data.tasks.contains_key(id) {
                return Err(StoreError::TaskNotFound(id.to_string()));
            }
        }
        assert!(
            task != predecessor && !self.waits_on(predecessor, task),
            "cannot make task {task} wait for {predecessor}: dependency cycle"
        );
        if let Some(t) = self.data.tasks.get_mut(task) {
            t.add_wait(predecessor.clone());
        }
        if let Some(p) = self.data.tasks.get_mut(predecessor) {
            p.add_halt(task.clone());
        }
        self.data.modified = true;
        Ok(())
    }

    /// Make every task in `set` wait for every task in `predecessors`.
    pub fn wait_all(&mut self, set: &TaskSet, predecessors: &TaskSet) -> Result<(), StoreError> {
        for task in set.tasks() {
            for pred in predecessors.tasks() {
                self.wait_for(task, pred)?;
            }
        }
        Ok(())
    }

    /// Whether `from` transitively waits for `target`.
    fn waits_on(&self, from: &TaskId, target: &TaskId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from.clone()];
        while let Some(id) = stack.pop() {
            if &id == target {
                return true;
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(t) = self.data.tasks.get(&id) {
                stack.extend(t.wait_tasks().iter().cloned());
            }
        }
        false
    }

    pub fn change(&self, id: &ChangeId) -> Option<&Change> {
        self.data.changes.get(id)
    }

    pub fn change_mut(&mut self, id: &ChangeId) -> Option<&mut Change> {
        self.data.modified = true;
        self.data.changes.get_mut(id)
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.data.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.data.modified = true;
        self.data.tasks.get_mut(id)
    }

    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.data.changes.values()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.data.tasks.values()
    }

    pub fn change_tasks(&self, id: &ChangeId) -> Vec<&Task> {
        self.data
            .changes
            .get(id)
            .map(|chg| {
                chg.task_ids()
                    .iter()
                    .filter_map(|t| self.data.tasks.get(t))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn change_status(&self, id: &ChangeId) -> Option<Status> {
        let chg = self.data.changes.get(id)?;
        let statuses = chg
            .task_ids()
            .iter()
            .filter_map(|t| self.data.tasks.get(t))
            .map(Task::status);
        Some(derive_change_status(statuses, chg.failure().is_some()))
    }

    pub fn is_change_ready(&self, id: &ChangeId) -> bool {
        self.change_status(id).is_some_and(Status::is_ready)
    }

    /// Human-readable failure report for a change in `Error`, `None` otherwise.
    pub fn change_err(&self, id: &ChangeId) -> Option<String> {
        if self.change_status(id)? != Status::Error {
            return None;
        }
        let chg = self.data.changes.get(id)?;
        let mut lines = Vec::new();
        if let Some(failure) = chg.failure() {
            lines.push(format!("- {} ({failure})", chg.summary()));
        }
        for task in self.change_tasks(id) {
            if task.status() == Status::Error {
                let reason = task.last_error().unwrap_or("unknown error");
                lines.push(format!("- {} ({reason})", task.summary()));
            }
        }
        Some(format!(
            "cannot perform the following tasks:\n{}",
            lines.join("\n")
        ))
    }

    /// True when a failed change kept some completed work because it could not
    /// be undone; such changes need an operator to resolve them.
    pub fn rollback_halted(&self, id: &ChangeId) -> bool {
        self.change_status(id) == Some(Status::Error)
            && self
                .change_tasks(id)
                .iter()
                .any(|t| t.status() == Status::Done)
    }

    /// Set a task's status and fire its change's ready signal if this made the
    /// change ready.
    ///
    /// This is the raw setter: it does not check the move against the task
    /// lifecycle and does not know whether a handler is running for the task.
    /// Outside the runner use it to seed or repair state and to park or
    /// release tasks with `Hold`. A running task moved elsewhere has its
    /// handler outcome discarded.
    pub fn set_task_status(&mut self, id: &TaskId, status: Status) -> Result<(), StoreError> {
        let now = Utc::now();
        let t = self
            .data
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))?;
        t.set_status(status, now);
        let change = t.change().cloned();
        self.data.modified = true;
        if let Some(change) = change {
            self.refresh_change(&change);
        }
        Ok(())
    }

    /// Record a change-level failure (e.g. a missed deadline) and refresh readiness.
    pub fn fail_change(&mut self, id: &ChangeId, message: &str) -> Result<(), StoreError> {
        let chg = self
            .data
            .changes
            .get_mut(id)
            .ok_or_else(|| StoreError::ChangeNotFound(id.to_string()))?;
        chg.set_failure(message);
        self.data.modified = true;
        self.refresh_change(id);
        Ok(())
    }

    fn refresh_change(&mut self, id: &ChangeId) {
        let ready = self.is_change_ready(id);
        let data = &mut *self.data;
        let Some(chg) = data.changes.get_mut(id) else {
            return;
        };
        if ready {
            if chg.ready_time().is_none() {
                chg.set_ready_time(Some(Utc::now()));
                debug!("change {id} is ready");
            }
            if let Some(signal) = data.ready_signals.get(id) {
                if !*signal.borrow() {
                    signal.send_replace(true);
                }
            }
        } else if chg.ready_time().is_some() {
            chg.set_ready_time(None);
        }
    }

    /// Stop a change: unstarted and running tasks are marked `Abort`, completed
    /// tasks `Undo`, unless the change's rollback was stopped, in which case
    /// completed tasks stay `Done`. Returns false if the change was already
    /// ready.
    pub fn abort_change(&mut self, id: &ChangeId) -> Result<bool, StoreError> {
        let Some(chg) = self.data.changes.get(id) else {
            return Err(StoreError::ChangeNotFound(id.to_string()));
        };
        let stopped = chg.rollback_stopped();
        if self.is_change_ready(id) {
            return Ok(false);
        }
        let now = Utc::now();
        let task_ids: Vec<TaskId> = self.data.changes[id].task_ids().to_vec();
        for tid in &task_ids {
            if let Some(t) = self.data.tasks.get_mut(tid) {
                let next = match t.status() {
                    Status::Do | Status::Hold | Status::Doing => Status::Abort,
                    Status::Done if !stopped => Status::Undo,
                    _ => continue,
                };
                t.set_status(next, now);
            }
        }
        self.data.modified = true;
        self.refresh_change(id);
        info!("change {id} aborted");
        Ok(true)
    }

    /// Mark the rollback of `id` as stopped after an undo failure. Later
    /// aborts of the change leave its completed tasks alone.
    pub fn stop_rollback(&mut self, id: &ChangeId) -> Result<(), StoreError> {
        let chg = self
            .data
            .changes
            .get_mut(id)
            .ok_or_else(|| StoreError::ChangeNotFound(id.to_string()))?;
        if !chg.rollback_stopped() {
            chg.set_rollback_stopped();
            self.data.modified = true;
        }
        Ok(())
    }

    pub fn is_rollback_stopped(&self, id: &ChangeId) -> bool {
        self.data
            .changes
            .get(id)
            .is_some_and(Change::rollback_stopped)
    }

    /// Completion signal for `id`, to be awaited after the lock is released.
    pub fn change_ready(&mut self, id: &ChangeId) -> Option<ReadyWaiter> {
        if !self.data.changes.contains_key(id) {
            return None;
        }
        let ready = self.is_change_ready(id);
        let signal = self
            .data
            .ready_signals
            .entry(id.clone())
            .or_insert_with(|| watch::channel(ready).0);
        Some(ReadyWaiter {
            rx: signal.subscribe(),
        })
    }

    pub fn change_edge(&self, id: &ChangeId, edge: EdgeKind) -> Option<&Task> {
        let tid = self.data.changes.get(id)?.edge(edge)?;
        self.data.tasks.get(tid)
    }

    /// Whether the task marked with `edge` has started executing. `None` if the
    /// change has no such edge.
    pub fn edge_crossed(&self, id: &ChangeId, edge: EdgeKind) -> Option<bool> {
        self.change_edge(id, edge)
            .map(|t| !matches!(t.status(), Status::Do | Status::Hold))
    }

    /// Drop old ready changes, abort changes stuck for too long, and cap the
    /// number of ready changes kept.
    pub fn prune(
        &mut self,
        now: DateTime<Utc>,
        prune_wait: Duration,
        abort_wait: Duration,
        max_ready_changes: usize,
    ) -> PruneReport {
        let prune_limit = now - to_delta(prune_wait);
        let abort_limit = now - to_delta(abort_wait);
        let mut report = PruneReport::default();

        let mut ready: Vec<(DateTime<Utc>, ChangeId)> = Vec::new();
        let mut expired: Vec<ChangeId> = Vec::new();
        let mut stale: Vec<ChangeId> = Vec::new();
        for chg in self.data.changes.values() {
            let status = self.change_status(chg.id()).unwrap_or_default();
            if status.is_ready() {
                let ready_at = chg.ready_time().unwrap_or(chg.spawn_time());
                if ready_at <= prune_limit {
                    expired.push(chg.id().clone());
                } else {
                    ready.push((ready_at, chg.id().clone()));
                }
            } else if chg.spawn_time() <= abort_limit
                && !matches!(status, Status::Undo | Status::Undoing)
            {
                stale.push(chg.id().clone());
            }
        }

        ready.sort();
        let over = ready.len().saturating_sub(max_ready_changes);
        expired.extend(ready.into_iter().take(over).map(|(_, id)| id));

        for id in stale {
            if matches!(self.abort_change(&id), Ok(true)) {
                info!("pruning: aborted change {id} stuck since before {abort_limit}");
                report.aborted_changes.push(id);
            }
        }

        for id in expired {
            report.removed_tasks += self.remove_change(&id);
            report.removed_changes.push(id);
        }

        let orphans: Vec<TaskId> = self
            .data
            .tasks
            .values()
            .filter(|t| t.change().is_none() && t.spawn_time() <= prune_limit)
            .map(|t| t.id().clone())
            .collect();
        for tid in &orphans {
            self.remove_task(tid);
        }
        report.removed_tasks += orphans.len();

        if !report.removed_changes.is_empty() || report.removed_tasks > 0 {
            self.data.modified = true;
            debug!(
                "pruned {} changes and {} tasks",
                report.removed_changes.len(),
                report.removed_tasks
            );
        }
        report
    }

    fn remove_change(&mut self, id: &ChangeId) -> usize {
        let Some(chg) = self.data.changes.remove(id) else {
            return 0;
        };
        self.data.ready_signals.remove(id);
        for tid in chg.task_ids() {
            self.remove_task(tid);
        }
        chg.task_ids().len()
    }

    fn remove_task(&mut self, id: &TaskId) {
        let Some(task) = self.data.tasks.remove(id) else {
            return;
        };
        for other in task.wait_tasks().iter().chain(task.halt_tasks()) {
            if let Some(t) = self.data.tasks.get_mut(other) {
                t.drop_links_to(id);
            }
        }
    }

    /// Referential problems in the graph: links to missing tasks, one-sided
    /// wait/halt links, and tasks and changes that disagree on membership.
    pub fn check_consistency(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for chg in self.data.changes.values() {
            for tid in chg.task_ids() {
                match self.data.tasks.get(tid) {
                    None => problems.push(format!("change {} lists missing task {tid}", chg.id())),
                    Some(t) if t.change() != Some(chg.id()) => problems.push(format!(
                        "change {} lists task {tid} that belongs elsewhere",
                        chg.id()
                    )),
                    Some(_) => {}
                }
            }
        }
        for task in self.data.tasks.values() {
            let id = task.id();
            if let Some(chg) = task.change() {
                let listed = self
                    .data
                    .changes
                    .get(chg)
                    .is_some_and(|c| c.task_ids().contains(id));
                if !listed {
                    problems.push(format!("task {id} claims change {chg} which does not list it"));
                }
            }
            for w in task.wait_tasks() {
                let mirrored = self
                    .data
                    .tasks
                    .get(w)
                    .is_some_and(|p| p.halt_tasks().contains(id));
                if !mirrored {
                    problems.push(format!("task {id} waits for {w} without a matching halt link"));
                }
            }
            for h in task.halt_tasks() {
                let mirrored = self
                    .data
                    .tasks
                    .get(h)
                    .is_some_and(|s| s.wait_tasks().contains(id));
                if !mirrored {
                    problems.push(format!("task {id} halts {h} without a matching wait link"));
                }
            }
        }
        problems
    }

    /// Serialize the whole graph into a checkpoint document.
    pub fn serialize(&self) -> Result<Vec<u8>, StoreError> {
        let value = serde_json::to_value(&*self.data)?;
        encode_document(value)
    }

    pub fn is_modified(&self) -> bool {
        self.data.modified
    }

    /// Write the state to the backend if modified. On failure the state stays
    /// marked modified so the next checkpoint retries.
    pub fn checkpoint(&mut self) -> Result<bool, StoreError> {
        if !self.data.modified {
            return Ok(false);
        }
        let bytes = self.serialize()?;
        self.backend.checkpoint(&bytes)?;
        self.data.modified = false;
        Ok(true)
    }

    pub fn ensure_before(&self, within: Duration) {
        self.backend.ensure_before(within);
    }
}
