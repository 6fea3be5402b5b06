use crate::data::DataBag;
use crate::status::Status;
use crate::types::{ChangeId, TaskId};
use crate::StoreError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Number of log entries kept per task; older entries are dropped.
pub const MAX_LOG_ENTRIES: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.time.to_rfc3339(), self.level, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Progress {
    pub label: String,
    pub done: u64,
    pub total: u64,
}

/// A single step of a change, bound to a handler kind.
///
/// Tasks are only reachable through a [`StateGuard`](crate::StateGuard), so every
/// accessor here runs with the state lock held.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    id: TaskId,
    kind: String,
    summary: String,
    status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    change: Option<ChangeId>,
    #[serde(default, skip_serializing_if = "DataBag::is_empty")]
    data: DataBag,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    wait_tasks: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    halt_tasks: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    log: Vec<LogEntry>,
    spawn_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ready_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    at: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn new(id: TaskId, kind: &str, summary: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: kind.to_owned(),
            summary: summary.to_owned(),
            status: Status::Do,
            change: None,
            data: DataBag::new(),
            wait_tasks: Vec::new(),
            halt_tasks: Vec::new(),
            progress: None,
            log: Vec::new(),
            spawn_time: now,
            ready_time: None,
            at: None,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn change(&self) -> Option<&ChangeId> {
        self.change.as_ref()
    }

    /// Tasks this task waits for.
    pub fn wait_tasks(&self) -> &[TaskId] {
        &self.wait_tasks
    }

    /// Tasks waiting for this task.
    pub fn halt_tasks(&self) -> &[TaskId] {
        &self.halt_tasks
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.data.get(key)
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        self.data.set(key, value)
    }

    pub fn data(&self) -> &DataBag {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut DataBag {
        &mut self.data
    }

    pub fn log(&mut self, message: impl Into<String>) {
        self.push_log(LogLevel::Info, message.into());
    }

    pub fn log_error(&mut self, message: impl Into<String>) {
        self.push_log(LogLevel::Error, message.into());
    }

    fn push_log(&mut self, level: LogLevel, message: String) {
        self.log.push(LogEntry {
            time: Utc::now(),
            level,
            message,
        });
        if self.log.len() > MAX_LOG_ENTRIES {
            let excess = self.log.len() - MAX_LOG_ENTRIES;
            self.log.drain(..excess);
        }
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.log
    }

    /// Most recent error message logged on this task.
    pub fn last_error(&self) -> Option<&str> {
        self.log
            .iter()
            .rev()
            .find(|e| e.level == LogLevel::Error)
            .map(|e| e.message.as_str())
    }

    pub fn set_progress(&mut self, label: &str, done: u64, total: u64) {
        self.progress = Some(Progress {
            label: label.to_owned(),
            done,
            total,
        });
    }

    pub fn progress(&self) -> Option<&Progress> {
        self.progress.as_ref()
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    pub fn ready_time(&self) -> Option<DateTime<Utc>> {
        self.ready_time
    }

    /// Earliest time the task may be dispatched, if deferred.
    pub fn at(&self) -> Option<DateTime<Utc>> {
        self.at
    }

    pub fn set_at(&mut self, at: Option<DateTime<Utc>>) {
        self.at = at;
    }

    pub(crate) fn set_status(&mut self, status: Status, now: DateTime<Utc>) {
        self.status = status;
        if status.is_ready() {
            self.ready_time = Some(now);
        } else {
            self.ready_time = None;
        }
    }

    pub(crate) fn set_change(&mut self, change: ChangeId) {
        self.change = Some(change);
    }

    pub(crate) fn add_wait(&mut self, id: TaskId) {
        if !self.wait_tasks.contains(&id) {
            self.wait_tasks.push(id);
        }
    }

    pub(crate) fn add_halt(&mut self, id: TaskId) {
        if !self.halt_tasks.contains(&id) {
            self.halt_tasks.push(id);
        }
    }

    pub(crate) fn drop_links_to(&mut self, id: &TaskId) {
        self.wait_tasks.retain(|t| t != id);
        self.halt_tasks.retain(|t| t != id);
    }
}
