use serde::{Deserialize, Serialize};

/// Execution status shared by tasks and (derived) by changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Status {
    /// Parked: not eligible to run until a caller releases it.
    Hold,
    /// Waiting to run the do handler.
    #[default]
    Do,
    /// Do handler is running.
    Doing,
    /// Do handler completed successfully.
    Done,
    /// Execution was cut short by a sibling failure or an explicit abort.
    Abort,
    /// Waiting to run the undo handler.
    Undo,
    /// Undo handler is running.
    Undoing,
    /// Undo handler completed, or the task never ran.
    Undone,
    /// A handler failed.
    Error,
}

impl Status {
    pub const ALL: [Status; 9] = [
        Status::Hold,
        Status::Do,
        Status::Doing,
        Status::Done,
        Status::Abort,
        Status::Undo,
        Status::Undoing,
        Status::Undone,
        Status::Error,
    ];

    /// Terminal statuses. A change is ready once its derived status is one of these.
    pub fn is_ready(self) -> bool {
        matches!(self, Status::Done | Status::Undone | Status::Error)
    }

    /// Statuses in which a handler may be dispatched.
    pub fn is_runnable(self) -> bool {
        matches!(
            self,
            Status::Do | Status::Doing | Status::Undo | Status::Undoing
        )
    }

    /// True for statuses on the undo side of the state machine.
    pub fn is_undo_side(self) -> bool {
        matches!(self, Status::Undo | Status::Undoing)
    }

    pub fn parse(s: &str) -> Option<Self> {
        Status::ALL
            .into_iter()
            .find(|st| st.to_string().eq_ignore_ascii_case(s))
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Hold => write!(f, "Hold"),
            Status::Do => write!(f, "Do"),
            Status::Doing => write!(f, "Doing"),
            Status::Done => write!(f, "Done"),
            Status::Abort => write!(f, "Abort"),
            Status::Undo => write!(f, "Undo"),
            Status::Undoing => write!(f, "Undoing"),
            Status::Undone => write!(f, "Undone"),
            Status::Error => write!(f, "Error"),
        }
    }
}

/// Derive a change's status from the statuses of its tasks.
///
/// In-progress statuses win over terminal ones; among terminal statuses an
/// error (on a task, or `change_failed` for change-level failures such as a
/// missed deadline) wins over `Undone`, which wins over `Done`.
pub fn derive_change_status<I>(task_statuses: I, change_failed: bool) -> Status
where
    I: IntoIterator<Item = Status>,
{
    let mut counts = [0usize; 9];
    let mut total = 0usize;
    for st in task_statuses {
        counts[st as usize] += 1;
        total += 1;
    }
    if total == 0 {
        return if change_failed {
            Status::Error
        } else {
            Status::Hold
        };
    }
    let has = |st: Status| counts[st as usize] > 0;

    if has(Status::Doing) {
        Status::Doing
    } else if has(Status::Undoing) {
        Status::Undoing
    } else if has(Status::Abort) || has(Status::Undo) {
        Status::Undo
    } else if has(Status::Do) {
        Status::Do
    } else if has(Status::Hold) {
        Status::Hold
    } else if has(Status::Error) || change_failed {
        Status::Error
    } else if has(Status::Undone) {
        Status::Undone
    } else {
        Status::Done
    }
}
