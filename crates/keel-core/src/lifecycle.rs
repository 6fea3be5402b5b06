use crate::CoreError;
use keel_store::Status;

/// Check that a task may move from `from` to `to`.
///
/// Re-entering the same status is allowed: after a restart the runner
/// dispatches `Doing`/`Undoing` tasks again without an intermediate state.
pub fn validate_transition(from: Status, to: Status) -> Result<(), CoreError> {
    let valid = from == to
        || matches!(
            (from, to),
            (Status::Hold, Status::Do | Status::Abort)
                | (
                    Status::Do,
                    Status::Doing | Status::Hold | Status::Abort | Status::Error
                )
                | (
                    Status::Doing,
                    Status::Done | Status::Error | Status::Abort | Status::Do
                )
                | (Status::Done, Status::Undo)
                | (
                    Status::Abort,
                    Status::Undone | Status::Undo | Status::Done | Status::Error
                )
                | (Status::Undo, Status::Undoing | Status::Done | Status::Error)
                | (
                    Status::Undoing,
                    Status::Undone | Status::Error | Status::Undo
                )
        );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
