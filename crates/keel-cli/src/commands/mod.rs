pub mod abort;
pub mod list;
pub mod prune;
pub mod show;
pub mod verify;

use keel_core::{CoreError, Engine};
use keel_store::{ChangeId, FileBackend, MemoryBackend, State, StateGuard, Status, StoreLayout};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_STORE_ERROR: u8 = 2;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn colorize_status(status: Status) -> String {
    use console::Style;
    let text = status.to_string();
    match status {
        Status::Done => Style::new().green().apply_to(text).to_string(),
        Status::Doing | Status::Undoing => Style::new().cyan().bold().apply_to(text).to_string(),
        Status::Do | Status::Hold => Style::new().yellow().apply_to(text).to_string(),
        Status::Error => Style::new().red().bold().apply_to(text).to_string(),
        Status::Abort | Status::Undo | Status::Undone => {
            Style::new().dim().apply_to(text).to_string()
        }
    }
}

/// Read the last checkpoint without taking the state lock. Checkpoints are
/// replaced atomically, so this is safe while an engine is running. A root
/// that was never checkpointed reads as an empty state.
pub fn load_state(root: &Path) -> Result<State, String> {
    let backend = FileBackend::new(StoreLayout::new(root));
    debug!("reading state from {}", backend.layout().state_file().display());
    let memory = Arc::new(MemoryBackend::new());
    match backend.read().map_err(|e| format!("store error: {e}"))? {
        Some(bytes) => State::read_from(&bytes, memory).map_err(|e| format!("store error: {e}")),
        None => Ok(State::new(memory)),
    }
}

/// Open the state root for writing. Fails if an engine holds it.
pub fn open_engine(root: &Path) -> Result<Engine, String> {
    debug!("opening state root {}", root.display());
    Engine::open(root).map_err(|e| match &e {
        CoreError::Locked(_) => format!("state lock: {e}"),
        CoreError::Store(inner) => format!("store error: {inner}"),
        _ => e.to_string(),
    })
}

pub fn resolve_change(guard: &StateGuard<'_>, input: &str) -> Result<ChangeId, String> {
    let id = ChangeId::new(input);
    if guard.change(&id).is_some() {
        Ok(id)
    } else {
        Err(format!("no change with id '{input}'"))
    }
}
