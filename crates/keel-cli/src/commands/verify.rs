use super::{json_pretty, load_state, EXIT_STORE_ERROR, EXIT_SUCCESS};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> Result<u8, String> {
    let state = load_state(root)?;
    let guard = state.lock();
    let problems = guard.check_consistency();
    let changes = guard.changes().count();
    let tasks = guard.tasks().count();

    if json {
        let payload = serde_json::json!({
            "changes": changes,
            "tasks": tasks,
            "problems": problems,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("state checksum ok: {changes} changes, {tasks} tasks");
        for p in &problems {
            println!("  FAIL {p}");
        }
    }

    if problems.is_empty() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_STORE_ERROR)
    }
}
