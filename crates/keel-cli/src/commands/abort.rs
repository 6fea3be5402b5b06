use super::{json_pretty, open_engine, resolve_change, EXIT_FAILURE, EXIT_SUCCESS};
use std::path::Path;

pub fn run(root: &Path, change: &str, json: bool) -> Result<u8, String> {
    let engine = open_engine(root)?;
    let aborted = {
        let mut guard = engine.state().lock();
        let id = resolve_change(&guard, change)?;
        guard
            .abort_change(&id)
            .map_err(|e| format!("store error: {e}"))?
    };
    engine
        .state()
        .checkpoint()
        .map_err(|e| format!("store error: {e}"))?;

    if json {
        let payload = serde_json::json!({ "change": change, "aborted": aborted });
        println!("{}", json_pretty(&payload)?);
    } else if aborted {
        println!("change {change} marked for rollback");
    } else {
        println!("change {change} is already ready; nothing to abort");
    }
    Ok(if aborted { EXIT_SUCCESS } else { EXIT_FAILURE })
}
