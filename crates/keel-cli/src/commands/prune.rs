use super::{json_pretty, open_engine, EXIT_SUCCESS};
use chrono::Utc;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> Result<u8, String> {
    let engine = open_engine(root)?;
    let config = engine.config();
    let report = engine.state().lock().prune(
        Utc::now(),
        config.prune_wait(),
        config.abort_wait(),
        config.max_ready_changes,
    );
    engine
        .state()
        .checkpoint()
        .map_err(|e| format!("store error: {e}"))?;

    if json {
        let payload = serde_json::json!({
            "removed_changes": report.removed_changes,
            "aborted_changes": report.aborted_changes,
            "removed_tasks": report.removed_tasks,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "prune: removed {} changes and {} tasks, aborted {} changes",
            report.removed_changes.len(),
            report.removed_tasks,
            report.aborted_changes.len()
        );
    }
    Ok(EXIT_SUCCESS)
}
