use super::{colorize_status, json_pretty, load_state, EXIT_SUCCESS};
use std::path::Path;

pub fn run(root: &Path, in_progress: bool, json: bool) -> Result<u8, String> {
    let state = load_state(root)?;
    let guard = state.lock();
    let changes: Vec<_> = guard
        .changes()
        .filter_map(|c| guard.change_status(c.id()).map(|s| (c, s)))
        .filter(|(_, s)| !in_progress || !s.is_ready())
        .collect();

    if json {
        let payload: Vec<_> = changes
            .iter()
            .map(|(c, s)| {
                serde_json::json!({
                    "id": c.id(),
                    "kind": c.kind(),
                    "summary": c.summary(),
                    "status": s.to_string(),
                    "spawn_time": c.spawn_time(),
                    "ready_time": c.ready_time(),
                })
            })
            .collect();
        println!("{}", json_pretty(&payload)?);
    } else if changes.is_empty() {
        println!("no changes found");
    } else {
        println!(
            "{:<6} {:<10} {:<20} {:<20} SUMMARY",
            "ID", "STATUS", "KIND", "SPAWNED"
        );
        for (c, s) in &changes {
            println!(
                "{:<6} {:<10} {:<20} {:<20} {}",
                c.id(),
                colorize_status(*s),
                c.kind(),
                c.spawn_time().format("%Y-%m-%d %H:%M:%S"),
                c.summary()
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
