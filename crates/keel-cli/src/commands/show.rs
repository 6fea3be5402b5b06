use super::{colorize_status, json_pretty, load_state, resolve_change, EXIT_SUCCESS};
use std::path::Path;

pub fn run(root: &Path, change: &str, json: bool) -> Result<u8, String> {
    let state = load_state(root)?;
    let guard = state.lock();
    let id = resolve_change(&guard, change)?;
    let chg = guard
        .change(&id)
        .ok_or_else(|| format!("no change with id '{change}'"))?;
    let status = guard.change_status(&id).unwrap_or_default();
    let tasks = guard.change_tasks(&id);
    let error = guard.change_err(&id);
    let halted = guard.rollback_halted(&id);

    if json {
        let payload = serde_json::json!({
            "id": chg.id(),
            "kind": chg.kind(),
            "summary": chg.summary(),
            "status": status.to_string(),
            "spawn_time": chg.spawn_time(),
            "ready_time": chg.ready_time(),
            "deadline": chg.deadline(),
            "edges": chg.edges().collect::<std::collections::BTreeMap<_, _>>(),
            "data": chg.data(),
            "rollback_halted": halted,
            "error": error,
            "tasks": tasks.iter().map(|t| serde_json::json!({
                "id": t.id(),
                "kind": t.kind(),
                "summary": t.summary(),
                "status": t.status().to_string(),
                "wait_tasks": t.wait_tasks(),
                "progress": t.progress(),
                "log": t.logs().iter().map(ToString::to_string).collect::<Vec<_>>(),
            })).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("change {} ({}): {}", chg.id(), chg.kind(), chg.summary());
    println!("status:  {}", colorize_status(status));
    println!("spawned: {}", chg.spawn_time().to_rfc3339());
    if let Some(ready) = chg.ready_time() {
        println!("ready:   {}", ready.to_rfc3339());
    }
    if let Some(deadline) = chg.deadline() {
        println!("deadline: {}", deadline.to_rfc3339());
    }
    for (edge, task) in chg.edges() {
        println!("edge:    {edge} -> task {task}");
    }

    println!();
    println!("{:<6} {:<10} {:<20} SUMMARY", "ID", "STATUS", "KIND");
    for t in &tasks {
        println!(
            "{:<6} {:<10} {:<20} {}",
            t.id(),
            colorize_status(t.status()),
            t.kind(),
            t.summary()
        );
        if let Some(p) = t.progress() {
            println!("       progress: {} {}/{}", p.label, p.done, p.total);
        }
        for entry in t.logs() {
            println!("       {entry}");
        }
    }

    if let Some(err) = error {
        println!();
        println!("{err}");
    }
    if halted {
        println!();
        println!("rollback halted: some completed tasks could not be undone");
    }
    Ok(EXIT_SUCCESS)
}
