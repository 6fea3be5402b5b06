use keel_core::{
    set_resource, ConflictError, CoreError, Engine, EngineConfig, HandlerError, TaskContext,
};
use keel_store::{ChangeId, Status, TaskId, TaskSet, BEGIN_EDGE, MAYBE_REBOOT_EDGE};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SETTLE: Duration = Duration::from_secs(10);

/// Records every handler call as "<do|undo>:<task summary>".
#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn record(&self, ctx: &TaskContext, side: &str) {
        let summary = ctx
            .state()
            .lock()
            .task(ctx.task_id())
            .map(|t| t.summary().to_owned())
            .unwrap_or_default();
        self.0.lock().unwrap().push(format!("{side}:{summary}"));
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    fn position(&self, entry: &str) -> usize {
        self.entries()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{entry} never ran"))
    }
}

fn engine(max_workers: usize) -> Engine {
    Engine::in_memory(EngineConfig {
        max_workers,
        ..EngineConfig::default()
    })
}

fn register_reversible(engine: &Engine, kind: &str, journal: &Journal) {
    let on_do = journal.clone();
    let on_undo = journal.clone();
    engine.handlers_mut().register(
        kind,
        move |ctx: TaskContext| {
            on_do.record(&ctx, "do");
            async { Ok::<(), HandlerError>(()) }
        },
        move |ctx: TaskContext| {
            on_undo.record(&ctx, "undo");
            async { Ok::<(), HandlerError>(()) }
        },
    );
}

fn register_failing(engine: &Engine, kind: &str, journal: &Journal) {
    let on_do = journal.clone();
    engine.handlers_mut().register_irreversible(kind, move |ctx: TaskContext| {
        on_do.record(&ctx, "do");
        async { Err::<(), _>(HandlerError::failed("link failed")) }
    });
}

/// Runs until its change is aborted, then fails after `delay`.
fn register_slow_failure(engine: &Engine, kind: &str, delay: Duration) {
    engine
        .handlers_mut()
        .register_irreversible(kind, move |ctx: TaskContext| async move {
            ctx.cancelled().await;
            tokio::time::sleep(delay).await;
            Err::<(), _>(HandlerError::failed("cleanup failed"))
        });
}

/// prepare -> mount -> link for `snap`, claiming `snap` as the resource.
fn install(engine: &Engine, snap: &str) -> Result<(ChangeId, Vec<TaskId>), ConflictError> {
    engine.check_change_conflict(snap, None)?;
    let mut g = engine.state().lock();
    let chg = g.new_change("install-snap", &format!("Install {snap:?}"));
    let prepare = g.new_task("prepare-snap", "prepare");
    let mount = g.new_task("mount-snap", "mount");
    let link = g.new_task("link-snap", "link");
    g.wait_for(&mount, &prepare).unwrap();
    g.wait_for(&link, &mount).unwrap();
    for t in [&prepare, &mount, &link] {
        set_resource(g.task_mut(t).unwrap(), snap).unwrap();
    }
    let mut ts = TaskSet::new([prepare.clone(), mount.clone(), link.clone()]);
    ts.mark_edge(&prepare, BEGIN_EDGE);
    ts.mark_edge(&link, MAYBE_REBOOT_EDGE);
    g.add_all(&chg, &ts).unwrap();
    Ok((chg, vec![prepare, mount, link]))
}

fn status_of(engine: &Engine, task: &TaskId) -> Status {
    engine.state().lock().task(task).unwrap().status()
}

#[tokio::test]
async fn install_happy_path() {
    let engine = engine(4);
    let journal = Journal::default();
    for kind in ["prepare-snap", "mount-snap", "link-snap"] {
        register_reversible(&engine, kind, &journal);
    }
    let (chg, tasks) = install(&engine, "hello").unwrap();

    engine.settle(SETTLE).await.unwrap();

    assert_eq!(journal.entries(), vec!["do:prepare", "do:mount", "do:link"]);
    for t in &tasks {
        assert_eq!(status_of(&engine, t), Status::Done);
    }
    let g = engine.state().lock();
    assert_eq!(g.change_status(&chg), Some(Status::Done));
    assert!(g.change_err(&chg).is_none());
}

#[tokio::test]
async fn failing_link_rolls_back_mount_and_prepare() {
    let engine = engine(4);
    let journal = Journal::default();
    register_reversible(&engine, "prepare-snap", &journal);
    register_reversible(&engine, "mount-snap", &journal);
    register_failing(&engine, "link-snap", &journal);
    let (chg, tasks) = install(&engine, "hello").unwrap();

    engine.settle(SETTLE).await.unwrap();

    assert_eq!(journal.count("undo:mount"), 1);
    assert_eq!(journal.count("undo:prepare"), 1);
    assert!(journal.position("undo:mount") < journal.position("undo:prepare"));
    assert_eq!(status_of(&engine, &tasks[0]), Status::Undone);
    assert_eq!(status_of(&engine, &tasks[1]), Status::Undone);
    assert_eq!(status_of(&engine, &tasks[2]), Status::Error);

    let g = engine.state().lock();
    assert_eq!(g.change_status(&chg), Some(Status::Error));
    assert!(!g.rollback_halted(&chg));
    assert_eq!(
        g.change_err(&chg).unwrap(),
        "cannot perform the following tasks:\n- link (link failed)"
    );
}

#[tokio::test]
async fn irreversible_task_halts_rollback() {
    let engine = engine(4);
    let journal = Journal::default();
    let on_do = journal.clone();
    engine
        .handlers_mut()
        .register_irreversible("prepare-snap", move |ctx: TaskContext| {
            on_do.record(&ctx, "do");
            async { Ok::<(), HandlerError>(()) }
        });
    register_reversible(&engine, "mount-snap", &journal);
    register_failing(&engine, "link-snap", &journal);
    let (chg, tasks) = install(&engine, "hello").unwrap();

    engine.settle(SETTLE).await.unwrap();

    assert_eq!(journal.count("undo:mount"), 1);
    assert_eq!(status_of(&engine, &tasks[0]), Status::Done);
    assert_eq!(status_of(&engine, &tasks[1]), Status::Undone);
    assert_eq!(status_of(&engine, &tasks[2]), Status::Error);

    let g = engine.state().lock();
    assert_eq!(g.change_status(&chg), Some(Status::Error));
    assert!(g.rollback_halted(&chg));
    let prepare = g.task(&tasks[0]).unwrap();
    assert!(prepare
        .logs()
        .iter()
        .any(|l| l.message.contains("cannot be undone")));
}

#[tokio::test]
async fn kept_task_stops_rollback_of_its_predecessors() {
    let engine = engine(4);
    let journal = Journal::default();
    register_reversible(&engine, "prepare-snap", &journal);
    let on_do = journal.clone();
    engine
        .handlers_mut()
        .register_irreversible("mount-snap", move |ctx: TaskContext| {
            on_do.record(&ctx, "do");
            async { Ok::<(), HandlerError>(()) }
        });
    register_failing(&engine, "link-snap", &journal);
    let (chg, tasks) = install(&engine, "hello").unwrap();

    engine.settle(SETTLE).await.unwrap();

    assert_eq!(journal.count("undo:prepare"), 0);
    assert_eq!(status_of(&engine, &tasks[0]), Status::Done);
    assert_eq!(status_of(&engine, &tasks[1]), Status::Done);
    assert!(engine.state().lock().rollback_halted(&chg));
}

#[tokio::test]
async fn execution_respects_wait_edges() {
    let engine = engine(4);
    let journal = Journal::default();
    register_reversible(&engine, "step", &journal);

    // Diamond a -> {b, c} -> d, plus an independent chain e -> f.
    let edges: Vec<(&str, &str)> = vec![("b", "a"), ("c", "a"), ("d", "b"), ("d", "c"), ("f", "e")];
    {
        let mut g = engine.state().lock();
        let chg = g.new_change("graph", "Graph");
        let mut ids = HashMap::new();
        for name in ["a", "b", "c", "d", "e", "f"] {
            let t = g.new_task("step", name);
            g.add_task(&chg, &t).unwrap();
            ids.insert(name, t);
        }
        for (task, pred) in &edges {
            g.wait_for(&ids[task], &ids[pred]).unwrap();
        }
    }

    engine.settle(SETTLE).await.unwrap();

    assert_eq!(journal.entries().len(), 6);
    for (task, pred) in &edges {
        assert!(
            journal.position(&format!("do:{pred}")) < journal.position(&format!("do:{task}")),
            "{pred} must run before {task}"
        );
    }
}

#[tokio::test]
async fn unstarted_tasks_are_undone_without_handler_calls() {
    let engine = engine(4);
    let journal = Journal::default();
    register_failing(&engine, "first", &journal);
    register_reversible(&engine, "later", &journal);
    let (chg, later) = {
        let mut g = engine.state().lock();
        let chg = g.new_change("chain", "Chain");
        let first = g.new_task("first", "first");
        g.add_task(&chg, &first).unwrap();
        let mut later = Vec::new();
        let mut prev = first;
        for i in 0..3 {
            let t = g.new_task("later", &format!("later-{i}"));
            g.wait_for(&t, &prev).unwrap();
            g.add_task(&chg, &t).unwrap();
            later.push(t.clone());
            prev = t;
        }
        (chg, later)
    };

    engine.settle(SETTLE).await.unwrap();

    assert_eq!(journal.entries(), vec!["do:first"]);
    for t in &later {
        assert_eq!(status_of(&engine, t), Status::Undone);
    }
    assert_eq!(
        engine.state().lock().change_status(&chg),
        Some(Status::Error)
    );
}

#[tokio::test]
async fn undo_runs_in_reverse_order() {
    let engine = engine(4);
    let journal = Journal::default();
    register_reversible(&engine, "step", &journal);
    register_failing(&engine, "boom", &journal);
    {
        let mut g = engine.state().lock();
        let chg = g.new_change("chain", "Chain");
        let mut prev: Option<TaskId> = None;
        for (kind, name) in [("step", "a"), ("step", "b"), ("step", "c"), ("boom", "d")] {
            let t = g.new_task(kind, name);
            if let Some(p) = &prev {
                g.wait_for(&t, p).unwrap();
            }
            g.add_task(&chg, &t).unwrap();
            prev = Some(t);
        }
    }

    engine.settle(SETTLE).await.unwrap();

    let undos: Vec<String> = journal
        .entries()
        .into_iter()
        .filter(|e| e.starts_with("undo:"))
        .collect();
    assert_eq!(undos, vec!["undo:c", "undo:b", "undo:a"]);
}

#[tokio::test]
async fn failed_undo_stops_rollback() {
    let engine = engine(1);
    let journal = Journal::default();
    let on_do = journal.clone();
    engine.handlers_mut().register(
        "fragile",
        move |ctx: TaskContext| {
            on_do.record(&ctx, "do");
            async { Ok::<(), HandlerError>(()) }
        },
        |_ctx| async { Err::<(), _>(HandlerError::failed("cannot unmount")) },
    );
    register_reversible(&engine, "step", &journal);
    register_failing(&engine, "boom", &journal);
    let (chg, a, b) = {
        let mut g = engine.state().lock();
        let chg = g.new_change("pair", "Pair");
        let a = g.new_task("fragile", "a");
        let b = g.new_task("step", "b");
        let c = g.new_task("boom", "c");
        g.wait_for(&c, &a).unwrap();
        g.wait_for(&c, &b).unwrap();
        for t in [&a, &b, &c] {
            g.add_task(&chg, t).unwrap();
        }
        (chg, a, b)
    };

    engine.settle(SETTLE).await.unwrap();

    // One worker: a's undo is dispatched first and fails, so b is left alone.
    assert_eq!(status_of(&engine, &a), Status::Error);
    assert_eq!(status_of(&engine, &b), Status::Done);
    assert_eq!(journal.count("undo:b"), 0);
    let g = engine.state().lock();
    assert_eq!(g.change_status(&chg), Some(Status::Error));
    assert!(g
        .task(&b)
        .unwrap()
        .logs()
        .iter()
        .any(|l| l.message.contains("rollback stopped")));
    assert!(g.change_err(&chg).unwrap().contains("cannot unmount"));
}

#[tokio::test]
async fn late_failure_does_not_restart_stopped_rollback() {
    let engine = engine(3);
    let journal = Journal::default();
    let on_do = journal.clone();
    engine.handlers_mut().register(
        "fragile",
        move |ctx: TaskContext| {
            on_do.record(&ctx, "do");
            async { Ok::<(), HandlerError>(()) }
        },
        |_ctx| async { Err::<(), _>(HandlerError::failed("cannot unmount")) },
    );
    register_reversible(&engine, "step", &journal);
    register_failing(&engine, "boom", &journal);
    register_slow_failure(&engine, "slow-short", Duration::from_millis(200));
    register_slow_failure(&engine, "slow-long", Duration::from_millis(500));
    let (chg, a, b, slow) = {
        let mut g = engine.state().lock();
        let chg = g.new_change("pair", "Pair");
        let d1 = g.new_task("slow-short", "d1");
        let d2 = g.new_task("slow-long", "d2");
        let a = g.new_task("fragile", "a");
        let b = g.new_task("step", "b");
        let c = g.new_task("boom", "c");
        g.wait_for(&c, &a).unwrap();
        g.wait_for(&c, &b).unwrap();
        for t in [&d1, &d2, &a, &b, &c] {
            g.add_task(&chg, t).unwrap();
        }
        (chg, a, b, [d1, d2])
    };

    engine.settle(SETTLE).await.unwrap();

    // a's undo fails while d1 and d2 still run; d1 failing afterwards must
    // not put b back into rollback.
    assert_eq!(status_of(&engine, &a), Status::Error);
    assert_eq!(status_of(&engine, &b), Status::Done);
    for d in &slow {
        assert_eq!(status_of(&engine, d), Status::Error);
    }
    assert_eq!(journal.count("undo:b"), 0);
    let g = engine.state().lock();
    assert!(g.is_rollback_stopped(&chg));
    assert!(g.rollback_halted(&chg));
    let err = g.change_err(&chg).unwrap();
    assert!(err.contains("cannot unmount"));
    assert!(err.contains("cleanup failed"));
}

#[tokio::test]
async fn unbounded_retry_leaves_task_schedulable() {
    let engine = engine(4);
    engine
        .handlers_mut()
        .register_irreversible("stalled", |_ctx: TaskContext| async {
            Err::<(), _>(HandlerError::retry(Duration::MAX, "come back much later"))
        });
    let (chg, task) = {
        let mut g = engine.state().lock();
        let chg = g.new_change("stalled", "Stalled");
        let t = g.new_task("stalled", "Stalled");
        g.add_task(&chg, &t).unwrap();
        (chg, t)
    };

    let err = engine.settle(Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, CoreError::SettleTimeout(_)));
    assert_eq!(engine.runner().running(), 0);
    assert!(!engine.runner().is_running(&task));
    assert_eq!(status_of(&engine, &task), Status::Do);

    assert!(engine.state().lock().abort_change(&chg).unwrap());
    engine.settle(SETTLE).await.unwrap();
    assert_eq!(status_of(&engine, &task), Status::Undone);
}

#[tokio::test]
async fn back_to_back_install_conflicts() {
    let engine = engine(4);
    let (first, _) = install(&engine, "mysnap").unwrap();

    let err = install(&engine, "mysnap").unwrap_err();
    assert!(err.to_string().contains(&format!("change {first}")));
    let ConflictError::ChangeInProgress { change_id, .. } = err;
    assert_eq!(change_id, first);

    assert!(install(&engine, "othersnap").is_ok());
    assert!(engine.check_change_conflict("mysnap", Some(&first)).is_ok());
}

#[tokio::test]
async fn conflict_clears_once_change_is_ready() {
    let engine = engine(4);
    let journal = Journal::default();
    for kind in ["prepare-snap", "mount-snap", "link-snap"] {
        register_reversible(&engine, kind, &journal);
    }
    install(&engine, "mysnap").unwrap();
    engine.settle(SETTLE).await.unwrap();
    assert!(install(&engine, "mysnap").is_ok());
}

#[tokio::test]
async fn deadline_aborts_change() {
    let engine = engine(4);
    engine
        .handlers_mut()
        .register_irreversible("slow", |ctx: TaskContext| async move {
            ctx.cancelled().await;
            Err::<(), _>(HandlerError::Cancelled)
        });
    let (chg, task) = {
        let mut g = engine.state().lock();
        let chg = g.new_change("slow", "Slow change");
        let t = g.new_task("slow", "Slow");
        g.add_task(&chg, &t).unwrap();
        g.change_mut(&chg)
            .unwrap()
            .set_deadline(chrono::Utc::now() + chrono::TimeDelta::milliseconds(50));
        (chg, t)
    };

    engine.settle(SETTLE).await.unwrap();

    assert_eq!(status_of(&engine, &task), Status::Undone);
    let g = engine.state().lock();
    assert_eq!(g.change_status(&chg), Some(Status::Error));
    assert!(g
        .change_err(&chg)
        .unwrap()
        .contains(&format!("change {chg} (Slow change) taking too long")));
}

#[tokio::test]
async fn handler_requested_retry() {
    let engine = engine(4);
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    engine
        .handlers_mut()
        .register_irreversible("flaky", move |_ctx: TaskContext| {
            let attempt = counted.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(HandlerError::retry(Duration::from_millis(30), "network down"))
                } else {
                    Ok(())
                }
            }
        });
    let task = {
        let mut g = engine.state().lock();
        let chg = g.new_change("flaky", "Flaky");
        let t = g.new_task("flaky", "Flaky");
        g.add_task(&chg, &t).unwrap();
        t
    };

    engine.settle(SETTLE).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let g = engine.state().lock();
    let t = g.task(&task).unwrap();
    assert_eq!(t.status(), Status::Done);
    assert!(t.logs().iter().any(|l| l.message.contains("network down")));
}

#[tokio::test]
async fn worker_limit_is_respected() {
    let engine = engine(2);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
    engine
        .handlers_mut()
        .register_irreversible("busy", move |_ctx: TaskContext| {
            let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        });
    {
        let mut g = engine.state().lock();
        let chg = g.new_change("busy", "Busy");
        for i in 0..6 {
            let t = g.new_task("busy", &format!("busy-{i}"));
            g.add_task(&chg, &t).unwrap();
        }
    }

    engine.settle(SETTLE).await.unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(engine
        .state()
        .lock()
        .tasks()
        .all(|t| t.status() == Status::Done));
}

#[tokio::test]
async fn caller_abort_cancels_running_task() {
    let mut engine = engine(4);
    engine
        .handlers_mut()
        .register_irreversible("wait", |ctx: TaskContext| async move {
            ctx.cancelled().await;
            Err::<(), _>(HandlerError::Cancelled)
        });
    let (chg, task) = {
        let mut g = engine.state().lock();
        let chg = g.new_change("wait", "Wait");
        let t = g.new_task("wait", "Wait");
        g.add_task(&chg, &t).unwrap();
        (chg, t)
    };
    engine.start();
    let waiter = engine.state().lock().change_ready(&chg).unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !engine.runner().is_running(&task) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(engine.state().lock().abort_change(&chg).unwrap());
    engine.ensure_before(Duration::ZERO);
    tokio::time::timeout(Duration::from_secs(5), waiter.wait())
        .await
        .unwrap();

    assert_eq!(status_of(&engine, &task), Status::Undone);
    assert_eq!(
        engine.state().lock().change_status(&chg),
        Some(Status::Undone)
    );
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn running_loop_completes_changes() {
    let mut engine = engine(4);
    let journal = Journal::default();
    for kind in ["prepare-snap", "mount-snap", "link-snap"] {
        register_reversible(&engine, kind, &journal);
    }
    engine.start();
    let (chg, _) = install(&engine, "hello").unwrap();
    let waiter = engine.state().lock().change_ready(&chg).unwrap();
    engine.ensure_before(Duration::ZERO);

    tokio::time::timeout(Duration::from_secs(5), waiter.wait())
        .await
        .unwrap();
    engine.stop().await.unwrap();

    assert_eq!(journal.entries().len(), 3);
    assert!(engine.passes() >= 2);
}

#[tokio::test]
async fn handler_panic_fails_task() {
    let engine = engine(4);
    engine
        .handlers_mut()
        .register_irreversible("panics", |_ctx: TaskContext| async {
            if true {
                panic!("handler bug");
            }
            Ok::<(), HandlerError>(())
        });
    let (chg, task) = {
        let mut g = engine.state().lock();
        let chg = g.new_change("panics", "Panics");
        let t = g.new_task("panics", "Panics");
        g.add_task(&chg, &t).unwrap();
        (chg, t)
    };

    engine.settle(SETTLE).await.unwrap();

    assert_eq!(status_of(&engine, &task), Status::Error);
    assert!(engine
        .state()
        .lock()
        .change_err(&chg)
        .unwrap()
        .contains("handler panicked"));
}

#[tokio::test]
async fn settle_reports_timeout() {
    let engine = engine(4);
    engine
        .handlers_mut()
        .register_irreversible("wait", |ctx: TaskContext| async move {
            ctx.cancelled().await;
            Err::<(), _>(HandlerError::Cancelled)
        });
    {
        let mut g = engine.state().lock();
        let chg = g.new_change("wait", "Wait");
        let t = g.new_task("wait", "Wait");
        g.add_task(&chg, &t).unwrap();
    }
    let err = engine.settle(Duration::from_millis(30)).await.unwrap_err();
    assert!(matches!(err, CoreError::SettleTimeout(_)));
    engine.runner().stop().await;
}
