//! Retry, cancellation, and resume tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use conductor::core::{kinds, EventSource, NewEvent, SessionId, TaskId, TaskStatus};
use conductor::orchestration::{
    AgentSessionManager, ApprovalGate, ApprovalPolicy, ExecutionScheduler, Recorder,
    RetryPolicy, SchedulerConfig,
};
use conductor::store::CoordinationStore;
use conductor::workspace::{WorkspaceManager, Workspaces};
use conductor::Error;
use tokio_test::{assert_err, assert_ok};

use crate::fixtures::{
    ids, scheduler_config, test_task, FakeLauncher, SchedulerHarness, TestRepo,
};

/// Test: retries are exhausted after max_retries + 1 attempts
/// Given max_retries = 1 and a task that always fails
/// Then it was spawned twice, got two fresh workspaces, and ends failed
#[tokio::test]
async fn test_retries_exhausted() {
    let harness = SchedulerHarness::new();
    harness.launcher.fail_times("build", 10);
    let scheduler = assert_ok!(harness.scheduler(
        vec![test_task("build"), test_task("ship").with_dependency("build")],
        ApprovalPolicy::default(),
        scheduler_config(1, 1),
    ));
    let report = assert_ok!(scheduler.run().await);

    assert_eq!(report.failed, ids(&["build"]));
    assert_eq!(report.blocked, ids(&["ship"]));
    assert_eq!(report.attempts[&TaskId::from("build")], 2);
    assert_eq!(harness.launcher.launches("build"), 2);
    assert_eq!(harness.workspaces.acquired("build"), 2);
    assert_eq!(harness.workspaces.released("build"), 2);
    assert_eq!(harness.launcher.launches("ship"), 0);

    let stored = assert_ok!(harness.store.load_task(&TaskId::from("build")));
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.metrics.attempts, 2);
    assert!(stored.error.unwrap().contains("build failed"));
}

/// Test: a task that fails once succeeds on retry, after the backoff delay
#[tokio::test]
async fn test_retry_with_backoff_then_success() {
    let harness = SchedulerHarness::new();
    harness.launcher.fail_times("flaky", 1);
    let config = SchedulerConfig {
        retry_policy: RetryPolicy::Fixed { delay_ms: 120 },
        ..scheduler_config(2, 2)
    };
    let started = Instant::now();
    let scheduler = assert_ok!(harness.scheduler(
        vec![test_task("flaky")],
        ApprovalPolicy::default(),
        config,
    ));
    let report = assert_ok!(scheduler.run().await);

    assert!(report.is_success());
    assert!(started.elapsed() >= Duration::from_millis(120));
    assert_eq!(harness.launcher.launches("flaky"), 2);
    let stored = assert_ok!(harness.store.load_task(&TaskId::from("flaky")));
    assert_eq!(stored.metrics.retries, 1);
}

/// Test: cancelling the whole run leaves unstarted work pending
#[tokio::test]
async fn test_cancel_run_leaves_work_unfinished() {
    let harness = SchedulerHarness::with_launcher(FakeLauncher::with_delay(
        Duration::from_millis(200),
    ));
    let scheduler = assert_ok!(harness.scheduler(
        vec![test_task("a"), test_task("b").with_dependency("a")],
        ApprovalPolicy::default(),
        scheduler_config(1, 0),
    ));
    let handle = scheduler.handle();
    let run = tokio::spawn(scheduler.run());
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();

    let report = assert_ok!(assert_ok!(run.await));
    assert!(report.cancelled);
    assert!(!report.is_success());
    assert!(report.unfinished.contains(&TaskId::from("b")));
    assert_eq!(harness.launcher.launches("b"), 0);
    assert_eq!(harness.workspaces.active_count(), 0);

    // The handle outlives the scheduler but can no longer reach it.
    let err = assert_err!(handle.cancel_task(&TaskId::from("a")).await);
    assert!(matches!(err, Error::Cancelled));
}

/// Test: resume discards an interrupted attempt and finishes the graph
/// Given a store where `a` was running when the process died
/// When a new scheduler resumes from that store
/// Then `a` is retried from pending and `b` runs after it
#[tokio::test]
async fn test_resume_after_interruption() {
    let harness = SchedulerHarness::new();
    let tasks = vec![test_task("a"), test_task("b").with_dependency("a")];
    assert_ok!(harness.recorder.persist_graph(&tasks));

    let mut a = assert_ok!(harness.store.load_task(&TaskId::from("a")));
    a.assign(SessionId::new());
    a.start();
    assert_ok!(harness.recorder.transition(
        &a,
        NewEvent::task_status(EventSource::Scheduler, &a.id, TaskStatus::Running),
    ));

    let scheduler = assert_ok!(
        ExecutionScheduler::resume(
            Arc::clone(&harness.sessions),
            ApprovalGate::new(ApprovalPolicy::default(), harness.recorder.clone()),
            harness.recorder.clone(),
            scheduler_config(2, 0),
        )
        .await
    );
    let report = assert_ok!(scheduler.run().await);

    assert!(report.is_success());
    assert_eq!(report.dispatch_order, ids(&["a", "b"]));
    for task in assert_ok!(harness.store.load_tasks()) {
        assert_eq!(task.status, TaskStatus::Completed, "task {}", task.id);
    }
    let history = assert_ok!(harness.store.events_for_task(&TaskId::from("a")));
    assert!(history
        .iter()
        .any(|e| e.metadata.get("reason").and_then(|v| v.as_str()) == Some("interrupted")));
}

/// Test: resume reclaims the worktree a crashed process left behind
/// Given `api` was running in a real worktree when the process died
/// When a fresh workspace manager and scheduler resume from the store
/// Then the leftover worktree and branch are cleared and `api` completes
#[tokio::test]
async fn test_resume_reclaims_leftover_worktree() {
    let repo = TestRepo::new();
    let scratch = tempfile::tempdir().unwrap();
    let trees = scratch.path().join("worktrees");
    let store = Arc::new(assert_ok!(CoordinationStore::open(
        &scratch.path().join("conductor.db")
    )));
    let recorder = Recorder::new(Arc::clone(&store));
    let tasks = vec![test_task("api"), test_task("cli").with_dependency("api")];
    assert_ok!(recorder.persist_graph(&tasks));

    // The previous process got as far as a running agent, then died.
    let crashed = assert_ok!(WorkspaceManager::new(&repo.path, trees.clone(), None));
    let leftover = assert_ok!(crashed.acquire(&TaskId::from("api")).await);
    std::fs::write(leftover.path.join("partial.rs"), "fn partial() {}\n").unwrap();
    drop(crashed);
    let mut api = assert_ok!(store.load_task(&TaskId::from("api")));
    api.assign(SessionId::new());
    api.start();
    assert_ok!(recorder.transition(
        &api,
        NewEvent::task_status(EventSource::Scheduler, &api.id, TaskStatus::Running),
    ));

    let workspaces = Arc::new(assert_ok!(WorkspaceManager::new(&repo.path, trees, None)));
    let sessions = Arc::new(AgentSessionManager::new(
        Arc::new(FakeLauncher::default()),
        workspaces.clone(),
        recorder.clone(),
    ));
    let scheduler = assert_ok!(
        ExecutionScheduler::resume(
            sessions,
            ApprovalGate::new(ApprovalPolicy::default(), recorder.clone()),
            recorder,
            scheduler_config(1, 0),
        )
        .await
    );
    let report = assert_ok!(scheduler.run().await);

    assert!(report.is_success());
    assert_eq!(report.dispatch_order, ids(&["api", "cli"]));
    assert!(workspaces.active().await.is_empty());
    assert!(repo.branch_exists("conductor/api"));
    // The half-done file died with the old worktree.
    assert!(repo.show("conductor/api", "partial.rs").is_none());

    let history = assert_ok!(store.events_for_task(&TaskId::from("api")));
    assert!(history.iter().any(|e| e.event_type == kinds::WORKSPACE_RELEASED
        && e.metadata.get("outcome").and_then(|v| v.as_str()) == Some("reclaimed")));
}
