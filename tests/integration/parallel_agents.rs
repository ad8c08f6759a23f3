//! Parallel execution correctness.
//!
//! The concurrency cap holds under load, and the approval gate keeps
//! rejected work from ever reaching an agent.

use std::time::Duration;

use conductor::core::{kinds, TaskStatus};
use conductor::orchestration::{ApprovalPolicy, ApprovalState};
use tokio::sync::mpsc;
use tokio_test::assert_ok;

use crate::fixtures::{
    ids, independent_tasks, scheduler_config, test_task, FakeLauncher, SchedulerHarness,
};

/// Test: twelve slow independent tasks never exceed a cap of three
#[tokio::test]
async fn test_parallel_cap_never_exceeded() {
    let harness = SchedulerHarness::with_launcher(FakeLauncher::with_delay(
        Duration::from_millis(40),
    ));
    let scheduler = assert_ok!(harness.scheduler(
        independent_tasks(12),
        ApprovalPolicy::default(),
        scheduler_config(3, 0),
    ));
    let report = assert_ok!(scheduler.run().await);

    assert!(report.is_success());
    assert_eq!(report.completed.len(), 12);
    assert!(report.max_observed_running <= 3);
    assert!(harness.launcher.peak() <= 3);
    // With 40ms per task the pool fills up.
    assert_eq!(harness.launcher.peak(), 3);
}

/// Test: independent tasks overlap when the cap allows it
#[tokio::test]
async fn test_parallel_independent_tasks_overlap() {
    let harness = SchedulerHarness::with_launcher(FakeLauncher::with_delay(
        Duration::from_millis(100),
    ));
    let scheduler = assert_ok!(harness.scheduler(
        independent_tasks(4),
        ApprovalPolicy::default(),
        scheduler_config(4, 0),
    ));
    let report = assert_ok!(scheduler.run().await);

    assert!(report.is_success());
    assert_eq!(harness.launcher.peak(), 4);
    assert_eq!(report.max_observed_running, 4);
}

/// Test: a rejected task spawns nothing and blocks its dependents
/// Given `migrate` tagged risky and `api` depending on it
/// When the operator rejects `migrate`
/// Then no workspace or agent is created for it and `api` is blocked
#[tokio::test]
async fn test_rejected_approval_blocks_dependents() {
    let (feed_tx, mut feed_rx) = mpsc::channel(256);
    let harness = SchedulerHarness::with_feed(feed_tx);
    let tasks = vec![
        test_task("migrate").with_tag("risky"),
        test_task("api").with_dependency("migrate"),
        test_task("docs"),
    ];
    let scheduler = assert_ok!(harness.scheduler(
        tasks,
        ApprovalPolicy::default().with_tag("risky"),
        scheduler_config(2, 0),
    ));
    let handle = scheduler.handle();
    tokio::spawn(async move {
        while let Some(event) = feed_rx.recv().await {
            if event.event_type == kinds::APPROVAL_REQUESTED {
                let task_id = event.task_id.unwrap();
                let state = handle.decide(&task_id, false).await.unwrap();
                assert_eq!(state, ApprovalState::Rejected);
            }
        }
    });

    let report = assert_ok!(scheduler.run().await);
    assert_eq!(report.failed, ids(&["migrate"]));
    assert_eq!(report.blocked, ids(&["api"]));
    assert_eq!(report.completed, ids(&["docs"]));
    assert_eq!(harness.launcher.launches("migrate"), 0);
    assert_eq!(harness.launcher.launches("api"), 0);
    assert_eq!(harness.workspaces.acquired("migrate"), 0);

    let stored = assert_ok!(harness.store.load_tasks());
    let api = stored.iter().find(|t| t.id.as_str() == "api").unwrap();
    assert_eq!(api.status, TaskStatus::Blocked);
}

/// Test: an approved task runs once the decision arrives
#[tokio::test]
async fn test_approved_task_runs() {
    let (feed_tx, mut feed_rx) = mpsc::channel(256);
    let harness = SchedulerHarness::with_feed(feed_tx);
    let scheduler = assert_ok!(harness.scheduler(
        vec![test_task("deploy").with_tag("prod"), test_task("smoke").with_dependency("deploy")],
        ApprovalPolicy::default().with_tag("prod"),
        scheduler_config(1, 0),
    ));
    let handle = scheduler.handle();
    tokio::spawn(async move {
        while let Some(event) = feed_rx.recv().await {
            if event.event_type == kinds::APPROVAL_REQUESTED {
                let task_id = event.task_id.unwrap();
                handle.decide(&task_id, true).await.unwrap();
            }
        }
    });

    let report = assert_ok!(scheduler.run().await);
    assert!(report.is_success());
    assert_eq!(report.dispatch_order, ids(&["deploy", "smoke"]));
    assert_eq!(harness.launcher.launches("deploy"), 1);
}
