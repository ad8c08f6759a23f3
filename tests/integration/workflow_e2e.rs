//! End-to-end workflow integration tests.
//!
//! A goal goes through decomposition, the scheduler, and agent sessions,
//! and the coordination store ends up describing exactly what happened.

use std::sync::Arc;

use conductor::core::{replay_task_statuses, TaskId, TaskStatus};
use conductor::orchestration::{ApprovalPolicy, PlanFile, RepoContext, TaskDecomposer};
use conductor::Error;
use tokio_test::{assert_err, assert_ok};

use crate::fixtures::{ids, scheduler_config, test_task, SchedulerHarness, TestRepo};

const PLAN: &str = r#"Here is the plan:
```json
[
  {"id": "schema", "description": "Design the database schema", "role": "database"},
  {"id": "api", "description": "Implement REST endpoints", "agentRole": "backend",
   "dependsOn": ["schema"], "priority": 5},
  {"id": "ui", "description": "Build the login form component", "dependencies": ["api"]},
  {"id": "docs", "description": "Write the README section", "agent_role": "documentation",
   "priority": 1}
]
```"#;

/// Test: cap of one runs a dependency before its dependent
/// Given A, B (depends on A), and C with max_parallel = 1
/// Then A is dispatched first and everything completes one at a time
#[tokio::test]
async fn test_e2e_cap_one_dependency_order() {
    let harness = SchedulerHarness::new();
    let tasks = vec![
        test_task("a"),
        test_task("b").with_dependency("a"),
        test_task("c"),
    ];
    let scheduler =
        assert_ok!(harness.scheduler(tasks, ApprovalPolicy::default(), scheduler_config(1, 0)));
    let report = assert_ok!(scheduler.run().await);

    assert!(report.is_success());
    assert_eq!(report.dispatch_order.first(), Some(&TaskId::from("a")));
    let pos = |id: &str| {
        report
            .dispatch_order
            .iter()
            .position(|t| t.as_str() == id)
            .unwrap()
    };
    assert!(pos("a") < pos("b"));
    assert_eq!(report.completed.len(), 3);
    assert_eq!(report.max_observed_running, 1);
    assert_eq!(harness.launcher.peak(), 1);
}

/// Test: plan file to completed run
/// Given a fenced JSON plan with mixed field spellings
/// When it is decomposed against a real repository and scheduled
/// Then every task completes and the store agrees
#[tokio::test]
async fn test_e2e_plan_file_to_completion() {
    let repo = TestRepo::new();
    std::fs::write(repo.path.join("Cargo.toml"), "[package]\nname = \"demo\"\n").unwrap();
    let plan_path = repo.temp_dir.path().join("plan.md");
    std::fs::write(&plan_path, PLAN).unwrap();

    let context = RepoContext::detect(&repo.path);
    assert_eq!(context.branch.as_deref(), Some("main"));
    assert!(context.stack.iter().any(|s| s == "rust"));

    let decomposer = TaskDecomposer::new(Arc::new(PlanFile::new(plan_path)));
    let tasks = assert_ok!(decomposer.decompose("Add user login", &context).await);
    assert_eq!(tasks.len(), 4);
    let ui = tasks.iter().find(|t| t.id.as_str() == "ui").unwrap();
    assert_eq!(ui.agent_role.as_str(), "frontend");

    let harness = SchedulerHarness::new();
    let scheduler =
        assert_ok!(harness.scheduler(tasks, ApprovalPolicy::default(), scheduler_config(2, 0)));
    let report = assert_ok!(scheduler.run().await);

    assert!(report.is_success());
    let order = harness.launcher.launch_order();
    let pos = |id: &str| order.iter().position(|t| t == id).unwrap();
    assert!(pos("schema") < pos("api"));
    assert!(pos("api") < pos("ui"));

    for task in assert_ok!(harness.store.load_tasks()) {
        assert_eq!(task.status, TaskStatus::Completed, "task {}", task.id);
    }
    assert_eq!(harness.workspaces.active_count(), 0);
}

/// Test: a cyclic plan is rejected before anything is persisted
#[tokio::test]
async fn test_e2e_cycle_rejected_before_persisting() {
    let dir = tempfile::tempdir().unwrap();
    let plan_path = dir.path().join("plan.json");
    std::fs::write(
        &plan_path,
        r#"[{"id": "a", "description": "api endpoint", "dependencies": ["b"]},
            {"id": "b", "description": "api client", "dependencies": ["a"]}]"#,
    )
    .unwrap();

    let decomposer = TaskDecomposer::new(Arc::new(PlanFile::new(plan_path)));
    let context = RepoContext::detect(dir.path());
    let err = assert_err!(decomposer.decompose("cycle", &context).await);
    assert!(matches!(err, Error::Decomposition(ref m) if m.contains("cycle")));

    // The scheduler refuses the same graph on its own.
    let harness = SchedulerHarness::new();
    let tasks = vec![
        test_task("a").with_dependency("b"),
        test_task("b").with_dependency("a"),
    ];
    let refused = harness
        .scheduler(tasks, ApprovalPolicy::default(), scheduler_config(1, 0))
        .err();
    assert!(refused.is_some_and(|e| e.to_string().contains("cycle")));
    assert!(assert_ok!(harness.store.load_tasks()).is_empty());
    assert!(assert_ok!(harness.store.all_events()).is_empty());
    assert_eq!(harness.launcher.launch_order().len(), 0);
}

/// Test: replaying the event log reproduces the final task table
#[tokio::test]
async fn test_e2e_replay_matches_store() {
    let harness = SchedulerHarness::new();
    harness.launcher.fail_times("flaky", 1);
    harness.launcher.fail_times("broken", 5);
    let tasks = vec![
        test_task("flaky"),
        test_task("after-flaky").with_dependency("flaky"),
        test_task("broken"),
        test_task("after-broken").with_dependency("broken"),
    ];
    let scheduler =
        assert_ok!(harness.scheduler(tasks, ApprovalPolicy::default(), scheduler_config(2, 1)));
    let report = assert_ok!(scheduler.run().await);

    assert_eq!(report.failed, ids(&["broken"]));
    assert_eq!(report.blocked, ids(&["after-broken"]));
    assert!(!report.is_success());

    let replayed = replay_task_statuses(&assert_ok!(harness.store.all_events()));
    let stored = assert_ok!(harness.store.load_tasks());
    assert_eq!(replayed.len(), stored.len());
    for task in stored {
        assert_eq!(replayed[&task.id], task.status, "task {}", task.id);
    }
}
