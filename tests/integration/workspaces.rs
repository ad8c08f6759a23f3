//! Git worktree workspaces, alone and under a real agent process.

use std::sync::Arc;

use conductor::core::TaskId;
use conductor::workspace::{ReleaseOutcome, WorkspaceManager, Workspaces};
use conductor::Error;
use tokio_test::{assert_err, assert_ok};

use crate::fixtures::TestRepo;

/// Test: acquire gives an isolated checkout; release keeps committed work
#[tokio::test]
async fn test_workspace_acquire_release_cycle() {
    let repo = TestRepo::new();
    let trees = tempfile::tempdir().unwrap();
    let manager = assert_ok!(WorkspaceManager::new(
        &repo.path,
        trees.path().to_path_buf(),
        None
    ));
    assert_eq!(manager.integration_branch(), "main");

    let id = TaskId::from("auth");
    let ws = assert_ok!(manager.acquire(&id).await);
    assert!(ws.path.join("README.md").exists());
    assert_eq!(ws.branch, "conductor/auth");

    // A second acquire for the same task conflicts.
    let err = assert_err!(manager.acquire(&id).await);
    assert!(matches!(err, Error::WorkspaceConflict(_)));

    std::fs::write(ws.path.join("auth.rs"), "pub fn login() {}\n").unwrap();
    assert_ok!(manager.release(&id, ReleaseOutcome::Success).await);
    assert!(!ws.path.exists());
    assert_eq!(
        repo.show("conductor/auth", "auth.rs").as_deref(),
        Some("pub fn login() {}\n")
    );
    // Main is untouched.
    assert!(repo.show("main", "auth.rs").is_none());

    // Released, so the same task can be acquired again after a failure.
    let ws = assert_ok!(manager.acquire(&TaskId::from("retry-me")).await);
    assert_ok!(manager
        .release(&TaskId::from("retry-me"), ReleaseOutcome::Failure)
        .await);
    assert!(!ws.path.exists());
    assert!(!repo.branch_exists("conductor/retry-me"));
}

/// Test: parallel acquires for different tasks do not interfere
#[tokio::test]
async fn test_workspace_parallel_acquire() {
    let repo = TestRepo::new();
    let trees = tempfile::tempdir().unwrap();
    let manager = Arc::new(assert_ok!(WorkspaceManager::new(
        &repo.path,
        trees.path().to_path_buf(),
        None
    )));

    let mut handles = Vec::new();
    for i in 0..4 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager.acquire(&TaskId::from(format!("t{}", i))).await
        }));
    }
    for handle in handles {
        assert_ok!(assert_ok!(handle.await));
    }
    assert_eq!(manager.active().await.len(), 4);

    for i in 0..4 {
        let id = TaskId::from(format!("t{}", i));
        assert_ok!(manager.release(&id, ReleaseOutcome::Cancelled).await);
    }
    assert!(manager.active().await.is_empty());
}

/// Test: a real agent process runs inside its worktree
/// Given a shell agent that writes a file and reports success
/// When the scheduler runs two tasks through real worktrees
/// Then each task's branch carries the file its agent wrote
#[cfg(unix)]
#[tokio::test]
async fn test_workspace_real_agent_run() {
    use conductor::agent::AgentCommand;
    use conductor::orchestration::{
        AgentSessionManager, ApprovalGate, ApprovalPolicy, ExecutionScheduler, ProcessLauncher,
        Recorder,
    };
    use conductor::store::CoordinationStore;
    use std::time::Duration;

    use crate::fixtures::{scheduler_config, test_task, write_script};

    let repo = TestRepo::new();
    let scratch = tempfile::tempdir().unwrap();
    let agent = write_script(
        scratch.path(),
        "agent.sh",
        r#"read envelope
case "$CONDUCTOR_TASK_ID" in
  broken) echo '{"success": false, "error": "cannot build"}'; exit 1 ;;
esac
echo "working on $CONDUCTOR_TASK_ID"
echo "$CONDUCTOR_TASK_ID" > "$CONDUCTOR_TASK_ID.txt"
echo '{"success": true, "output": "done"}'
"#,
    );

    let store = Arc::new(assert_ok!(CoordinationStore::open(
        &scratch.path().join("conductor.db")
    )));
    let recorder = Recorder::new(Arc::clone(&store));
    let workspaces = Arc::new(assert_ok!(WorkspaceManager::new(
        &repo.path,
        scratch.path().join("worktrees"),
        None
    )));
    let launcher = Arc::new(ProcessLauncher::new(assert_ok!(AgentCommand::parse(
        &agent.to_string_lossy()
    ))));
    let sessions = Arc::new(
        AgentSessionManager::new(launcher, workspaces, recorder.clone())
            .with_grace(Duration::from_millis(200)),
    );
    let scheduler = assert_ok!(ExecutionScheduler::from_plan(
        vec![test_task("api"), test_task("cli"), test_task("broken")],
        sessions,
        ApprovalGate::new(ApprovalPolicy::default(), recorder.clone()),
        recorder,
        scheduler_config(2, 0),
    ));
    let report = assert_ok!(scheduler.run().await);

    assert_eq!(report.completed.len(), 2);
    assert_eq!(report.failed, vec![TaskId::from("broken")]);
    assert_eq!(repo.show("conductor/api", "api.txt").as_deref(), Some("api\n"));
    assert_eq!(repo.show("conductor/cli", "cli.txt").as_deref(), Some("cli\n"));
    assert!(!repo.branch_exists("conductor/broken"));

    let sessions = assert_ok!(store.load_sessions());
    assert_eq!(sessions.len(), 3);
    assert!(sessions.iter().all(|s| s.is_terminated()));
}
