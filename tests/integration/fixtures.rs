//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - A fake agent launcher with per-task failure scripts
//! - A workspace provider that counts acquire and release calls
//! - A scheduler harness wired to a real coordination store

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use conductor::core::{AgentRole, TaskEnvelope, TaskId, TaskNode, TransparencyEvent};
use conductor::orchestration::{
    AgentChunk, AgentLauncher, AgentProcess, AgentResult, AgentSessionManager, ApprovalGate,
    ApprovalPolicy, ExecutionScheduler, Recorder, RetryPolicy, SchedulerConfig,
};
use conductor::store::CoordinationStore;
use conductor::workspace::{branch_for, ReleaseOutcome, Workspace, Workspaces};
use conductor::{Error, Result};

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository on `main` with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        git(&path, &["init", "-b", "main"]);
        git(&path, &["config", "user.email", "test@test.com"]);
        git(&path, &["config", "user.name", "Test User"]);

        std::fs::write(path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "Initial commit"]);

        Self { temp_dir, path }
    }

    /// Content of `file` on `branch`, if both exist.
    pub fn show(&self, branch: &str, file: &str) -> Option<String> {
        let output = Command::new("git")
            .args(["show", &format!("{}:{}", branch, file)])
            .current_dir(&self.path)
            .output()
            .ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .current_dir(&self.path)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

fn git(path: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(path)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Write an executable shell script and return its absolute path.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).expect("Failed to write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to chmod script");
    path
}

/// Agent launcher whose processes finish immediately (or after `delay`).
///
/// A task fails for as many attempts as `fail_times` says, then succeeds.
#[derive(Default)]
pub struct FakeLauncher {
    fail_times: Mutex<HashMap<String, usize>>,
    launches: Mutex<Vec<String>>,
    delay: Duration,
    alive: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn fail_times(&self, task: &str, times: usize) {
        self.fail_times
            .lock()
            .unwrap()
            .insert(task.to_string(), times);
    }

    pub fn launch_order(&self) -> Vec<String> {
        self.launches.lock().unwrap().clone()
    }

    pub fn launches(&self, task: &str) -> usize {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .filter(|t| *t == task)
            .count()
    }

    /// Most processes alive at the same time.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentLauncher for FakeLauncher {
    async fn launch(
        &self,
        envelope: &TaskEnvelope,
        _workspace: &Workspace,
    ) -> Result<Box<dyn AgentProcess>> {
        let task = envelope.id.to_string();
        self.launches.lock().unwrap().push(task.clone());
        let fail = match self.fail_times.lock().unwrap().get_mut(&task) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };

        let result = AgentResult {
            success: !fail,
            output: (!fail).then(|| serde_json::json!({ "task": task })),
            error: fail.then(|| format!("{} failed", task)),
            metrics: serde_json::Value::Null,
        };
        let alive = self.alive.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(alive, Ordering::SeqCst);
        Ok(Box::new(FakeProcess {
            delay: self.delay,
            chunks: vec![
                AgentChunk::Result(result),
                AgentChunk::End {
                    exit_code: Some(if fail { 1 } else { 0 }),
                    stderr: None,
                },
            ],
            alive: Arc::clone(&self.alive),
        }))
    }
}

struct FakeProcess {
    delay: Duration,
    chunks: Vec<AgentChunk>,
    alive: Arc<AtomicUsize>,
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        self.alive.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn next_chunk(&mut self) -> Option<AgentChunk> {
        if !self.delay.is_zero() {
            tokio::time::sleep(std::mem::take(&mut self.delay)).await;
        }
        if self.chunks.is_empty() {
            None
        } else {
            Some(self.chunks.remove(0))
        }
    }

    async fn terminate(&mut self, _grace: Duration) -> Result<Option<i32>> {
        self.chunks.clear();
        Ok(None)
    }
}

/// Workspace provider that hands out paths without touching git.
#[derive(Default)]
pub struct CountingWorkspaces {
    active: Mutex<HashSet<TaskId>>,
    acquired: Mutex<HashMap<TaskId, usize>>,
    released: Mutex<HashMap<TaskId, usize>>,
}

impl CountingWorkspaces {
    pub fn acquired(&self, task: &str) -> usize {
        self.acquired
            .lock()
            .unwrap()
            .get(&TaskId::from(task))
            .copied()
            .unwrap_or(0)
    }

    pub fn released(&self, task: &str) -> usize {
        self.released
            .lock()
            .unwrap()
            .get(&TaskId::from(task))
            .copied()
            .unwrap_or(0)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}

#[async_trait]
impl Workspaces for CountingWorkspaces {
    async fn acquire(&self, task_id: &TaskId) -> Result<Workspace> {
        if !self.active.lock().unwrap().insert(task_id.clone()) {
            return Err(Error::WorkspaceConflict(task_id.to_string()));
        }
        *self
            .acquired
            .lock()
            .unwrap()
            .entry(task_id.clone())
            .or_default() += 1;
        Ok(Workspace {
            task_id: task_id.clone(),
            path: std::env::temp_dir().join(task_id.slug()),
            branch: branch_for(task_id),
        })
    }

    async fn release(&self, task_id: &TaskId, _outcome: ReleaseOutcome) -> Result<()> {
        if !self.active.lock().unwrap().remove(task_id) {
            return Err(Error::Workspace(format!("no workspace for task {}", task_id)));
        }
        *self
            .released
            .lock()
            .unwrap()
            .entry(task_id.clone())
            .or_default() += 1;
        Ok(())
    }
}

/// Store, recorder, and session manager around a [`FakeLauncher`].
pub struct SchedulerHarness {
    pub temp_dir: TempDir,
    pub store: Arc<CoordinationStore>,
    pub recorder: Recorder,
    pub launcher: Arc<FakeLauncher>,
    pub workspaces: Arc<CountingWorkspaces>,
    pub sessions: Arc<AgentSessionManager>,
}

impl SchedulerHarness {
    pub fn new() -> Self {
        Self::build(FakeLauncher::default(), None)
    }

    pub fn with_launcher(launcher: FakeLauncher) -> Self {
        Self::build(launcher, None)
    }

    pub fn with_feed(feed: mpsc::Sender<TransparencyEvent>) -> Self {
        Self::build(FakeLauncher::default(), Some(feed))
    }

    fn build(launcher: FakeLauncher, feed: Option<mpsc::Sender<TransparencyEvent>>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = Arc::new(
            CoordinationStore::open(&temp_dir.path().join("conductor.db"))
                .expect("Failed to open store"),
        );
        let mut recorder = Recorder::new(Arc::clone(&store));
        if let Some(feed) = feed {
            recorder = recorder.with_feed(feed);
        }
        let launcher = Arc::new(launcher);
        let workspaces = Arc::new(CountingWorkspaces::default());
        let sessions = Arc::new(
            AgentSessionManager::new(launcher.clone(), workspaces.clone(), recorder.clone())
                .with_grace(Duration::from_millis(20)),
        );
        Self {
            temp_dir,
            store,
            recorder,
            launcher,
            workspaces,
            sessions,
        }
    }

    pub fn scheduler(
        &self,
        tasks: Vec<TaskNode>,
        policy: ApprovalPolicy,
        config: SchedulerConfig,
    ) -> Result<ExecutionScheduler> {
        ExecutionScheduler::from_plan(
            tasks,
            Arc::clone(&self.sessions),
            ApprovalGate::new(policy, self.recorder.clone()),
            self.recorder.clone(),
            config,
        )
    }
}

pub fn scheduler_config(max_parallel: usize, max_retries: u32) -> SchedulerConfig {
    SchedulerConfig {
        max_parallel,
        task_timeout: Duration::from_secs(10),
        max_retries,
        retry_policy: RetryPolicy::None,
    }
}

pub fn test_task(id: &str) -> TaskNode {
    TaskNode::new(id, &format!("implement {}", id), AgentRole::Backend)
}

/// `width` independent tasks named `t0..`.
pub fn independent_tasks(width: usize) -> Vec<TaskNode> {
    (0..width).map(|i| test_task(&format!("t{}", i))).collect()
}

pub fn ids(ids: &[&str]) -> Vec<TaskId> {
    ids.iter().map(|id| TaskId::from(*id)).collect()
}
