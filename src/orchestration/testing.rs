//! In-crate fakes for unit tests: a scripted agent launcher and a workspace
//! provider that only counts.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::process::{AgentChunk, AgentLauncher, AgentProcess, AgentResult};
use crate::core::{TaskEnvelope, TaskId};
use crate::workspace::{ReleaseOutcome, Workspace, Workspaces};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub enum Script {
    Succeed { delay: Duration },
    Fail { error: String },
    SpawnError,
    Hang,
    /// Hangs, then takes `exit` to stop once asked.
    Stubborn { exit: Duration },
}

impl Script {
    pub fn succeed() -> Self {
        Script::Succeed {
            delay: Duration::ZERO,
        }
    }

    pub fn succeed_after(delay: Duration) -> Self {
        Script::Succeed { delay }
    }

    pub fn fail(error: &str) -> Self {
        Script::Fail {
            error: error.to_string(),
        }
    }

    pub fn spawn_error() -> Self {
        Script::SpawnError
    }

    pub fn hang() -> Self {
        Script::Hang
    }

    pub fn stubborn(exit: Duration) -> Self {
        Script::Stubborn { exit }
    }
}

#[derive(Default)]
pub struct ScriptedLauncher {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    launches: Mutex<Vec<String>>,
    terminations: Arc<Mutex<HashMap<String, usize>>>,
    alive: Arc<AtomicUsize>,
    max_alive: Arc<AtomicUsize>,
}

impl ScriptedLauncher {
    /// Queue behaviours for successive attempts of `task`. Unscripted
    /// attempts succeed.
    pub fn script(&self, task: &str, scripts: Vec<Script>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(task.to_string())
            .or_default()
            .extend(scripts);
    }

    pub fn launch_order(&self) -> Vec<String> {
        self.launches.lock().unwrap().clone()
    }

    pub fn launches(&self, task: &str) -> usize {
        self.launches.lock().unwrap().iter().filter(|t| *t == task).count()
    }

    pub fn terminations(&self, task: &str) -> usize {
        self.terminations
            .lock()
            .unwrap()
            .get(task)
            .copied()
            .unwrap_or(0)
    }

    pub fn max_alive(&self) -> usize {
        self.max_alive.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentLauncher for ScriptedLauncher {
    async fn launch(
        &self,
        envelope: &TaskEnvelope,
        _workspace: &Workspace,
    ) -> Result<Box<dyn AgentProcess>> {
        let task = envelope.id.to_string();
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&task)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(Script::succeed);
        self.launches.lock().unwrap().push(task.clone());

        let mut exit = Duration::ZERO;
        let (delay, chunks, hang) = match script {
            Script::SpawnError => return Err(Error::AgentSpawn(format!("scripted: {}", task))),
            Script::Succeed { delay } => (
                delay,
                vec![
                    AgentChunk::Progress("working".to_string()),
                    AgentChunk::Result(AgentResult {
                        success: true,
                        output: Some(serde_json::json!({"task": task})),
                        error: None,
                        metrics: serde_json::Value::Null,
                    }),
                    AgentChunk::End {
                        exit_code: Some(0),
                        stderr: None,
                    },
                ],
                false,
            ),
            Script::Fail { error } => (
                Duration::ZERO,
                vec![
                    AgentChunk::Result(AgentResult {
                        success: false,
                        output: None,
                        error: Some(error),
                        metrics: serde_json::Value::Null,
                    }),
                    AgentChunk::End {
                        exit_code: Some(1),
                        stderr: None,
                    },
                ],
                false,
            ),
            Script::Hang => (Duration::ZERO, Vec::new(), true),
            Script::Stubborn { exit: slow } => {
                exit = slow;
                (Duration::ZERO, Vec::new(), true)
            }
        };

        let alive = self.alive.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_alive.fetch_max(alive, Ordering::SeqCst);
        Ok(Box::new(FakeProcess {
            task,
            delay,
            chunks: chunks.into(),
            hang,
            exit,
            terminations: Arc::clone(&self.terminations),
            alive: Arc::clone(&self.alive),
        }))
    }
}

struct FakeProcess {
    task: String,
    delay: Duration,
    chunks: VecDeque<AgentChunk>,
    hang: bool,
    exit: Duration,
    terminations: Arc<Mutex<HashMap<String, usize>>>,
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
        Some(4242)
    }

    async fn next_chunk(&mut self) -> Option<AgentChunk> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(std::mem::take(&mut self.delay)).await;
        }
        self.chunks.pop_front()
    }

    async fn terminate(&mut self, _grace: Duration) -> Result<Option<i32>> {
        if !self.exit.is_zero() {
            tokio::time::sleep(self.exit).await;
        }
        *self
            .terminations
            .lock()
            .unwrap()
            .entry(self.task.clone())
            .or_default() += 1;
        self.chunks.clear();
        Ok(None)
    }
}

/// Workspace provider that records every acquire and release.
pub struct TrackingWorkspaces {
    root: PathBuf,
    active: Mutex<HashSet<TaskId>>,
    acquired: Mutex<HashMap<TaskId, usize>>,
    released: Mutex<HashMap<TaskId, Vec<ReleaseOutcome>>>,
}

impl TrackingWorkspaces {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            active: Mutex::new(HashSet::new()),
            acquired: Mutex::new(HashMap::new()),
            released: Mutex::new(HashMap::new()),
        }
    }

    pub fn acquired(&self, task: &str) -> usize {
        self.acquired
            .lock()
            .unwrap()
            .get(&TaskId::from(task))
            .copied()
            .unwrap_or(0)
    }

    pub fn released(&self, task: &str) -> Vec<ReleaseOutcome> {
        self.released
            .lock()
            .unwrap()
            .get(&TaskId::from(task))
            .cloned()
            .unwrap_or_default()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}

#[async_trait]
impl Workspaces for TrackingWorkspaces {
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
            path: self.root.join(task_id.slug()),
            branch: crate::workspace::branch_for(task_id),
        })
    }

    async fn release(&self, task_id: &TaskId, outcome: ReleaseOutcome) -> Result<()> {
        if !self.active.lock().unwrap().remove(task_id) {
            return Err(Error::Workspace(format!("no workspace for task {}", task_id)));
        }
        self.released
            .lock()
            .unwrap()
            .entry(task_id.clone())
            .or_default()
            .push(outcome);
        Ok(())
    }
}
