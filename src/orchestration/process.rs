//! Launching agent processes and reading their output.
//!
//! An agent receives its [`TaskEnvelope`] as one JSON line on stdin and
//! reports on stdout. Each stdout line is either a progress chunk or, when it
//! parses as a JSON object carrying a result, the final structured result.
//! The sequence always ends with [`AgentChunk::End`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agent::AgentCommand;
use crate::core::TaskEnvelope;
use crate::workspace::Workspace;
use crate::{Error, Result};

const LINE_BUFFER: usize = 256;
const STDERR_TAIL_LINES: usize = 20;

/// Final structured report from an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: serde_json::Value,
}

impl AgentResult {
    /// Recognize a result object. Accepts the native `{success, ...}` shape
    /// and the headless Claude shape `{type: "result", subtype, result}`.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.get("success").map(|v| v.is_boolean()).unwrap_or(false) {
            return serde_json::from_value(value.clone()).ok();
        }
        if obj.get("type").and_then(|v| v.as_str()) != Some("result") {
            return None;
        }
        let is_error = obj.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false);
        let success = !is_error && obj.get("subtype").and_then(|v| v.as_str()) == Some("success");
        let text = obj.get("result").cloned();
        let mut metrics = serde_json::Map::new();
        for key in ["duration_ms", "num_turns", "total_cost_usd"] {
            if let Some(v) = obj.get(key) {
                metrics.insert(key.to_string(), v.clone());
            }
        }
        Some(Self {
            success,
            output: if success { text.clone() } else { None },
            error: if success {
                None
            } else {
                obj.get("error")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .or_else(|| text.and_then(|v| v.as_str().map(str::to_string)))
                    .or_else(|| Some("agent reported an error".to_string()))
            },
            metrics: serde_json::Value::Object(metrics),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentChunk {
    Progress(String),
    Result(AgentResult),
    /// Terminal marker: the process has exited.
    End {
        exit_code: Option<i32>,
        stderr: Option<String>,
    },
}

impl AgentChunk {
    pub fn parse_line(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
                if let Some(result) = AgentResult::from_value(&value) {
                    return AgentChunk::Result(result);
                }
            }
        }
        AgentChunk::Progress(line.to_string())
    }
}

/// A running agent.
#[async_trait]
pub trait AgentProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// The next output chunk. Returns `None` once `End` has been yielded.
    async fn next_chunk(&mut self) -> Option<AgentChunk>;

    /// Ask the process to stop, force-kill after `grace`. Returns the exit code.
    async fn terminate(&mut self, grace: Duration) -> Result<Option<i32>>;
}

/// Starts agent processes.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(
        &self,
        envelope: &TaskEnvelope,
        workspace: &Workspace,
    ) -> Result<Box<dyn AgentProcess>>;
}

/// Launches the configured agent command as a child process.
pub struct ProcessLauncher {
    command: AgentCommand,
}

impl ProcessLauncher {
    pub fn new(command: AgentCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    async fn launch(
        &self,
        envelope: &TaskEnvelope,
        workspace: &Workspace,
    ) -> Result<Box<dyn AgentProcess>> {
        let binary = self.command.resolve()?;
        debug!(
            task_id = %envelope.id,
            binary = %binary.display(),
            cwd = %workspace.path.display(),
            "launching agent"
        );

        let mut cmd = Command::new(&binary);
        cmd.args(self.command.args())
            .current_dir(&workspace.path)
            .env("CONDUCTOR_TASK_ID", envelope.id.as_str())
            .env("CONDUCTOR_WORKSPACE", &workspace.path)
            .env("CONDUCTOR_BRANCH", &workspace.branch)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = &envelope.config.environment {
            cmd.envs(env);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::AgentSpawn(format!("{}: {}", binary.display(), e)))?;

        let mut payload = serde_json::to_vec(envelope)?;
        payload.push(b'\n');
        if let Some(mut stdin) = child.stdin.take() {
            // Dropping stdin after the write signals end of input.
            if let Err(e) = stdin.write_all(&payload).await {
                warn!(task_id = %envelope.id, error = %e, "agent closed stdin early");
            }
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::AgentSpawn("agent stdout not captured".to_string()))?;
        let (line_tx, lines) = mpsc::channel(LINE_BUFFER);
        tokio::spawn(pump_lines(stdout, line_tx));

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_pump = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_tail(stderr, Arc::clone(&stderr_tail))));

        Ok(Box::new(ChildProcess {
            pid: child.id(),
            child,
            lines,
            stderr_tail,
            stderr_pump,
            finished: false,
        }))
    }
}

async fn pump_lines<R>(rd: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(rd).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "agent stdout read failed");
                break;
            }
        }
    }
}

async fn collect_tail<R>(rd: R, tail: Arc<Mutex<VecDeque<String>>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(rd).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}

struct ChildProcess {
    child: Child,
    pid: Option<u32>,
    lines: mpsc::Receiver<String>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_pump: Option<JoinHandle<()>>,
    finished: bool,
}

impl ChildProcess {
    fn stderr(&self) -> Option<String> {
        let tail = self.stderr_tail.lock().ok()?;
        if tail.is_empty() {
            None
        } else {
            Some(tail.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }
}

#[async_trait]
impl AgentProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn next_chunk(&mut self) -> Option<AgentChunk> {
        if self.finished {
            return None;
        }
        if let Some(line) = self.lines.recv().await {
            return Some(AgentChunk::parse_line(&line));
        }

        // stdout closed: the process is exiting.
        let exit_code = match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "wait on agent failed");
                None
            }
        };
        if let Some(pump) = self.stderr_pump.take() {
            let _ = pump.await;
        }
        self.finished = true;
        Some(AgentChunk::End {
            exit_code,
            stderr: self.stderr(),
        })
    }

    async fn terminate(&mut self, grace: Duration) -> Result<Option<i32>> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status.code());
        }

        if let Some(pid) = self.pid {
            send_sigterm(pid);
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status?.code()),
            Err(_) => {
                warn!(pid = ?self.pid, "agent ignored termination, killing");
                self.child.kill().await?;
                Ok(None)
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, "SIGTERM not delivered");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}
