//! Agent session manager.
//!
//! Owns the mapping from task to running agent process. Each session gets a
//! dedicated reader task that pulls chunks from the process and hands them
//! over a bounded channel; cancelling the session's token makes the reader
//! terminate the process. A session is removed from the registry exactly
//! once, and that removal is what releases its workspace. Teardown runs on
//! its own task, so it finishes even if the caller is dropped.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::process::{AgentChunk, AgentLauncher, AgentProcess, AgentResult};
use super::recorder::Recorder;
use crate::core::{
    kinds, AgentSession, EnvelopeConfig, EventLevel, EventSource, NewEvent, SessionId,
    SessionStatus, TaskEnvelope, TaskId, TaskNode,
};
use crate::workspace::{ReleaseOutcome, Workspace, Workspaces};
use crate::{Error, Result};

const CHUNK_BUFFER: usize = 64;
const PROGRESS_TAIL_LINES: usize = 20;
const MAX_EVENT_MESSAGE: usize = 2000;

/// Lifecycle notifications sent to the scheduler.
#[derive(Debug)]
pub enum SessionEvent {
    /// The agent process is up; the task is now running.
    Started {
        task_id: TaskId,
        session_id: SessionId,
        pid: Option<u32>,
    },
    /// The session has been terminated and its workspace released.
    Finished {
        task_id: TaskId,
        session_id: SessionId,
        result: Result<AgentOutcome>,
    },
}

/// What an agent run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutcome {
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub metrics: Value,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub progress_chunks: u64,
}

impl AgentOutcome {
    fn from_parts(
        result: Option<AgentResult>,
        exit_code: Option<i32>,
        stderr: Option<String>,
        tail: VecDeque<String>,
        progress_chunks: u64,
        elapsed: Duration,
    ) -> Self {
        let duration_ms = elapsed.as_millis() as u64;
        match result {
            Some(r) => Self {
                success: r.success,
                output: r.output,
                error: if r.success {
                    None
                } else {
                    r.error.or(stderr).or_else(|| Some("agent reported failure".to_string()))
                },
                metrics: r.metrics,
                exit_code,
                duration_ms,
                progress_chunks,
            },
            None => {
                // Stream-only agent: the exit code decides.
                let success = exit_code == Some(0);
                let output = (!tail.is_empty())
                    .then(|| Value::String(tail.into_iter().collect::<Vec<_>>().join("\n")));
                let error = (!success).then(|| {
                    stderr.unwrap_or_else(|| match exit_code {
                        Some(code) => format!("agent exited with code {}", code),
                        None => "agent terminated by signal".to_string(),
                    })
                });
                Self {
                    success,
                    output,
                    error,
                    metrics: Value::Null,
                    exit_code,
                    duration_ms,
                    progress_chunks,
                }
            }
        }
    }
}

/// The receiving side of a session's output.
pub struct SessionOutput {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub pid: Option<u32>,
    chunks: mpsc::Receiver<AgentChunk>,
    started: Instant,
}

struct ActiveSession {
    session: AgentSession,
    task_id: TaskId,
    cancel: CancellationToken,
    reader: JoinHandle<Option<i32>>,
}

pub struct AgentSessionManager {
    launcher: Arc<dyn AgentLauncher>,
    workspaces: Arc<dyn Workspaces>,
    recorder: Recorder,
    grace: Duration,
    envelope_config: EnvelopeConfig,
    sessions: Mutex<HashMap<SessionId, ActiveSession>>,
}

impl AgentSessionManager {
    pub fn new(
        launcher: Arc<dyn AgentLauncher>,
        workspaces: Arc<dyn Workspaces>,
        recorder: Recorder,
    ) -> Self {
        Self {
            launcher,
            workspaces,
            recorder,
            grace: Duration::from_millis(crate::config::DEFAULT_TERMINATION_GRACE_MS),
            envelope_config: EnvelopeConfig::default(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// How long a process gets to exit after being asked to stop.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Config block included in every envelope.
    pub fn with_envelope_config(mut self, config: EnvelopeConfig) -> Self {
        self.envelope_config = config;
        self
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn active_sessions(&self) -> Vec<AgentSession> {
        self.sessions
            .lock()
            .await
            .values()
            .map(|a| a.session.clone())
            .collect()
    }

    /// Launch the agent for `task` inside `workspace`.
    ///
    /// On error nothing is registered; the caller still owns the workspace.
    pub async fn spawn(
        &self,
        task: &TaskNode,
        session_id: SessionId,
        workspace: &Workspace,
    ) -> Result<SessionOutput> {
        let envelope = TaskEnvelope::from_task(
            task,
            workspace.path.clone(),
            self.envelope_config.clone(),
        );
        let mut process = self.launcher.launch(&envelope, workspace).await?;
        let pid = process.pid();

        let mut session =
            AgentSession::new(task.agent_role, workspace.path.clone(), &workspace.branch)
                .with_id(session_id);
        session.bind(task.id.clone(), pid);

        let recorded = self
            .recorder
            .record_session(
                &session,
                NewEvent::session_status(
                    kinds::SESSION_STARTED,
                    &session.id,
                    &task.id,
                    SessionStatus::Busy,
                )
                .meta("branch", workspace.branch.as_str())
                .meta("pid", pid),
            )
            .await;
        if let Err(e) = recorded {
            let _ = process.terminate(self.grace).await;
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        let reader = tokio::spawn(read_chunks(process, tx, cancel.clone(), self.grace));

        info!(
            task_id = %task.id,
            session_id = %session.id,
            pid = ?pid,
            "agent session started"
        );
        let output = SessionOutput {
            session_id: session.id.clone(),
            task_id: task.id.clone(),
            pid,
            chunks: rx,
            started: Instant::now(),
        };
        self.sessions.lock().await.insert(
            session.id.clone(),
            ActiveSession {
                session,
                task_id: task.id.clone(),
                cancel,
                reader,
            },
        );
        Ok(output)
    }

    /// Acquire a workspace for `task` and spawn its agent there.
    ///
    /// If anything after acquisition fails, the workspace is released before
    /// the error is returned.
    pub async fn start(&self, task: &TaskNode, session_id: SessionId) -> Result<SessionOutput> {
        let workspace = self.workspaces.acquire(&task.id).await?;
        let started = async {
            self.recorder
                .record(
                    NewEvent::new(
                        EventSource::Workspace,
                        kinds::WORKSPACE_ACQUIRED,
                        format!("workspace {} acquired", workspace.path.display()),
                    )
                    .task(&task.id)
                    .session(&session_id)
                    .meta("path", workspace.path.to_string_lossy().to_string())
                    .meta("branch", workspace.branch.as_str()),
                )
                .await?;
            self.spawn(task, session_id.clone(), &workspace).await
        }
        .await;

        match started {
            Ok(output) => Ok(output),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "agent failed to start");
                if let Err(release) = release_workspace(
                    self.workspaces.as_ref(),
                    &self.recorder,
                    &task.id,
                    Some(&session_id),
                    ReleaseOutcome::Failure,
                )
                .await
                {
                    if release.is_fatal_to_run() {
                        return Err(release);
                    }
                }
                Err(e)
            }
        }
    }

    /// Wait for the session's result. On timeout the session is
    /// force-terminated and `AgentTimeout` is returned.
    pub async fn await_result(
        &self,
        output: &mut SessionOutput,
        timeout: Duration,
    ) -> Result<AgentOutcome> {
        let result = self.wait(output, timeout).await;
        if matches!(result, Err(Error::AgentTimeout(_))) {
            self.terminate(&output.session_id, ReleaseOutcome::Failure)
                .await?;
        }
        result
    }

    /// Collect the result or give up after `timeout`. Never terminates.
    async fn wait(&self, output: &mut SessionOutput, timeout: Duration) -> Result<AgentOutcome> {
        match tokio::time::timeout(timeout, self.collect(output)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    task_id = %output.task_id,
                    session_id = %output.session_id,
                    timeout_secs = timeout.as_secs(),
                    "agent timed out"
                );
                self.recorder
                    .record(
                        NewEvent::new(
                            EventSource::SessionManager,
                            kinds::AGENT_OUTPUT,
                            format!("agent timed out after {:?}", timeout),
                        )
                        .task(&output.task_id)
                        .session(&output.session_id)
                        .outcome(false, Some("timeout")),
                    )
                    .await?;
                Err(Error::AgentTimeout(timeout))
            }
        }
    }

    async fn collect(&self, output: &mut SessionOutput) -> Result<AgentOutcome> {
        let mut result = None;
        let mut tail = VecDeque::new();
        let mut progress = 0u64;

        while let Some(chunk) = output.chunks.recv().await {
            match chunk {
                AgentChunk::Progress(line) => {
                    progress += 1;
                    self.recorder
                        .record(
                            NewEvent::new(EventSource::Agent, kinds::AGENT_OUTPUT, truncate(&line))
                                .task(&output.task_id)
                                .session(&output.session_id)
                                .level(EventLevel::Debug),
                        )
                        .await?;
                    if tail.len() == PROGRESS_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                AgentChunk::Result(r) => {
                    let mut event = NewEvent::new(
                        EventSource::Agent,
                        kinds::AGENT_OUTPUT,
                        "agent reported result",
                    )
                    .task(&output.task_id)
                    .session(&output.session_id)
                    .outcome(r.success, r.error.as_deref());
                    if !r.metrics.is_null() {
                        event = event.meta("metrics", r.metrics.clone());
                    }
                    self.recorder.record(event).await?;
                    result = Some(r);
                }
                AgentChunk::End { exit_code, stderr } => {
                    let outcome = AgentOutcome::from_parts(
                        result,
                        exit_code,
                        stderr,
                        tail,
                        progress,
                        output.started.elapsed(),
                    );
                    if let Some(active) = self.sessions.lock().await.get_mut(&output.session_id) {
                        active.session.metrics.output_chunks = progress;
                        active.session.metrics.exit_code = exit_code;
                    }
                    return Ok(outcome);
                }
            }
        }
        // Reader stopped without an end marker: the session was terminated.
        Err(Error::Cancelled)
    }

    /// Stop the session's process and release its workspace.
    ///
    /// Returns `false` if the session was already terminated.
    pub async fn terminate(&self, session_id: &SessionId, outcome: ReleaseOutcome) -> Result<bool> {
        let Some(active) = self.sessions.lock().await.remove(session_id) else {
            return Ok(false);
        };
        let teardown = tokio::spawn(teardown(
            active,
            Arc::clone(&self.workspaces),
            self.recorder.clone(),
            self.grace,
            session_id.clone(),
            outcome,
        ));
        teardown
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?
            .map(|_| true)
    }

    /// Clear workspaces an earlier process left behind for `task_ids`.
    pub async fn reclaim_workspaces(&self, task_ids: &[TaskId]) -> Result<usize> {
        let reclaimed = self.workspaces.reclaim(task_ids).await?;
        for task_id in &reclaimed {
            self.recorder
                .record(
                    NewEvent::new(
                        EventSource::Workspace,
                        kinds::WORKSPACE_RELEASED,
                        format!("stale workspace for {} reclaimed", task_id),
                    )
                    .task(task_id)
                    .level(EventLevel::Warn)
                    .meta("outcome", "reclaimed")
                    .outcome(true, None),
                )
                .await?;
        }
        Ok(reclaimed.len())
    }

    /// Terminate every live session. Returns how many were terminated.
    pub async fn terminate_all(&self, outcome: ReleaseOutcome) -> Result<usize> {
        let ids: Vec<SessionId> = self.sessions.lock().await.keys().cloned().collect();
        let mut terminated = 0;
        let mut first_error = None;
        for id in ids {
            match self.terminate(&id, outcome).await {
                Ok(true) => terminated += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(session_id = %id, error = %e, "terminate failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(terminated),
        }
    }

    /// Full session lifecycle for one attempt: start, wait, terminate.
    ///
    /// The session is terminated exactly once whatever the exit path.
    /// `Started` is sent on `events` once the process is running.
    pub async fn run(
        &self,
        task: &TaskNode,
        session_id: SessionId,
        timeout: Duration,
        cancel: CancellationToken,
        events: &mpsc::Sender<SessionEvent>,
    ) -> Result<AgentOutcome> {
        let mut output = self.start(task, session_id).await?;
        let _ = events
            .send(SessionEvent::Started {
                task_id: task.id.clone(),
                session_id: output.session_id.clone(),
                pid: output.pid,
            })
            .await;

        // Only the wait races the cancel; teardown below always runs once.
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = self.wait(&mut output, timeout) => r,
        };

        let outcome = match &result {
            Ok(o) if o.success => ReleaseOutcome::Success,
            Err(Error::Cancelled) => ReleaseOutcome::Cancelled,
            _ => ReleaseOutcome::Failure,
        };
        match self.terminate(&output.session_id, outcome).await {
            Ok(_) => result,
            Err(e) if e.is_fatal_to_run() => Err(e),
            Err(e) => match result {
                // Work that cannot be released cleanly is not a success.
                Ok(o) if o.success => Err(e),
                other => other,
            },
        }
    }
}

async fn teardown(
    mut active: ActiveSession,
    workspaces: Arc<dyn Workspaces>,
    recorder: Recorder,
    grace: Duration,
    session_id: SessionId,
    outcome: ReleaseOutcome,
) -> Result<()> {
    active.cancel.cancel();
    let wait = grace * 2 + Duration::from_secs(1);
    let exit_code = match tokio::time::timeout(wait, &mut active.reader).await {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => {
            warn!(session_id = %session_id, error = %e, "session reader panicked");
            None
        }
        Err(_) => {
            warn!(session_id = %session_id, "session reader did not stop, aborting");
            active.reader.abort();
            None
        }
    };
    if active.session.metrics.exit_code.is_none() {
        active.session.metrics.exit_code = exit_code;
    }

    let released = release_workspace(
        workspaces.as_ref(),
        &recorder,
        &active.task_id,
        Some(&session_id),
        outcome,
    )
    .await;

    active.session.terminate();
    recorder
        .record_session(
            &active.session,
            NewEvent::session_status(
                kinds::SESSION_TERMINATED,
                &session_id,
                &active.task_id,
                SessionStatus::Terminated,
            )
            .meta("outcome", outcome.as_str())
            .meta("exit_code", active.session.metrics.exit_code)
            .duration(active.session.metrics.duration_ms.unwrap_or(0)),
        )
        .await?;
    debug!(session_id = %session_id, outcome = outcome.as_str(), "session terminated");
    released
}

async fn release_workspace(
    workspaces: &dyn Workspaces,
    recorder: &Recorder,
    task_id: &TaskId,
    session_id: Option<&SessionId>,
    outcome: ReleaseOutcome,
) -> Result<()> {
    let released = workspaces.release(task_id, outcome).await;
    let error = released.as_ref().err().map(|e| e.to_string());
    let mut event = NewEvent::new(
        EventSource::Workspace,
        kinds::WORKSPACE_RELEASED,
        format!("workspace for {} released ({})", task_id, outcome.as_str()),
    )
    .task(task_id)
    .meta("outcome", outcome.as_str())
    .outcome(released.is_ok(), error.as_deref());
    if let Some(session_id) = session_id {
        event = event.session(session_id);
    }
    recorder.record(event).await?;
    released
}

async fn read_chunks(
    mut process: Box<dyn AgentProcess>,
    tx: mpsc::Sender<AgentChunk>,
    cancel: CancellationToken,
    grace: Duration,
) -> Option<i32> {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return stop(&mut process, grace).await,
            chunk = process.next_chunk() => chunk,
        };
        let Some(chunk) = chunk else {
            return None;
        };
        let exit = match &chunk {
            AgentChunk::End { exit_code, .. } => Some(*exit_code),
            _ => None,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return stop(&mut process, grace).await,
            _ = tx.send(chunk) => {}
        }
        if let Some(code) = exit {
            return code;
        }
    }
}

async fn stop(process: &mut Box<dyn AgentProcess>, grace: Duration) -> Option<i32> {
    match process.terminate(grace).await {
        Ok(code) => code,
        Err(e) => {
            warn!(pid = ?process.pid(), error = %e, "failed to terminate agent");
            None
        }
    }
}

fn truncate(line: &str) -> String {
    if line.len() <= MAX_EVENT_MESSAGE {
        return line.to_string();
    }
    let mut end = MAX_EVENT_MESSAGE;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &line[..end])
}
