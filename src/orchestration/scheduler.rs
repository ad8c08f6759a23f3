//! Scheduler for parallel task execution.
//!
//! A single coordinating loop owns the task graph. It computes the ready set,
//! passes candidates through the approval gate, dispatches them to agent
//! sessions up to the concurrency cap, and folds session results back into
//! the graph. Sessions run as independent tokio tasks and report over a
//! bounded channel, so a slow agent never stalls dispatch of its siblings.
//!
//! Every status change is persisted with its transparency event before the
//! loop moves on. A failed store write halts the run: remaining sessions are
//! cancelled and their workspaces released before the error is returned.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::approval::{ApprovalGate, ApprovalState, GateDecision};
use super::recorder::Recorder;
use super::retry::RetryPolicy;
use super::session::{AgentOutcome, AgentSessionManager, SessionEvent};
use crate::config::Config;
use crate::core::{
    kinds, EventLevel, EventSource, NewEvent, SessionId, TaskDAG, TaskId, TaskNode, TaskStatus,
};
use crate::workspace::ReleaseOutcome;
use crate::{Error, Result};

const SESSION_EVENT_BUFFER: usize = 64;
const COMMAND_BUFFER: usize = 16;
const HALT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Numeric policy for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub max_parallel: usize,
    pub task_timeout: Duration,
    pub max_retries: u32,
    pub retry_policy: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_parallel: config.max_parallel_agents,
            task_timeout: config.task_timeout(),
            max_retries: config.max_retries,
            retry_policy: config.retry_backoff.clone(),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub completed: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub blocked: Vec<TaskId>,
    /// Tasks left pending by a cancelled run.
    pub unfinished: Vec<TaskId>,
    /// Dispatch attempts per task.
    pub attempts: BTreeMap<TaskId, u32>,
    /// Task ids in the order they were handed to a session.
    pub dispatch_order: Vec<TaskId>,
    pub max_observed_running: usize,
    pub cancelled: bool,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.failed.is_empty()
            && self.blocked.is_empty()
            && self.unfinished.is_empty()
    }
}

enum Command {
    Decide {
        task_id: TaskId,
        approved: bool,
        reply: oneshot::Sender<Result<ApprovalState>>,
    },
    CancelTask {
        task_id: TaskId,
        reply: oneshot::Sender<Result<bool>>,
    },
}

/// Control surface for a running scheduler. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

impl SchedulerHandle {
    /// Approve or reject a task waiting at the approval gate.
    pub async fn decide(&self, task_id: &TaskId, approved: bool) -> Result<ApprovalState> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Decide {
                task_id: task_id.clone(),
                approved,
                reply,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Cancel one task. Its transitive dependents become blocked; the rest of
    /// the graph keeps running. Returns `false` if the task already finished.
    pub async fn cancel_task(&self, task_id: &TaskId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::CancelTask {
                task_id: task_id.clone(),
                reply,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Cancel the whole run. Active sessions are terminated and their tasks
    /// returned to `pending`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct RunningTask {
    session_id: SessionId,
    cancel: CancellationToken,
}

enum Step {
    Session(SessionEvent),
    Command(Command),
    Cancel,
    Tick,
}

pub struct ExecutionScheduler {
    dag: TaskDAG,
    sessions: Arc<AgentSessionManager>,
    gate: ApprovalGate,
    recorder: Recorder,
    config: SchedulerConfig,
    cancel: CancellationToken,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: mpsc::Receiver<Command>,
    running: HashMap<TaskId, RunningTask>,
    /// Retried tasks held out of the ready set until their backoff elapses.
    not_before: HashMap<TaskId, Instant>,
    /// Running tasks cancelled individually; their result is a terminal failure.
    cancelled_tasks: HashSet<TaskId>,
    report: RunReport,
}

impl ExecutionScheduler {
    /// Scheduler over a graph that is already persisted.
    pub fn new(
        dag: TaskDAG,
        sessions: Arc<AgentSessionManager>,
        gate: ApprovalGate,
        recorder: Recorder,
        config: SchedulerConfig,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        Self {
            dag,
            sessions,
            gate,
            recorder,
            config,
            cancel: CancellationToken::new(),
            commands_tx,
            commands_rx,
            running: HashMap::new(),
            not_before: HashMap::new(),
            cancelled_tasks: HashSet::new(),
            report: RunReport::default(),
        }
    }

    /// Build the graph from validated tasks and persist it in one transaction.
    pub fn from_plan(
        tasks: Vec<TaskNode>,
        sessions: Arc<AgentSessionManager>,
        gate: ApprovalGate,
        recorder: Recorder,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let dag = TaskDAG::from_tasks(tasks)?;
        dag.topological_order()?;
        let tasks: Vec<TaskNode> = dag.all_tasks().into_iter().cloned().collect();
        recorder.persist_graph(&tasks)?;
        info!(
            tasks = dag.task_count(),
            dependencies = dag.dependency_count(),
            "task graph persisted"
        );
        Ok(Self::new(dag, sessions, gate, recorder, config))
    }

    /// Rebuild the scheduler from every task in the store.
    ///
    /// Attempts that were in flight when the previous process died are
    /// discarded: their tasks go back to `pending`, and any worktree or
    /// branch left for a task that is going to run is reclaimed. Dependents
    /// of tasks that already failed are blocked.
    pub async fn resume(
        sessions: Arc<AgentSessionManager>,
        gate: ApprovalGate,
        recorder: Recorder,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let mut tasks = recorder.store().load_tasks()?;
        for task in tasks.iter_mut().filter(|t| t.status.is_active()) {
            let session = task.assigned_session.clone();
            task.reset_interrupted();
            let mut event =
                NewEvent::task_status(EventSource::Scheduler, &task.id, TaskStatus::Pending)
                    .level(EventLevel::Warn)
                    .meta("reason", "interrupted");
            if let Some(session) = &session {
                event = event.session(session);
            }
            recorder.transition(task, event)?;
            warn!(task_id = %task.id, "interrupted attempt discarded");
        }

        let runnable: Vec<TaskId> = tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
            .map(|t| t.id.clone())
            .collect();
        let reclaimed = sessions.reclaim_workspaces(&runnable).await?;
        if reclaimed > 0 {
            info!(reclaimed, "stale workspaces cleared before resuming");
        }

        let dag = TaskDAG::from_tasks(tasks)?;
        let failed: Vec<TaskId> = dag
            .all_tasks()
            .into_iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Blocked))
            .map(|t| t.id.clone())
            .collect();

        let mut scheduler = Self::new(dag, sessions, gate, recorder, config);
        for id in failed {
            scheduler.block_dependents(&id)?;
        }
        info!(tasks = scheduler.dag.task_count(), "scheduler resumed from store");
        Ok(scheduler)
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            commands: self.commands_tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn dag(&self) -> &TaskDAG {
        &self.dag
    }

    /// Drive the graph until every task is resolved or the run is cancelled.
    pub async fn run(mut self) -> Result<RunReport> {
        let (events_tx, mut events_rx) = mpsc::channel(SESSION_EVENT_BUFFER);
        info!(
            tasks = self.dag.task_count(),
            max_parallel = self.max_parallel(),
            "scheduler started"
        );

        match self.drive(&events_tx, &mut events_rx).await {
            Ok(()) => self.finish().await,
            Err(e) => {
                warn!(error = %e, "scheduler halted");
                self.halt(&mut events_rx).await;
                Err(e)
            }
        }
    }

    fn max_parallel(&self) -> usize {
        self.config.max_parallel.max(1)
    }

    async fn drive(
        &mut self,
        events_tx: &mpsc::Sender<SessionEvent>,
        events_rx: &mut mpsc::Receiver<SessionEvent>,
    ) -> Result<()> {
        loop {
            if !self.report.cancelled {
                self.dispatch_ready(events_tx)?;
            }

            if self.running.is_empty() {
                if self.report.cancelled || !self.has_pending_work() {
                    return Ok(());
                }
                if self.gate.pending().is_empty() && self.not_before.is_empty() {
                    // Nothing running, nothing waiting, yet work remains.
                    self.block_unreachable()?;
                    return Ok(());
                }
            }

            let wake = self.not_before.values().min().copied();
            let step = tokio::select! {
                Some(event) = events_rx.recv() => Step::Session(event),
                Some(command) = self.commands_rx.recv() => Step::Command(command),
                _ = self.cancel.cancelled(), if !self.report.cancelled => Step::Cancel,
                _ = tokio::time::sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => Step::Tick,
            };

            match step {
                Step::Session(event) => self.on_session_event(event)?,
                Step::Command(command) => self.on_command(command)?,
                Step::Cancel => {
                    info!(running = self.running.len(), "run cancelled");
                    self.report.cancelled = true;
                }
                Step::Tick => {
                    let now = Instant::now();
                    self.not_before.retain(|_, at| *at > now);
                }
            }
        }
    }

    fn has_pending_work(&self) -> bool {
        self.dag.all_tasks().iter().any(|t| t.can_start())
    }

    /// Hand ready tasks to the gate, then dispatch what it lets through while
    /// capacity remains.
    fn dispatch_ready(&mut self, events: &mpsc::Sender<SessionEvent>) -> Result<()> {
        let now = Instant::now();
        let candidates: Vec<TaskId> = self
            .dag
            .ready_set()
            .into_iter()
            .filter(|t| !self.running.contains_key(&t.id))
            .filter(|t| self.not_before.get(&t.id).map_or(true, |at| *at <= now))
            .map(|t| t.id.clone())
            .collect();

        for id in candidates {
            let decision = {
                let task = self.dag.task(&id)?;
                self.gate.submit(task)?
            };
            match decision {
                GateDecision::Pending => self.park(&id)?,
                GateDecision::Rejected => {
                    self.fail_terminal(&id, &Error::ApprovalRejected(id.to_string()).to_string())?
                }
                GateDecision::Bypass | GateDecision::Approved => {
                    if self.running.len() < self.max_parallel() {
                        self.dispatch(&id, events)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn park(&mut self, id: &TaskId) -> Result<()> {
        let task = self.dag.task_mut(id)?;
        if task.status == TaskStatus::Ready {
            return Ok(());
        }
        task.mark_ready();
        let task = task.clone();
        self.recorder.transition(
            &task,
            NewEvent::task_status(EventSource::Scheduler, id, TaskStatus::Ready)
                .meta("approval", ApprovalState::PendingApproval.as_str()),
        )?;
        Ok(())
    }

    fn dispatch(&mut self, id: &TaskId, events: &mpsc::Sender<SessionEvent>) -> Result<()> {
        let session_id = SessionId::new();
        let task = self.dag.task_mut(id)?;
        task.assign(session_id.clone());
        let snapshot = task.clone();
        self.recorder.transition(
            &snapshot,
            NewEvent::task_status(EventSource::Scheduler, id, TaskStatus::Assigned)
                .session(&session_id)
                .meta("attempt", snapshot.metrics.attempts),
        )?;

        self.not_before.remove(id);
        let token = self.cancel.child_token();
        self.running.insert(
            id.clone(),
            RunningTask {
                session_id: session_id.clone(),
                cancel: token.clone(),
            },
        );
        self.report.dispatch_order.push(id.clone());
        self.report.max_observed_running = self.report.max_observed_running.max(self.running.len());
        info!(
            task_id = %id,
            session_id = %session_id,
            attempt = snapshot.metrics.attempts,
            running = self.running.len(),
            "task dispatched"
        );

        let sessions = Arc::clone(&self.sessions);
        let events = events.clone();
        let timeout = self.config.task_timeout;
        tokio::spawn(async move {
            let result = sessions
                .run(&snapshot, session_id.clone(), timeout, token, &events)
                .await;
            let _ = events
                .send(SessionEvent::Finished {
                    task_id: snapshot.id,
                    session_id,
                    result,
                })
                .await;
        });
        Ok(())
    }

    fn on_session_event(&mut self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Started {
                task_id,
                session_id,
                pid,
            } => {
                if !self.is_current(&task_id, &session_id) {
                    return Ok(());
                }
                let task = self.dag.task_mut(&task_id)?;
                if task.status != TaskStatus::Assigned {
                    return Ok(());
                }
                task.start();
                let task = task.clone();
                self.recorder.transition(
                    &task,
                    NewEvent::task_status(EventSource::Scheduler, &task_id, TaskStatus::Running)
                        .session(&session_id)
                        .meta("pid", pid),
                )?;
                debug!(task_id = %task_id, pid = ?pid, "task running");
                Ok(())
            }
            SessionEvent::Finished {
                task_id,
                session_id,
                result,
            } => {
                if !self.is_current(&task_id, &session_id) {
                    return Ok(());
                }
                self.running.remove(&task_id);
                let cancelled_alone = self.cancelled_tasks.remove(&task_id);
                self.on_finished(&task_id, &session_id, result, cancelled_alone)
            }
        }
    }

    fn is_current(&self, task_id: &TaskId, session_id: &SessionId) -> bool {
        self.running
            .get(task_id)
            .map(|r| &r.session_id == session_id)
            .unwrap_or(false)
    }

    fn on_finished(
        &mut self,
        task_id: &TaskId,
        session_id: &SessionId,
        result: Result<AgentOutcome>,
        cancelled_alone: bool,
    ) -> Result<()> {
        match result {
            Ok(outcome) if outcome.success => {
                let task = self.dag.task_mut(task_id)?;
                task.complete(outcome.output.clone(), Some(outcome.duration_ms));
                let task = task.clone();
                self.recorder.transition(
                    &task,
                    NewEvent::task_status(EventSource::Scheduler, task_id, TaskStatus::Completed)
                        .session(session_id)
                        .duration(outcome.duration_ms)
                        .outcome(true, None)
                        .meta("exit_code", outcome.exit_code),
                )?;
                info!(task_id = %task_id, duration_ms = outcome.duration_ms, "task completed");
                Ok(())
            }
            Ok(outcome) => {
                let error = outcome
                    .error
                    .unwrap_or_else(|| "agent reported failure".to_string());
                self.on_attempt_failed(task_id, &error)
            }
            Err(Error::Cancelled) if cancelled_alone => {
                self.fail_terminal(task_id, "cancelled by operator")
            }
            Err(Error::Cancelled) => {
                let task = self.dag.task_mut(task_id)?;
                task.reset_interrupted();
                let task = task.clone();
                self.recorder.transition(
                    &task,
                    NewEvent::task_status(EventSource::Scheduler, task_id, TaskStatus::Pending)
                        .session(session_id)
                        .level(EventLevel::Warn)
                        .meta("reason", "run cancelled"),
                )?;
                Ok(())
            }
            Err(e) if e.is_fatal_to_run() => Err(e),
            Err(e) if e.is_retryable() => self.on_attempt_failed(task_id, &e.to_string()),
            Err(e) => self.fail_terminal(task_id, &e.to_string()),
        }
    }

    /// Requeue while retries remain, otherwise fail terminally.
    fn on_attempt_failed(&mut self, task_id: &TaskId, error: &str) -> Result<()> {
        let max_retries = self.config.max_retries;
        let task = self.dag.task_mut(task_id)?;
        if task.metrics.retries >= max_retries {
            return self.fail_terminal(task_id, error);
        }

        task.retry(error);
        let task = task.clone();
        let delay = self.config.retry_policy.delay_for(task.metrics.retries);
        self.recorder.transition(
            &task,
            NewEvent::task_status(EventSource::Scheduler, task_id, TaskStatus::Pending)
                .outcome(false, Some(error))
                .meta("retry", task.metrics.retries)
                .meta("delay_ms", delay.as_millis() as u64),
        )?;
        if !delay.is_zero() {
            self.not_before.insert(task_id.clone(), Instant::now() + delay);
        }
        warn!(
            task_id = %task_id,
            retry = task.metrics.retries,
            max_retries,
            error,
            "task failed, requeued"
        );
        Ok(())
    }

    fn fail_terminal(&mut self, task_id: &TaskId, error: &str) -> Result<()> {
        let task = self.dag.task_mut(task_id)?;
        task.fail(error);
        let task = task.clone();
        self.recorder.transition(
            &task,
            NewEvent::task_status(EventSource::Scheduler, task_id, TaskStatus::Failed)
                .level(EventLevel::Error)
                .outcome(false, Some(error))
                .meta("attempts", task.metrics.attempts),
        )?;
        self.not_before.remove(task_id);
        self.gate.withdraw(task_id);
        warn!(task_id = %task_id, error, "task failed");
        self.block_dependents(task_id)
    }

    /// Block every transitive dependent of `task_id` that has not finished.
    fn block_dependents(&mut self, task_id: &TaskId) -> Result<()> {
        let reason = format!("dependency {} did not complete", task_id);
        for id in self.dag.transitive_dependents(task_id) {
            if self.running.contains_key(&id) {
                continue;
            }
            let task = self.dag.task_mut(&id)?;
            if task.is_finished() {
                continue;
            }
            task.block(&reason);
            let task = task.clone();
            self.recorder.transition(
                &task,
                NewEvent::task_status(EventSource::Scheduler, &id, TaskStatus::Blocked)
                    .level(EventLevel::Warn)
                    .meta("blocked_by", task_id.as_str()),
            )?;
            self.not_before.remove(&id);
            self.gate.withdraw(&id);
            debug!(task_id = %id, blocked_by = %task_id, "task blocked");
        }
        Ok(())
    }

    fn block_unreachable(&mut self) -> Result<()> {
        let stuck: Vec<TaskId> = self
            .dag
            .all_tasks()
            .into_iter()
            .filter(|t| t.can_start())
            .map(|t| t.id.clone())
            .collect();
        for id in stuck {
            let task = self.dag.task_mut(&id)?;
            task.block("unsatisfiable dependencies");
            let task = task.clone();
            self.recorder.transition(
                &task,
                NewEvent::task_status(EventSource::Scheduler, &id, TaskStatus::Blocked)
                    .level(EventLevel::Warn)
                    .meta("reason", "unsatisfiable dependencies"),
            )?;
            warn!(task_id = %id, "task can never become ready");
        }
        Ok(())
    }

    fn on_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Decide {
                task_id,
                approved,
                reply,
            } => match self.gate.decide(&task_id, approved) {
                Ok(state) => {
                    if state == ApprovalState::Rejected {
                        let error = Error::ApprovalRejected(task_id.to_string()).to_string();
                        if let Err(e) = self.fail_terminal(&task_id, &error) {
                            let _ = reply.send(Err(Error::StoreWrite(e.to_string())));
                            return Err(e);
                        }
                    }
                    let _ = reply.send(Ok(state));
                    Ok(())
                }
                Err(e) if e.is_fatal_to_run() => {
                    let _ = reply.send(Err(Error::StoreWrite(e.to_string())));
                    Err(e)
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Ok(())
                }
            },
            Command::CancelTask { task_id, reply } => {
                let result = self.cancel_task(&task_id);
                match result {
                    Err(e) if e.is_fatal_to_run() => {
                        let _ = reply.send(Err(Error::StoreWrite(e.to_string())));
                        Err(e)
                    }
                    other => {
                        let _ = reply.send(other);
                        Ok(())
                    }
                }
            }
        }
    }

    fn cancel_task(&mut self, task_id: &TaskId) -> Result<bool> {
        if let Some(running) = self.running.get(task_id) {
            info!(task_id = %task_id, "cancelling running task");
            running.cancel.cancel();
            self.cancelled_tasks.insert(task_id.clone());
            return Ok(true);
        }
        if self.dag.task(task_id)?.is_finished() {
            return Ok(false);
        }
        self.fail_terminal(task_id, "cancelled by operator")?;
        Ok(true)
    }

    async fn finish(mut self) -> Result<RunReport> {
        if self.report.cancelled {
            self.sessions.terminate_all(ReleaseOutcome::Cancelled).await?;
        }

        let mut report = std::mem::take(&mut self.report);
        report.completed = self.dag.ids_with_status(TaskStatus::Completed);
        report.failed = self.dag.ids_with_status(TaskStatus::Failed);
        report.blocked = self.dag.ids_with_status(TaskStatus::Blocked);
        report.unfinished = self
            .dag
            .all_tasks()
            .into_iter()
            .filter(|t| !t.is_finished())
            .map(|t| t.id.clone())
            .collect();
        report.attempts = self
            .dag
            .all_tasks()
            .into_iter()
            .map(|t| (t.id.clone(), t.metrics.attempts))
            .collect();

        let ids = |ids: &[TaskId]| -> Vec<String> { ids.iter().map(|id| id.to_string()).collect() };
        self.recorder.append(
            NewEvent::new(
                EventSource::Scheduler,
                kinds::RUN_FINISHED,
                format!(
                    "run finished: {} completed, {} failed, {} blocked",
                    report.completed.len(),
                    report.failed.len(),
                    report.blocked.len()
                ),
            )
            .outcome(report.is_success(), None)
            .meta("completed", ids(&report.completed))
            .meta("failed", ids(&report.failed))
            .meta("blocked", ids(&report.blocked))
            .meta("unfinished", ids(&report.unfinished))
            .meta("cancelled", report.cancelled)
            .meta("max_observed_running", report.max_observed_running),
        )?;

        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            blocked = report.blocked.len(),
            unfinished = report.unfinished.len(),
            cancelled = report.cancelled,
            "run finished"
        );
        Ok(report)
    }

    /// Stop every session after a fatal error. Store writes may be failing,
    /// so errors here are only logged.
    async fn halt(&mut self, events_rx: &mut mpsc::Receiver<SessionEvent>) {
        self.cancel.cancel();
        let deadline = Instant::now() + HALT_DRAIN_TIMEOUT;
        while !self.running.is_empty() {
            match tokio::time::timeout_at(deadline, events_rx.recv()).await {
                Ok(Some(SessionEvent::Finished { task_id, .. })) => {
                    self.running.remove(&task_id);
                }
                Ok(Some(SessionEvent::Started { .. })) => {}
                Ok(None) | Err(_) => break,
            }
        }
        match self.sessions.terminate_all(ReleaseOutcome::Cancelled).await {
            Ok(0) => {}
            Ok(n) => warn!(sessions = n, "terminated sessions left after halt"),
            Err(e) => warn!(error = %e, "failed to terminate sessions after halt"),
        }
    }
}
