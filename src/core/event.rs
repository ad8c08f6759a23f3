//! Transparency events: the append-only audit record of every state change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::session::{SessionId, SessionStatus};
use crate::core::task::{TaskId, TaskStatus};

/// Which component wrote the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Decomposer,
    Scheduler,
    SessionManager,
    ApprovalGate,
    Workspace,
    Agent,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Decomposer => "decomposer",
            EventSource::Scheduler => "scheduler",
            EventSource::SessionManager => "session_manager",
            EventSource::ApprovalGate => "approval_gate",
            EventSource::Workspace => "workspace",
            EventSource::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let source = match s {
            "decomposer" => EventSource::Decomposer,
            "scheduler" => EventSource::Scheduler,
            "session_manager" => EventSource::SessionManager,
            "approval_gate" => EventSource::ApprovalGate,
            "workspace" => EventSource::Workspace,
            "agent" => EventSource::Agent,
            _ => return None,
        };
        Some(source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Debug => "debug",
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(EventLevel::Debug),
            "info" => Some(EventLevel::Info),
            "warn" => Some(EventLevel::Warn),
            "error" => Some(EventLevel::Error),
            _ => None,
        }
    }
}

/// Event type names written to the log.
pub mod kinds {
    pub const TASK_CREATED: &str = "task_created";
    pub const TASK_STATUS: &str = "task_status";
    pub const SESSION_STARTED: &str = "session_started";
    pub const SESSION_TERMINATED: &str = "session_terminated";
    pub const WORKSPACE_ACQUIRED: &str = "workspace_acquired";
    pub const WORKSPACE_RELEASED: &str = "workspace_released";
    pub const AGENT_OUTPUT: &str = "agent_output";
    pub const APPROVAL_REQUESTED: &str = "approval_requested";
    pub const APPROVAL_DECIDED: &str = "approval_decided";
    pub const RUN_FINISHED: &str = "run_finished";
}

/// An event that has not been persisted yet (no id).
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub session_id: Option<SessionId>,
    pub task_id: Option<TaskId>,
    pub source: EventSource,
    pub level: EventLevel,
    pub event_type: String,
    pub message: String,
    pub tool_name: Option<String>,
    pub duration_ms: Option<u64>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl NewEvent {
    pub fn new(source: EventSource, event_type: &str, message: impl Into<String>) -> Self {
        Self {
            session_id: None,
            task_id: None,
            source,
            level: EventLevel::Info,
            event_type: event_type.to_string(),
            message: message.into(),
            tool_name: None,
            duration_ms: None,
            success: None,
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    /// A task status transition. Carries the new status in `metadata.status`
    /// so the log can be replayed.
    pub fn task_status(source: EventSource, task_id: &TaskId, status: TaskStatus) -> Self {
        Self::new(
            source,
            kinds::TASK_STATUS,
            format!("task {} -> {}", task_id, status),
        )
        .task(task_id)
        .meta("status", status.as_str())
    }

    /// A session status transition, replayable through `metadata.session_status`.
    pub fn session_status(
        event_type: &str,
        session_id: &SessionId,
        task_id: &TaskId,
        status: SessionStatus,
    ) -> Self {
        Self::new(
            EventSource::SessionManager,
            event_type,
            format!("session {} -> {}", session_id.short(), status),
        )
        .session(session_id)
        .task(task_id)
        .meta("session_status", status.as_str())
    }

    pub fn task(mut self, task_id: &TaskId) -> Self {
        self.task_id = Some(task_id.clone());
        self
    }

    pub fn session(mut self, session_id: &SessionId) -> Self {
        self.session_id = Some(session_id.clone());
        self
    }

    pub fn level(mut self, level: EventLevel) -> Self {
        self.level = level;
        self
    }

    pub fn outcome(mut self, success: bool, error: Option<&str>) -> Self {
        self.success = Some(success);
        self.error = error.map(str::to_string);
        if !success && self.level < EventLevel::Warn {
            self.level = EventLevel::Warn;
        }
        self
    }

    pub fn duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn tool(mut self, tool_name: &str) -> Self {
        self.tool_name = Some(tool_name.to_string());
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A persisted, immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransparencyEvent {
    /// Monotonic id assigned by the store.
    pub id: i64,
    pub session_id: Option<SessionId>,
    pub task_id: Option<TaskId>,
    pub event_time: DateTime<Utc>,
    pub source: EventSource,
    pub level: EventLevel,
    pub event_type: String,
    pub message: String,
    pub tool_name: Option<String>,
    pub duration_ms: Option<u64>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TransparencyEvent {
    /// The task status this event records, if it is a status transition.
    pub fn recorded_task_status(&self) -> Option<TaskStatus> {
        self.metadata
            .get("status")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }

    pub fn recorded_session_status(&self) -> Option<SessionStatus> {
        self.metadata
            .get("session_status")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }
}

/// Final statuses reconstructed from an ordered event log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayedState {
    pub tasks: BTreeMap<TaskId, TaskStatus>,
    pub sessions: BTreeMap<SessionId, SessionStatus>,
}

/// Replay events in id order to rebuild every task's and session's status.
pub fn replay(events: &[TransparencyEvent]) -> ReplayedState {
    let mut ordered: Vec<&TransparencyEvent> = events.iter().collect();
    ordered.sort_by_key(|e| e.id);

    let mut state = ReplayedState::default();
    for event in ordered {
        if let (Some(task_id), Some(status)) = (&event.task_id, event.recorded_task_status()) {
            state.tasks.insert(task_id.clone(), status);
        }
        if let (Some(session_id), Some(status)) =
            (&event.session_id, event.recorded_session_status())
        {
            state.sessions.insert(session_id.clone(), status);
        }
    }
    state
}

/// Task statuses only; see [`replay`].
pub fn replay_task_statuses(events: &[TransparencyEvent]) -> BTreeMap<TaskId, TaskStatus> {
    replay(events).tasks
}
