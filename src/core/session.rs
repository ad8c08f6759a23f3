//! Agent session data model.
//!
//! A session binds one task to one workspace and one agent process. It is
//! created when the task is dispatched and terminated exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::role::AgentRole;
use crate::core::task::TaskId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(format!("sess-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 13 characters (prefix plus 8 hex digits) for display.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(13);
        &self.0[..end]
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Busy,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Busy => "busy",
            SessionStatus::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SessionStatus::Idle),
            "busy" => Ok(SessionStatus::Busy),
            "terminated" => Ok(SessionStatus::Terminated),
            other => Err(format!("unknown session status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub output_chunks: u64,
    pub duration_ms: Option<u64>,
    pub exit_code: Option<i32>,
}

/// Runtime binding between a task, a workspace, and an agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: SessionId,
    pub agent_role: AgentRole,
    pub workspace_path: PathBuf,
    pub branch_name: String,
    pub status: SessionStatus,
    pub current_task_id: Option<TaskId>,
    pub pid: Option<u32>,
    #[serde(default)]
    pub metrics: SessionMetrics,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentSession {
    pub fn new(agent_role: AgentRole, workspace_path: PathBuf, branch_name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            agent_role,
            workspace_path,
            branch_name: branch_name.to_string(),
            status: SessionStatus::Idle,
            current_task_id: None,
            pid: None,
            metrics: SessionMetrics::default(),
            registered_at: now,
            updated_at: now,
        }
    }

    /// Use an id chosen by the caller (the scheduler assigns it before spawn).
    pub fn with_id(mut self, id: SessionId) -> Self {
        self.id = id;
        self
    }

    pub fn bind(&mut self, task_id: TaskId, pid: Option<u32>) {
        self.status = SessionStatus::Busy;
        self.current_task_id = Some(task_id);
        self.pid = pid;
        self.updated_at = Utc::now();
    }

    pub fn terminate(&mut self) {
        self.status = SessionStatus::Terminated;
        self.metrics.duration_ms = Some(
            (Utc::now() - self.registered_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        self.updated_at = Utc::now();
    }

    pub fn is_terminated(&self) -> bool {
        self.status == SessionStatus::Terminated
    }
}
