//! Task data model for the execution DAG.
//!
//! Tasks are the atomic units of work assigned to agents. Each task tracks
//! its status, assignment, metrics, and result. Status only moves forward;
//! the two exceptions are dependency blocking and an explicit retry, which
//! resets the attempt-specific fields but keeps the task's identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::core::role::AgentRole;
use crate::core::session::SessionId;

/// Unique identifier for a task within a graph.
///
/// Decomposed plans carry their own ids (e.g. `api-auth`); generated ids use
/// a short UUID form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(format!("task-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id sanitized for use in branch and directory names.
    ///
    /// Ids that are already safe map to themselves. Any other id gets a
    /// suffix hashed from the raw id, so `Auth` and `auth` stay apart.
    pub fn slug(&self) -> String {
        let sanitized: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        let trimmed = sanitized.trim_matches('-');
        if trimmed == self.0 {
            return trimmed.to_string();
        }
        let base = if trimmed.is_empty() { "task" } else { trimmed };
        format!("{}-{:08x}", base, fnv1a(self.0.as_bytes()))
    }
}

/// 32-bit FNV-1a; stable across builds, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5u32, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(0x0100_0193)
    })
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting on dependencies or capacity.
    Pending,
    /// Dependencies satisfied and waiting at the approval gate.
    Ready,
    /// A session has been created for the task.
    Assigned,
    /// The agent process is executing the task.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully and will not be retried.
    Failed,
    /// Can never run because a dependency failed.
    Blocked,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::Assigned,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Blocked
        )
    }

    /// Statuses that hold (or are about to hold) an agent session.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status: {}", s))
    }
}

/// Execution metrics accumulated across attempts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    /// Wall-clock time of the last attempt, in milliseconds.
    pub duration_ms: Option<u64>,
    /// Number of times the task was requeued after a failure.
    pub retries: u32,
    /// Number of dispatch attempts (each attempt is one session).
    pub attempts: u32,
}

/// A single task in the execution DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: TaskId,
    pub description: String,
    pub agent_role: AgentRole,
    pub dependencies: BTreeSet<TaskId>,
    /// Lower is more urgent.
    pub priority: i32,
    pub status: TaskStatus,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub assigned_session: Option<SessionId>,
    /// Opaque payload returned by the agent.
    pub result: Option<serde_json::Value>,
    /// Last error, kept for failed and retried tasks.
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: TaskMetrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskNode {
    /// Create a pending task with no dependencies.
    pub fn new(id: impl Into<TaskId>, description: &str, agent_role: AgentRole) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            description: description.to_string(),
            agent_role,
            dependencies: BTreeSet::new(),
            priority: 0,
            status: TaskStatus::Pending,
            tags: BTreeSet::new(),
            assigned_session: None,
            result: None,
            error: None,
            metrics: TaskMetrics::default(),
            created_at: now,
            updated_at: now,
            assigned_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<TaskId>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag.to_string());
        self
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Dependencies satisfied; parked at the approval gate.
    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
        self.touch();
    }

    /// Bind the task to a freshly created session.
    pub fn assign(&mut self, session: SessionId) {
        self.status = TaskStatus::Assigned;
        self.assigned_session = Some(session);
        self.assigned_at = Some(Utc::now());
        self.metrics.attempts += 1;
        self.touch();
    }

    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.touch();
    }

    pub fn complete(&mut self, result: Option<serde_json::Value>, duration_ms: Option<u64>) {
        self.status = TaskStatus::Completed;
        self.result = result;
        self.error = None;
        self.metrics.duration_ms = duration_ms;
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    /// Terminal failure.
    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    /// Requeue after a failed attempt. Identity and metrics are kept.
    pub fn retry(&mut self, error: &str) {
        self.status = TaskStatus::Pending;
        self.error = Some(error.to_string());
        self.assigned_session = None;
        self.assigned_at = None;
        self.metrics.retries += 1;
        self.touch();
    }

    pub fn block(&mut self, reason: &str) {
        self.status = TaskStatus::Blocked;
        self.error = Some(reason.to_string());
        self.assigned_session = None;
        self.touch();
    }

    /// Crash recovery: an attempt that was in flight is discarded.
    pub fn reset_interrupted(&mut self) {
        self.status = TaskStatus::Pending;
        self.assigned_session = None;
        self.assigned_at = None;
        self.touch();
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pending or parked at the gate.
    pub fn can_start(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Ready)
    }
}
