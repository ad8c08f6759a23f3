//! Core domain models for conductor.
//!
//! Tasks, the execution DAG, agent sessions, the task envelope handed to
//! agents, and the transparency events that record every state change.

pub mod dag;
pub mod envelope;
pub mod event;
pub mod role;
pub mod session;
pub mod task;

pub use dag::TaskDAG;
pub use envelope::{EnvelopeConfig, TaskEnvelope};
pub use event::{
    kinds, replay, replay_task_statuses, EventLevel, EventSource, NewEvent, ReplayedState,
    TransparencyEvent,
};
pub use role::AgentRole;
pub use session::{AgentSession, SessionId, SessionMetrics, SessionStatus};
pub use task::{TaskId, TaskMetrics, TaskNode, TaskStatus};
