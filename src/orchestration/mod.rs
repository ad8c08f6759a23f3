//! Orchestration layer.
//!
//! Turns a goal into a task graph, runs the graph through agent sessions
//! bound to isolated workspaces, and gates flagged tasks on operator
//! approval. Every state change is written through the [`Recorder`].

mod approval;
mod decomposer;
mod process;
mod recorder;
mod retry;
mod scheduler;
mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use approval::{ApprovalGate, ApprovalPolicy, ApprovalPredicate, ApprovalState, GateDecision};
pub use decomposer::{AgentPlanner, PlanFile, PlanSource, RepoContext, TaskDecomposer, TaskDraft};
pub use process::{AgentChunk, AgentLauncher, AgentProcess, AgentResult, ProcessLauncher};
pub use recorder::Recorder;
pub use retry::RetryPolicy;
pub use scheduler::{ExecutionScheduler, RunReport, SchedulerConfig, SchedulerHandle};
pub use session::{AgentOutcome, AgentSessionManager, SessionEvent, SessionOutput};
