//! Approval gate for flagged tasks.
//!
//! A task is flagged by its role, by one of its tags, or by a caller-supplied
//! predicate. Flagged tasks move `proposed -> pending_approval` when they
//! first reach the gate and stay there until an operator decides. Unflagged
//! tasks bypass the gate. A decision is final for the task, retries included.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::info;

use super::recorder::Recorder;
use crate::config::ApprovalConfig;
use crate::core::{kinds, AgentRole, EventSource, NewEvent, TaskId, TaskNode};
use crate::{Error, Result};

pub type ApprovalPredicate = Arc<dyn Fn(&TaskNode) -> bool + Send + Sync>;

/// Which tasks need operator approval before dispatch.
#[derive(Clone, Default)]
pub struct ApprovalPolicy {
    roles: BTreeSet<AgentRole>,
    tags: BTreeSet<String>,
    predicate: Option<ApprovalPredicate>,
}

impl ApprovalPolicy {
    pub fn from_config(config: &ApprovalConfig) -> Result<Self> {
        let mut policy = Self::default();
        for name in &config.roles {
            let role = AgentRole::parse(name)
                .ok_or_else(|| Error::Validation(format!("unknown agent role in approval: {}", name)))?;
            policy.roles.insert(role);
        }
        policy.tags = config.tags.iter().cloned().collect();
        Ok(policy)
    }

    pub fn with_role(mut self, role: AgentRole) -> Self {
        self.roles.insert(role);
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag.to_string());
        self
    }

    pub fn with_predicate(mut self, predicate: ApprovalPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty() && self.tags.is_empty() && self.predicate.is_none()
    }

    pub fn requires_approval(&self, task: &TaskNode) -> bool {
        self.roles.contains(&task.agent_role)
            || task.tags.iter().any(|t| self.tags.contains(t))
            || self.predicate.as_ref().map(|p| p(task)).unwrap_or(false)
    }
}

impl std::fmt::Debug for ApprovalPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalPolicy")
            .field("roles", &self.roles)
            .field("tags", &self.tags)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalState {
    Proposed,
    PendingApproval,
    Approved,
    Rejected,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalState::Proposed => "proposed",
            ApprovalState::PendingApproval => "pending_approval",
            ApprovalState::Approved => "approved",
            ApprovalState::Rejected => "rejected",
        }
    }
}

/// What the scheduler should do with a task that reached the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Not flagged; dispatch.
    Bypass,
    /// Waiting for an operator; do not dispatch yet.
    Pending,
    Approved,
    Rejected,
}

impl GateDecision {
    pub fn may_dispatch(&self) -> bool {
        matches!(self, GateDecision::Bypass | GateDecision::Approved)
    }
}

pub struct ApprovalGate {
    policy: ApprovalPolicy,
    states: HashMap<TaskId, ApprovalState>,
    recorder: Recorder,
}

impl ApprovalGate {
    pub fn new(policy: ApprovalPolicy, recorder: Recorder) -> Self {
        Self {
            policy,
            states: HashMap::new(),
            recorder,
        }
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    /// Present a ready task to the gate.
    pub fn submit(&mut self, task: &TaskNode) -> Result<GateDecision> {
        if !self.policy.requires_approval(task) {
            return Ok(GateDecision::Bypass);
        }
        let state = *self
            .states
            .entry(task.id.clone())
            .or_insert(ApprovalState::Proposed);
        match state {
            ApprovalState::Proposed => {
                self.recorder.append(
                    NewEvent::new(
                        EventSource::ApprovalGate,
                        kinds::APPROVAL_REQUESTED,
                        format!("approval required for {}: {}", task.id, task.description),
                    )
                    .task(&task.id)
                    .meta("approval", ApprovalState::PendingApproval.as_str())
                    .meta("agent_role", task.agent_role.as_str()),
                )?;
                self.states
                    .insert(task.id.clone(), ApprovalState::PendingApproval);
                info!(task_id = %task.id, "awaiting approval");
                Ok(GateDecision::Pending)
            }
            ApprovalState::PendingApproval => Ok(GateDecision::Pending),
            ApprovalState::Approved => Ok(GateDecision::Approved),
            ApprovalState::Rejected => Ok(GateDecision::Rejected),
        }
    }

    /// Record an operator decision for a task that is awaiting approval.
    pub fn decide(&mut self, task_id: &TaskId, approved: bool) -> Result<ApprovalState> {
        match self.states.get(task_id) {
            Some(ApprovalState::PendingApproval) => {}
            Some(state) => {
                return Err(Error::Validation(format!(
                    "task {} is {}, not awaiting approval",
                    task_id,
                    state.as_str()
                )))
            }
            None => {
                return Err(Error::Validation(format!(
                    "task {} is not awaiting approval",
                    task_id
                )))
            }
        }
        let state = if approved {
            ApprovalState::Approved
        } else {
            ApprovalState::Rejected
        };
        self.recorder.append(
            NewEvent::new(
                EventSource::ApprovalGate,
                kinds::APPROVAL_DECIDED,
                format!("task {} {}", task_id, state.as_str()),
            )
            .task(task_id)
            .meta("approval", state.as_str())
            .outcome(approved, (!approved).then_some("rejected by operator")),
        )?;
        self.states.insert(task_id.clone(), state);
        info!(task_id = %task_id, approved, "approval decided");
        Ok(state)
    }

    pub fn state(&self, task_id: &TaskId) -> Option<ApprovalState> {
        self.states.get(task_id).copied()
    }

    /// Tasks currently awaiting a decision.
    pub fn pending(&self) -> Vec<TaskId> {
        let mut pending: Vec<TaskId> = self
            .states
            .iter()
            .filter(|(_, s)| **s == ApprovalState::PendingApproval)
            .map(|(id, _)| id.clone())
            .collect();
        pending.sort();
        pending
    }

    /// Forget a task that will never reach the gate again.
    pub fn withdraw(&mut self, task_id: &TaskId) {
        self.states.remove(task_id);
    }
}
