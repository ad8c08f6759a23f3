//! Transport form of a task, handed to the agent process on stdin.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::core::role::AgentRole;
use crate::core::task::{TaskId, TaskNode};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    pub id: TaskId,
    pub agent_role: AgentRole,
    pub description: String,
    pub priority: i32,
    pub dependencies: Vec<TaskId>,
    pub workspace: PathBuf,
    pub config: EnvelopeConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl TaskEnvelope {
    pub fn from_task(task: &TaskNode, workspace: PathBuf, config: EnvelopeConfig) -> Self {
        let tags = (!task.tags.is_empty()).then(|| task.tags.iter().cloned().collect());
        Self {
            id: task.id.clone(),
            agent_role: task.agent_role,
            description: task.description.clone(),
            priority: task.priority,
            dependencies: task.dependencies.iter().cloned().collect(),
            workspace,
            config,
            metadata: Some(serde_json::json!({
                "attempt": task.metrics.attempts,
                "retries": task.metrics.retries,
            })),
            tags,
        }
    }

    pub fn tag_set(&self) -> BTreeSet<&str> {
        self.tags
            .iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }
}
