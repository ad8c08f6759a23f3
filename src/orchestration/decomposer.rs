//! Goal decomposition.
//!
//! A [`PlanSource`] turns a goal into raw [`TaskDraft`]s; [`TaskDecomposer`]
//! validates them into [`TaskNode`]s. Validation is all or nothing: an
//! unknown dependency, a cycle, a duplicate id, or a task with no assignable
//! role rejects the whole batch so a partial graph is never persisted.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::agent::AgentCommand;
use crate::core::{AgentRole, TaskId, TaskNode};
use crate::git::GitOps;
use crate::{Error, Result};

/// Default time allowed for the planner to answer (5 minutes).
pub const DEFAULT_PLANNER_TIMEOUT_SECS: u64 = 300;

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("valid fence pattern")
});

/// Marker files and the stack they indicate.
const STACK_MARKERS: &[(&str, &str)] = &[
    ("Cargo.toml", "rust"),
    ("package.json", "node"),
    ("tsconfig.json", "typescript"),
    ("pyproject.toml", "python"),
    ("requirements.txt", "python"),
    ("setup.py", "python"),
    ("go.mod", "go"),
    ("pom.xml", "java"),
    ("build.gradle", "java"),
    ("Gemfile", "ruby"),
    ("composer.json", "php"),
    ("Dockerfile", "docker"),
];

/// A task as proposed by a planner, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDraft {
    pub id: String,
    pub description: String,
    #[serde(default, alias = "agentRole", alias = "role")]
    pub agent_role: Option<String>,
    #[serde(default, alias = "depends_on", alias = "dependsOn")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TaskDraft {
    pub fn new(id: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            agent_role: None,
            dependencies: Vec::new(),
            priority: 0,
            tags: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.agent_role = Some(role.to_string());
        self
    }

    pub fn with_dependency(mut self, id: &str) -> Self {
        self.dependencies.push(id.to_string());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }
}

/// What the planner knows about the repository.
#[derive(Debug, Clone, Default)]
pub struct RepoContext {
    pub root: PathBuf,
    /// Detected stacks, in marker order, without duplicates.
    pub stack: Vec<String>,
    pub branch: Option<String>,
    /// Tasks already in the store when resuming.
    pub existing: Vec<TaskNode>,
}

impl RepoContext {
    pub fn detect(root: &Path) -> Self {
        let mut stack: Vec<String> = Vec::new();
        for (marker, name) in STACK_MARKERS {
            if root.join(marker).exists() && !stack.iter().any(|s| s == name) {
                stack.push(name.to_string());
            }
        }
        let branch = GitOps::new(root).and_then(|git| git.current_head()).ok();
        debug!(root = %root.display(), ?stack, ?branch, "repository context detected");
        Self {
            root: root.to_path_buf(),
            stack,
            branch,
            existing: Vec::new(),
        }
    }

    pub fn with_existing(mut self, tasks: Vec<TaskNode>) -> Self {
        self.existing = tasks;
        self
    }

    fn describe(&self) -> String {
        let mut out = String::new();
        if self.stack.is_empty() {
            out.push_str("Stack: unknown\n");
        } else {
            out.push_str(&format!("Stack: {}\n", self.stack.join(", ")));
        }
        if let Some(branch) = &self.branch {
            out.push_str(&format!("Branch: {}\n", branch));
        }
        if !self.existing.is_empty() {
            out.push_str("Existing tasks (new tasks may depend on these ids):\n");
            for task in &self.existing {
                out.push_str(&format!(
                    "- {} [{}] {}: {}\n",
                    task.id, task.agent_role, task.status, task.description
                ));
            }
        }
        out
    }
}

/// Produces raw task drafts for a goal.
#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn plan(&self, goal: &str, context: &RepoContext) -> Result<Vec<TaskDraft>>;
}

/// Drafts read from a JSON file.
pub struct PlanFile {
    path: PathBuf,
}

impl PlanFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PlanSource for PlanFile {
    async fn plan(&self, _goal: &str, _context: &RepoContext) -> Result<Vec<TaskDraft>> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        parse_drafts(&text)
    }
}

/// Asks the planner agent, run headless, for a JSON task list.
pub struct AgentPlanner {
    command: AgentCommand,
    timeout: Duration,
}

impl AgentPlanner {
    pub fn new(command: AgentCommand) -> Self {
        Self {
            command,
            timeout: Duration::from_secs(DEFAULT_PLANNER_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn prompt(goal: &str, context: &RepoContext) -> String {
        let roles: Vec<&str> = AgentRole::ALL.iter().map(AgentRole::as_str).collect();
        format!(
            "Break the following goal into small, independently implementable tasks.\n\
             Goal: {goal}\n\n\
             {context}\n\
             Reply with only a JSON array. Each element has: \"id\" (short kebab-case, unique), \
             \"description\", \"agent_role\" (one of: {roles}), \"dependencies\" (ids that must \
             finish first), \"priority\" (integer, lower runs first) and optional \"tags\".",
            goal = goal,
            context = context.describe(),
            roles = roles.join(", "),
        )
    }
}

#[async_trait]
impl PlanSource for AgentPlanner {
    async fn plan(&self, goal: &str, context: &RepoContext) -> Result<Vec<TaskDraft>> {
        let binary = self.command.resolve()?;
        let prompt = Self::prompt(goal, context);
        info!(planner = self.command.name(), "requesting plan");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&binary)
                .args(self.command.headless_args(&prompt))
                .current_dir(&context.root)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))?
        .map_err(|e| Error::AgentSpawn(format!("{}: {}", binary.display(), e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                format!("exit code {}", output.status.code().unwrap_or(-1))
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Decomposition(format!("planner failed: {}", detail)));
        }
        parse_drafts(&stdout)
    }
}

/// Extract a task list from a planner reply.
///
/// Accepts a bare JSON array, an object with a `tasks` array, a Claude
/// result envelope whose `result` text holds either of those, or JSON inside
/// a fenced code block.
pub fn parse_drafts(text: &str) -> Result<Vec<TaskDraft>> {
    let text = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return drafts_from_value(value);
    }
    if let Some(body) = FENCED_JSON.captures(text).and_then(|c| c.get(1)) {
        if let Ok(value) = serde_json::from_str::<Value>(body.as_str().trim()) {
            return drafts_from_value(value);
        }
    }
    if let (Some(start), Some(end)) = (text.find('['), text.rfind(']')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                return drafts_from_value(value);
            }
        }
    }
    Err(Error::Decomposition(
        "planner reply contains no task list".to_string(),
    ))
}

fn drafts_from_value(value: Value) -> Result<Vec<TaskDraft>> {
    match value {
        Value::Array(_) => Ok(serde_json::from_value(value)
            .map_err(|e| Error::Decomposition(format!("malformed task list: {}", e)))?),
        Value::Object(mut map) => {
            if let Some(tasks) = map.remove("tasks") {
                return drafts_from_value(tasks);
            }
            match map.remove("result") {
                Some(Value::String(text)) => parse_drafts(&text),
                _ => Err(Error::Decomposition(
                    "planner reply contains no task list".to_string(),
                )),
            }
        }
        _ => Err(Error::Decomposition(
            "planner reply contains no task list".to_string(),
        )),
    }
}

/// Validates planner output into a task graph.
pub struct TaskDecomposer {
    source: Arc<dyn PlanSource>,
}

impl TaskDecomposer {
    pub fn new(source: Arc<dyn PlanSource>) -> Self {
        Self { source }
    }

    pub async fn decompose(&self, goal: &str, context: &RepoContext) -> Result<Vec<TaskNode>> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(Error::Decomposition("goal is empty".to_string()));
        }
        let drafts = self.source.plan(goal, context).await?;
        let tasks = Self::validate(drafts, &context.existing)?;
        info!(tasks = tasks.len(), "goal decomposed");
        Ok(tasks)
    }

    /// Turn drafts into tasks, rejecting the batch on the first problem.
    ///
    /// New tasks may depend on `existing` ids but may not reuse them.
    pub fn validate(drafts: Vec<TaskDraft>, existing: &[TaskNode]) -> Result<Vec<TaskNode>> {
        if drafts.is_empty() {
            return Err(Error::Decomposition("planner produced no tasks".to_string()));
        }
        let mut slugs: HashMap<String, TaskId> = existing
            .iter()
            .map(|t| (t.id.slug(), t.id.clone()))
            .collect();
        let existing: HashSet<&TaskId> = existing.iter().map(|t| &t.id).collect();

        let mut seen: HashSet<TaskId> = HashSet::new();
        for draft in &drafts {
            let id = TaskId::from(draft.id.trim());
            if id.as_str().is_empty() {
                return Err(Error::Decomposition("task with empty id".to_string()));
            }
            if existing.contains(&id) {
                return Err(Error::Decomposition(format!("task id {} already exists", id)));
            }
            if !seen.insert(id.clone()) {
                return Err(Error::Decomposition(format!("duplicate task id {}", id)));
            }
            // Workspace paths and branches are named by slug.
            if let Some(other) = slugs.insert(id.slug(), id.clone()) {
                return Err(Error::Decomposition(format!(
                    "task ids {} and {} map to the same workspace name",
                    other, id
                )));
            }
        }

        let mut tasks = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let id = TaskId::from(draft.id.trim());
            let role = assign_role(&id, &draft)?;
            let mut task = TaskNode::new(id.clone(), draft.description.trim(), role)
                .with_priority(draft.priority);
            for dep in &draft.dependencies {
                let dep = TaskId::from(dep.trim());
                if !seen.contains(&dep) && !existing.contains(&dep) {
                    return Err(Error::TaskDependency {
                        task: id.to_string(),
                        dependency: dep.to_string(),
                    });
                }
                task.dependencies.insert(dep);
            }
            for tag in &draft.tags {
                task.tags.insert(tag.trim().to_string());
            }
            tasks.push(task);
        }

        if let Some(cycle) = find_cycle(&tasks) {
            let path: Vec<&str> = cycle.iter().map(TaskId::as_str).collect();
            return Err(Error::Decomposition(format!(
                "dependency cycle: {}",
                path.join(" -> ")
            )));
        }
        Ok(tasks)
    }
}

fn assign_role(id: &TaskId, draft: &TaskDraft) -> Result<AgentRole> {
    match draft.agent_role.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => AgentRole::parse(name).ok_or_else(|| {
            Error::Decomposition(format!("task {} has unknown agent role {}", id, name))
        }),
        _ => AgentRole::infer(&draft.description).ok_or_else(|| {
            Error::Decomposition(format!("task {} has no assignable agent role", id))
        }),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    New,
    OnStack,
    Done,
}

/// Depth-first search with a recursion stack. Returns the cycle as a path
/// that starts and ends on the same task.
fn find_cycle(tasks: &[TaskNode]) -> Option<Vec<TaskId>> {
    let by_id: HashMap<&TaskId, &TaskNode> = tasks.iter().map(|t| (&t.id, t)).collect();
    let mut state: HashMap<&TaskId, Visit> = tasks.iter().map(|t| (&t.id, Visit::New)).collect();
    let mut stack: Vec<&TaskId> = Vec::new();

    fn visit<'a>(
        id: &'a TaskId,
        by_id: &HashMap<&'a TaskId, &'a TaskNode>,
        state: &mut HashMap<&'a TaskId, Visit>,
        stack: &mut Vec<&'a TaskId>,
    ) -> Option<Vec<TaskId>> {
        state.insert(id, Visit::OnStack);
        stack.push(id);
        if let Some(&task) = by_id.get(id) {
            for dep in &task.dependencies {
                match state.get(dep).copied() {
                    // Dependency outside this batch; it cannot lead back here.
                    None => {}
                    Some(Visit::OnStack) => {
                        let start = stack.iter().position(|s| *s == dep).unwrap_or(0);
                        let mut cycle: Vec<TaskId> =
                            stack[start..].iter().map(|s| (*s).clone()).collect();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Some(Visit::New) => {
                        if let Some(cycle) = visit(dep, by_id, state, stack) {
                            return Some(cycle);
                        }
                    }
                    Some(Visit::Done) => {}
                }
            }
        }
        stack.pop();
        state.insert(id, Visit::Done);
        None
    }

    for task in tasks {
        if state.get(&task.id).copied() == Some(Visit::New) {
            if let Some(cycle) = visit(&task.id, &by_id, &mut state, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}
