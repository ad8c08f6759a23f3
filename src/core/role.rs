//! Agent roles and capability matching.
//!
//! The set of roles is fixed. Which role handles a task is decided by
//! matching the task's wording against each role's capability keywords,
//! never by inspecting types at runtime.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Capability tag for the agent that should execute a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Architect,
    Backend,
    Frontend,
    Database,
    Testing,
    Devops,
    Security,
    Documentation,
}

/// Keyword patterns per role, checked in declaration order.
static ROLE_PATTERNS: LazyLock<Vec<(AgentRole, Regex)>> = LazyLock::new(|| {
    [
        (
            AgentRole::Architect,
            r"(?i)\b(architect\w*|design|scaffold\w*|structure|plan the|module layout)\b",
        ),
        (
            AgentRole::Database,
            r"(?i)\b(database|schema|migration\w*|sql|table|index(es)?|orm)\b",
        ),
        (
            AgentRole::Frontend,
            r"(?i)\b(frontend|ui|ux|component\w*|css|html|react|vue|page|layout|style\w*)\b",
        ),
        (
            AgentRole::Backend,
            r"(?i)\b(backend|api|endpoint\w*|server|service|handler\w*|route\w*|model\w*|auth\w*)\b",
        ),
        (
            AgentRole::Testing,
            r"(?i)\b(tests?|testing|spec|coverage|e2e|qa|fixture\w*)\b",
        ),
        (
            AgentRole::Devops,
            r"(?i)\b(deploy\w*|ci|cd|pipeline|docker\w*|kubernetes|k8s|infra\w*|release)\b",
        ),
        (
            AgentRole::Security,
            r"(?i)\b(security|vulnerab\w*|audit|secret\w*|permission\w*|sanitiz\w*)\b",
        ),
        (
            AgentRole::Documentation,
            r"(?i)\b(docs?|documentation|readme|changelog|guide)\b",
        ),
    ]
    .into_iter()
    .filter_map(|(role, pattern)| Regex::new(pattern).ok().map(|re| (role, re)))
    .collect()
});

impl AgentRole {
    pub const ALL: [AgentRole; 8] = [
        AgentRole::Architect,
        AgentRole::Backend,
        AgentRole::Frontend,
        AgentRole::Database,
        AgentRole::Testing,
        AgentRole::Devops,
        AgentRole::Security,
        AgentRole::Documentation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Architect => "architect",
            AgentRole::Backend => "backend",
            AgentRole::Frontend => "frontend",
            AgentRole::Database => "database",
            AgentRole::Testing => "testing",
            AgentRole::Devops => "devops",
            AgentRole::Security => "security",
            AgentRole::Documentation => "documentation",
        }
    }

    /// Parse a role name, accepting a few common aliases.
    pub fn parse(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase();
        let role = match normalized.as_str() {
            "architect" | "architecture" | "design" => AgentRole::Architect,
            "backend" | "back-end" | "api" | "server" => AgentRole::Backend,
            "frontend" | "front-end" | "ui" | "web" => AgentRole::Frontend,
            "database" | "db" | "data" => AgentRole::Database,
            "testing" | "test" | "tests" | "qa" | "tester" => AgentRole::Testing,
            "devops" | "ops" | "infra" | "infrastructure" => AgentRole::Devops,
            "security" | "sec" => AgentRole::Security,
            "documentation" | "docs" | "doc" | "writer" => AgentRole::Documentation,
            _ => return None,
        };
        Some(role)
    }

    /// Pick the role whose capabilities best match a task description.
    ///
    /// Returns `None` when no capability keyword matches at all.
    pub fn infer(text: &str) -> Option<Self> {
        ROLE_PATTERNS
            .iter()
            .map(|(role, re)| (*role, re.find_iter(text).count()))
            .filter(|(_, hits)| *hits > 0)
            // max_by_key keeps the last maximum; reverse so earlier roles win ties
            .rev()
            .max_by_key(|(_, hits)| *hits)
            .map(|(role, _)| role)
    }

    /// Whether this role can handle work described by `text`.
    pub fn matches(&self, text: &str) -> bool {
        ROLE_PATTERNS
            .iter()
            .any(|(role, re)| role == self && re.is_match(text))
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown agent role: {}", s))
    }
}
