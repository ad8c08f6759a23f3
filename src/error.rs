use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Decomposition rejected: {0}")]
    Decomposition(String),

    #[error("Task {task} depends on unknown task {dependency}")]
    TaskDependency { task: String, dependency: String },

    #[error("Workspace already exists for task {0}")]
    WorkspaceConflict(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Failed to spawn agent: {0}")]
    AgentSpawn(String),

    #[error("Agent timed out after {0:?}")]
    AgentTimeout(std::time::Duration),

    #[error("Approval rejected for task {0}")]
    ApprovalRejected(String),

    #[error("Store write failed: {0}")]
    StoreWrite(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl Error {
    /// Per-task failures that the scheduler may retry locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WorkspaceConflict(_)
                | Error::Workspace(_)
                | Error::Git(_)
                | Error::AgentSpawn(_)
                | Error::AgentTimeout(_)
                | Error::Timeout(_)
                | Error::Io(_)
        )
    }

    /// Errors that abort the whole run rather than a single task.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            Error::Decomposition(_) | Error::TaskDependency { .. } | Error::StoreWrite(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
