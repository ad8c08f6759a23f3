use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::orchestration::RetryPolicy;
use crate::{Error, Result};

pub const DEFAULT_MAX_PARALLEL_AGENTS: usize = 4;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_TERMINATION_GRACE_MS: u64 = 2000;
pub const DEFAULT_EVENT_PAGE_LIMIT: usize = 200;

/// Which tasks must pass through the approval gate.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ApprovalConfig {
    /// Agent roles that always require approval (e.g. "devops").
    #[serde(default)]
    pub roles: Vec<String>,
    /// Task tags that require approval (e.g. "migration").
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_parallel_agents: usize,
    pub task_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff: RetryPolicy,
    pub termination_grace_ms: u64,
    pub agent_command: Option<String>,
    pub planner_command: Option<String>,
    pub worktree_dir: Option<String>,
    pub database_path: Option<String>,
    pub integration_branch: Option<String>,
    pub preserve_failed_workspaces: bool,
    pub approval: ApprovalConfig,
    pub event_page_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_parallel_agents: DEFAULT_MAX_PARALLEL_AGENTS,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: RetryPolicy::None,
            termination_grace_ms: DEFAULT_TERMINATION_GRACE_MS,
            agent_command: None,
            planner_command: None,
            worktree_dir: None,
            database_path: None,
            integration_branch: None,
            preserve_failed_workspaces: false,
            approval: ApprovalConfig::default(),
            event_page_limit: DEFAULT_EVENT_PAGE_LIMIT,
        }
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::conductor_dir()?.join("worktrees")),
        }
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::conductor_dir()?.join("coordination.db")),
        }
    }

    pub fn effective_agent_command(&self) -> &str {
        self.agent_command.as_deref().unwrap_or("claude")
    }

    pub fn effective_planner_command(&self) -> &str {
        self.planner_command
            .as_deref()
            .unwrap_or_else(|| self.effective_agent_command())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    /// Load from `~/.conductor/conductor.toml`, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            max_parallel_agents = config.max_parallel_agents,
            max_retries = config.max_retries,
            timeout_secs = config.task_timeout_secs,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::conductor_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_agents == 0 {
            return Err(Error::Validation(
                "max_parallel_agents must be at least 1".to_string(),
            ));
        }
        if self.task_timeout_secs == 0 {
            return Err(Error::Validation(
                "task_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [Self::conductor_dir()?, self.worktrees_dir()?] {
            if !dir.exists() {
                debug!(dir = %dir.display(), "creating directory");
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
