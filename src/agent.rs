use std::path::PathBuf;

use crate::config::Config;
use crate::{Error, Result};

/// An agent executable plus its fixed leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    base_command: Vec<String>,
}

impl AgentCommand {
    pub fn parse(command_line: &str) -> Result<Self> {
        let base_command: Vec<String> = command_line.split_whitespace().map(String::from).collect();
        if base_command.is_empty() {
            return Err(Error::Validation("agent command is empty".to_string()));
        }
        Ok(Self { base_command })
    }

    /// The command that executes tasks.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::parse(config.effective_agent_command())
    }

    /// The command that plans goals into tasks.
    pub fn planner_from_config(config: &Config) -> Result<Self> {
        Self::parse(config.effective_planner_command())
    }

    fn is_claude(&self) -> bool {
        self.binary().contains("claude")
    }

    pub fn name(&self) -> &'static str {
        if self.is_claude() {
            "Claude"
        } else {
            "Custom"
        }
    }

    pub fn binary(&self) -> &str {
        &self.base_command[0]
    }

    pub fn args(&self) -> &[String] {
        &self.base_command[1..]
    }

    /// Absolute path of the executable.
    pub fn resolve(&self) -> Result<PathBuf> {
        which::which(self.binary())
            .map_err(|e| Error::AgentSpawn(format!("{}: {}", self.binary(), e)))
    }

    pub fn is_available(&self) -> bool {
        self.resolve().is_ok()
    }

    /// Arguments for a one-shot, non-interactive run answering `prompt` in JSON.
    pub fn headless_args(&self, prompt: &str) -> Vec<String> {
        let mut args = self.args().to_vec();
        if self.is_claude() {
            args.extend(["-p".to_string(), prompt.to_string()]);
            args.extend(["--output-format".to_string(), "json".to_string()]);
        } else {
            args.push(prompt.to_string());
        }
        args
    }
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self {
            base_command: vec!["claude".to_string()],
        }
    }
}
