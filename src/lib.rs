//! Conductor: runs parallel coding agents against one repository.
//!
//! A goal is decomposed into a task graph, each ready task runs in its own
//! git worktree under a bounded number of concurrent agent processes, and
//! every state change lands in a SQLite audit log.

pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod store;
pub mod util;
pub mod workspace;

pub use error::{Error, Result};
