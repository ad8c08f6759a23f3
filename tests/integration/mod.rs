//! Integration test suite for conductor.
//!
//! These tests drive the public API from plan to finished run, with fake
//! agents for scheduling behaviour and real git worktrees where isolation
//! matters.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Decomposition through completion, event replay
//! - `parallel_agents`: Concurrency cap and the approval gate
//! - `recovery`: Retries, cancellation, resume from the store
//! - `workspaces`: Git worktree lifecycle and a real agent process
//! - `cli`: The binary end to end, output streams included
//!
//! # CI Compatibility
//!
//! No test calls a real coding agent; the only external tool is `git`.

mod fixtures;

#[cfg(unix)]
mod cli;
mod parallel_agents;
mod recovery;
mod workflow_e2e;
mod workspaces;
