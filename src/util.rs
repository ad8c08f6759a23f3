//! Running synchronous work (git2, SQLite, stdin) off the async runtime.

use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::{Error, Result};

/// Upper bound for a single git operation on the blocking pool.
pub const GIT_OP_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

pub async fn blocking_with_timeout<F, T>(duration: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match timeout(duration, spawn_blocking(f)).await {
        Ok(Ok(inner)) => inner,
        Ok(Err(join_err)) => Err(Error::TaskJoin(join_err.to_string())),
        Err(_) => Err(Error::Timeout(duration)),
    }
}

/// Run a workspace git operation under [`GIT_OP_TIMEOUT`].
///
/// Conflicts pass through untouched; every other failure, a timeout
/// included, becomes [`Error::Workspace`].
pub async fn git_op<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    blocking_with_timeout(GIT_OP_TIMEOUT, f)
        .await
        .map_err(|e| match e {
            Error::WorkspaceConflict(_) | Error::Workspace(_) => e,
            other => Error::Workspace(other.to_string()),
        })
}
