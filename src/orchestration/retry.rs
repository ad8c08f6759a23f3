//! Delay policy between attempts of a failed task.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long a failed task waits before it re-enters the ready set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Requeue immediately.
    #[default]
    None,
    Fixed {
        delay_ms: u64,
    },
    /// `base_ms * 2^(retry - 1)`, capped at `max_ms`.
    Exponential {
        base_ms: u64,
        max_ms: u64,
    },
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1 for the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self {
            RetryPolicy::None => Duration::ZERO,
            RetryPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            RetryPolicy::Exponential { base_ms, max_ms } => {
                let shift = retry.saturating_sub(1).min(32);
                let delay = base_ms.saturating_mul(1u64 << shift);
                Duration::from_millis(delay.min(*max_ms))
            }
        }
    }
}
