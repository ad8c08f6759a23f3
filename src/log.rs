//! Structured logging for debugging conductor.
//!
//! Call sites use the `tracing` macros directly. This module only wires the
//! subscriber: a non-blocking file writer at `~/.conductor/conductor.log`
//! filtered by `CONDUCTOR_LOG` (or `RUST_LOG`).
//!
//! Debug mode can be enabled with `--debug` flag or `CONDUCTOR_DEBUG=1` env var.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

const LOG_FILE: &str = "conductor.log";

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let Some(dir) = dirs::home_dir().map(|h| h.join(".conductor")) else {
        return;
    };
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }

    let appender = tracing_appender::rolling::never(&dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter_for(debug_enabled))
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .is_ok();

    if installed {
        let _ = GUARD.set(guard);
    }
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn env_debug() -> bool {
    std::env::var("CONDUCTOR_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "conductor=debug"
    } else {
        "conductor=info"
    }
}

fn filter_for(debug: bool) -> EnvFilter {
    EnvFilter::try_from_env("CONDUCTOR_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)))
}
