//! Bootstrap utilities for embedding applications.
//!
//! Shared initialization code for processes hosting the runtime.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the `HERO_MESSAGING_LOG` environment variable.
///
/// Defaults to "info" level if the variable is not set. Call once at
/// process start; a second call is a no-op error swallowed here.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
