//! Tracing initialization.
//!
//! Structured logging via tracing-subscriber with an env-filter; control
//! verbosity with `RUST_LOG` (e.g. `RUST_LOG=darkroom=debug,carousel=debug`).

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_telemetry() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
