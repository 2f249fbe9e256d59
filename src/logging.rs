//! Tracing subscriber setup for binaries and demos driving a pipeline.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the application.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter` (e.g. `"catena=info"`).
/// With `json` set, events are written as one JSON object per line.
///
/// # Errors
///
/// Fails if `default_filter` does not parse or a global subscriber is
/// already installed.
pub fn init_tracing(default_filter: &str, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?;
    }
    Ok(())
}
