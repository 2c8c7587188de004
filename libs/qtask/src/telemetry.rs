//! Logger initialization.
//!
//! Maps the facade's logger settings onto a tracing subscriber.
//! Initialization is idempotent: if a subscriber is already installed
//! (tests, embedding applications) the settings are left alone.

use tracing::{debug, info};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Install a global subscriber from the logger settings.
///
/// `RUST_LOG` overrides the configured level when set. Safe to call
/// multiple times; only the first call installs anything.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_filter()));

    let result = match &config.timestamp_format {
        Some(format) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(config.use_colors)
            .with_target(false)
            .with_timer(ChronoUtc::new(format.clone()))
            .try_init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(config.use_colors)
            .with_target(false)
            .try_init(),
    };

    match result {
        Ok(()) => match &config.service_name {
            Some(service) => info!(service = %service, level = %config.level, "Logging initialized"),
            None => info!(level = %config.level, "Logging initialized"),
        },
        Err(_) => {
            debug!("Subscriber already installed; keeping existing logging configuration");
        }
    }
}
