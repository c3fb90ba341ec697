//! Logging bootstrap

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::quic::error::{QuicError, Result};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a global
/// subscriber is already set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.tracing_level().as_str().to_lowercase()))
        .map_err(|e| QuicError::Config(format!("Invalid log filter: {}", e)))?;

    let (json, text) = match config.format {
        LogFormat::Json => (Some(tracing_subscriber::fmt::layer().json().with_target(true)), None),
        LogFormat::Text => (None, Some(tracing_subscriber::fmt::layer().with_target(true))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init()
        .map_err(|e| QuicError::Config(format!("Failed to install tracing subscriber: {}", e)))?;

    tracing::info!(level = %config.tracing_level(), "Logging initialized");
    Ok(())
}
