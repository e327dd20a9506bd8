/*!
 * Logging functionality for fieldmux.
 *
 * Tracing setup plus span helpers so every device operation logs with the
 * same fields.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// `RUST_LOG` takes precedence over `filter` when set.
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "fieldmux_devices=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    init_with_config(&LoggingConfig {
        level: filter.to_string(),
        ..LoggingConfig::default()
    })
}

/// Initialize the logging system from the `logging` configuration section
pub fn init_with_config(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = if config.json_format {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(config.with_target))
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(config.with_target))
            .with(filter)
            .try_init()
    };

    result.map_err(|e| Error::other(format!("Failed to initialize logging: {}", e)))
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a span covering everything done for one device
///
/// # Arguments
///
/// * `device_id` - The device the work belongs to
/// * `protocol` - The device's protocol tag
pub fn device_span(device_id: &str, protocol: &str) -> Span {
    tracing::info_span!("device", device_id = %device_id, protocol = %protocol)
}

/// Create a span for a single operation on a device
///
/// # Arguments
///
/// * `name` - The name of the operation (`connect`, `read`, ...)
/// * `device_id` - The device being operated on
pub fn operation_span(name: &str, device_id: &str) -> Span {
    tracing::debug_span!("operation", name = %name, device_id = %device_id)
}
