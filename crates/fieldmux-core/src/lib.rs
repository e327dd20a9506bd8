/*!
 * fieldmux Core
 *
 * Protocol-agnostic building blocks for the fieldmux device runtime: the
 * event bus, the generic connection pool, point values, runtime
 * configuration and logging.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod pool;
pub mod prelude;
pub mod types;
pub mod utils;

pub use error::{Error, Result};

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use async_trait;
    pub use chrono;
    pub use futures;
    pub use serde;
    pub use tokio;
    pub use tracing;
}

/// fieldmux core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<()> {
    logging::init()?;
    tracing::info!("fieldmux core {} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
