/*!
 * Error types for the fieldmux core crate.
 */
use std::time::Duration;

use thiserror::Error;

/// Error type for fieldmux core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded or deserialized
    #[error("Configuration error: {0}")]
    Config(String),

    /// A value failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Event bus error
    #[error("Event error: {0}")]
    Event(String),

    /// An operation did not finish in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// No pooled resource became available before the acquire timeout
    #[error("Timed out after {0:?} waiting for a pooled resource")]
    AcquireTimeout(Duration),

    /// The pool has been shut down
    #[error("Connection pool is closed")]
    PoolClosed,

    /// The pool's resource manager failed to create a resource
    #[error("Failed to create pooled resource: {0}")]
    ResourceCreation(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for fieldmux core operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error
    pub fn config<S: AsRef<str>>(msg: S) -> Self {
        Error::Config(msg.as_ref().to_string())
    }

    /// Create a new validation error
    pub fn validation<S: AsRef<str>>(msg: S) -> Self {
        Error::Validation(msg.as_ref().to_string())
    }

    /// Create a new event error
    pub fn event<S: AsRef<str>>(msg: S) -> Self {
        Error::Event(msg.as_ref().to_string())
    }

    /// Create a new timeout error
    pub fn timeout<S: AsRef<str>>(msg: S) -> Self {
        Error::Timeout(msg.as_ref().to_string())
    }

    /// Create a new resource creation error
    pub fn resource_creation<S: AsRef<str>>(msg: S) -> Self {
        Error::ResourceCreation(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }

    /// Whether retrying the operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::AcquireTimeout(_) | Error::ResourceCreation(_) | Error::Io(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::timeout("slow").is_transient());
        assert!(Error::AcquireTimeout(Duration::from_millis(5)).is_transient());
        assert!(!Error::PoolClosed.is_transient());
        assert!(!Error::validation("bad").is_transient());
    }

    #[test]
    fn test_messages() {
        assert_eq!(Error::config("missing").to_string(), "Configuration error: missing");
        assert_eq!(Error::PoolClosed.to_string(), "Connection pool is closed");
    }
}
