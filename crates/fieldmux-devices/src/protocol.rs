/*!
 * Per-call options and adapter construction.
 *
 * [`OperationOptions`] and [`SubscribeOptions`] carry per-call overrides.
 * An [`AdapterFactory`] builds one adapter per device configuration; the
 * device manager keeps one factory per [`Protocol`].
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use fieldmux_core::{event::SharedEventBus, types::Value};

use crate::adapter::{Capability, DeviceError, ProtocolAdapter, Result};
use crate::config::{DeviceConfig, Protocol};
use crate::discovery::DiscoveryOptions;

/// Default period between poll reads
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Default number of undelivered updates a subscription buffers
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 64;

/// Options for a single read or write
#[derive(Debug, Clone, Default)]
pub struct OperationOptions {
    /// Overrides the device's configured timeout
    pub timeout: Option<Duration>,
    /// Additional protocol-specific options
    pub options: HashMap<String, Value>,
}

impl OperationOptions {
    /// Creates a new instance of operation options
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the timeout for the operation
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds a protocol-specific option
    pub fn with_option<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Gets a string option
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    /// Gets an integer option
    pub fn get_integer(&self, key: &str) -> Option<i64> {
        self.options.get(key).and_then(Value::as_integer)
    }

    /// Gets a boolean option
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(Value::as_bool)
    }

    /// Gets the timeout or a default value
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }
}

/// Options for a subscription
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Poll period for poll-based adapters; ignored by push-based ones
    pub interval: Duration,
    /// Updates buffered for a slow consumer before new ones are dropped
    pub buffer: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            buffer: DEFAULT_SUBSCRIPTION_BUFFER,
        }
    }
}

impl SubscribeOptions {
    /// Creates a new instance of subscribe options
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the poll interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the sink buffer size
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }
}

/// Everything an adapter receives from its owner besides the configuration
#[derive(Debug, Clone)]
pub struct AdapterContext {
    /// Bus that receives the adapter's data and status events
    pub event_bus: SharedEventBus,
}

impl AdapterContext {
    /// Create a context around an event bus
    pub fn new(event_bus: SharedEventBus) -> Self {
        Self { event_bus }
    }
}

/// Builds adapters for one protocol
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    /// Protocol served by the factory
    fn protocol(&self) -> Protocol;

    /// Build a fresh, disconnected adapter for `config`
    async fn create(
        &self,
        config: &DeviceConfig,
        context: AdapterContext,
    ) -> Result<Arc<dyn ProtocolAdapter>>;

    /// Build a throwaway adapter used only for discovery
    ///
    /// Discovery needs no configured device, so the factory decides how to
    /// reach the network from `options`.
    async fn discovery_adapter(
        &self,
        _options: &DiscoveryOptions,
        _context: AdapterContext,
    ) -> Result<Arc<dyn ProtocolAdapter>> {
        Err(DeviceError::unsupported(Capability::Discover.as_str()))
    }
}

type CreateFn =
    dyn Fn(&DeviceConfig, AdapterContext) -> Result<Arc<dyn ProtocolAdapter>> + Send + Sync;

/// An [`AdapterFactory`] backed by a closure
pub struct FnAdapterFactory {
    protocol: Protocol,
    create: Box<CreateFn>,
}

impl FnAdapterFactory {
    /// Wrap a constructor closure
    pub fn new<F>(protocol: Protocol, create: F) -> Self
    where
        F: Fn(&DeviceConfig, AdapterContext) -> Result<Arc<dyn ProtocolAdapter>> + Send + Sync + 'static,
    {
        Self {
            protocol,
            create: Box::new(create),
        }
    }
}

impl fmt::Debug for FnAdapterFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAdapterFactory")
            .field("protocol", &self.protocol)
            .finish()
    }
}

#[async_trait]
impl AdapterFactory for FnAdapterFactory {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn create(
        &self,
        config: &DeviceConfig,
        context: AdapterContext,
    ) -> Result<Arc<dyn ProtocolAdapter>> {
        (self.create)(config, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_options() {
        let options = OperationOptions::new()
            .with_timeout(Duration::from_millis(250))
            .with_option("count", 4)
            .with_option("encoding", "utf8")
            .with_option("retain", true);

        assert_eq!(options.get_integer("count"), Some(4));
        assert_eq!(options.get_string("encoding"), Some("utf8"));
        assert_eq!(options.get_bool("retain"), Some(true));
        assert_eq!(options.get_integer("missing"), None);
        assert_eq!(options.timeout_or(Duration::from_secs(5)), Duration::from_millis(250));
        assert_eq!(
            OperationOptions::new().timeout_or(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_subscribe_defaults() {
        let options = SubscribeOptions::default();
        assert_eq!(options.interval, Duration::from_millis(1000));
        assert_eq!(options.buffer, 64);

        let fast = SubscribeOptions::new().with_interval(Duration::from_millis(50)).with_buffer(4);
        assert_eq!(fast.interval, Duration::from_millis(50));
        assert_eq!(fast.buffer, 4);
    }
}
