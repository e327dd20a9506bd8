/*!
 * Protocol adapter contract.
 *
 * Every protocol implementation exposes the same lifecycle and data-access
 * surface through [`ProtocolAdapter`]. Optional features are advertised as
 * [`Capability`] flags so callers can ask before invoking them.
 */
use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fieldmux_core::{error::Error as CoreError, types::Value};

use crate::config::Protocol;
use crate::discovery::{BrowseNode, DiscoveredDevice, DiscoveryOptions};
use crate::protocol::{OperationOptions, SubscribeOptions};
use crate::state::DeviceStatus;
use crate::subscription::{DataSubscription, SubscriptionId};

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Bad device configuration
    #[error("Validation error: {0}")]
    Validation(String),

    /// No adapter factory is registered for the protocol
    #[error("No adapter registered for protocol {0}")]
    ProtocolNotRegistered(String),

    /// The transport could not be opened or was refused
    #[error("Connection error: {0}")]
    Connection(String),

    /// An operation did not finish in time
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// The adapter is not connected
    #[error("Device not connected")]
    NotConnected,

    /// No connected adapter is registered for the device
    #[error("Device {0} is not connected")]
    DeviceNotConnected(String),

    /// No configuration exists for the device
    #[error("Device {0} not found")]
    DeviceNotFound(String),

    /// Decode or transport failure during a read or write
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The adapter does not have the requested capability
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The address cannot be parsed by the adapter
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The value cannot be written to the address
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    /// Core error
    #[error("Core error: {0}")]
    Core(CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create an unsupported operation error
    pub fn unsupported<S: AsRef<str>>(operation: S) -> Self {
        DeviceError::UnsupportedOperation(operation.as_ref().to_string())
    }

    /// Create a protocol error
    pub fn protocol<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Protocol(msg.as_ref().to_string())
    }

    /// Create a connection error
    pub fn connection<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Connection(msg.as_ref().to_string())
    }

    /// Whether the error is eligible for reconnect backoff
    pub fn is_transient(&self) -> bool {
        match self {
            DeviceError::Connection(_) | DeviceError::Timeout(_) => true,
            DeviceError::Core(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<CoreError> for DeviceError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Timeout(msg) => DeviceError::Timeout(msg),
            CoreError::Validation(msg) | CoreError::Config(msg) => DeviceError::Validation(msg),
            other => DeviceError::Core(other),
        }
    }
}

/// Optional adapter features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Find devices reachable through the protocol
    Discover,
    /// List the address space of a connected device
    Browse,
    /// Read several addresses in one call
    ReadMany,
    /// Write several addresses in one call
    WriteMany,
}

impl Capability {
    /// Name of the capability as used in error messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Discover => "discover",
            Capability::Browse => "browse",
            Capability::ReadMany => "read_many",
            Capability::WriteMany => "write_many",
        }
    }
}

/// The protocol adapter trait
///
/// One instance serves exactly one configured device. The instance is built
/// by an [`AdapterFactory`](crate::protocol::AdapterFactory) from the
/// device's configuration, so `connect` needs no arguments.
///
/// Poll-based adapters turn `subscribe` into a periodic read; push-based
/// adapters register a native listener. Both deliver the same
/// [`DataEvent`](fieldmux_core::event::DataEvent) shape to the subscription
/// and to the event bus.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync + Debug {
    /// Protocol implemented by the adapter
    fn protocol(&self) -> Protocol;

    /// Device the adapter serves
    fn device_id(&self) -> &str;

    /// Optional features the adapter provides
    fn capabilities(&self) -> &[Capability] {
        &[]
    }

    /// Check for an optional feature before invoking it
    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Open the transport
    ///
    /// Moves `disconnected -> connecting`, then `connected` on success or
    /// `error` on failure. Calling it again after a failure starts over.
    async fn connect(&self) -> Result<()>;

    /// Release every subscription and transport resource
    ///
    /// Always ends in `disconnected`. Cleanup failures are logged.
    async fn disconnect(&self);

    /// True only while connected with a live transport
    fn is_connected(&self) -> bool;

    /// Read one address
    async fn read(&self, address: &str, options: &OperationOptions) -> Result<Value>;

    /// Write one address
    async fn write(&self, address: &str, value: Value, options: &OperationOptions) -> Result<()>;

    /// Attach a data sink to an address
    async fn subscribe(&self, address: &str, options: SubscribeOptions) -> Result<DataSubscription>;

    /// Detach one sink (`Some(id)`) or every sink (`None`) from an address
    ///
    /// Unknown addresses and ids are ignored. Removing the last sink releases
    /// the underlying timer or native subscription.
    async fn unsubscribe(&self, address: &str, id: Option<SubscriptionId>);

    /// Status snapshot; never blocks on I/O
    fn status(&self) -> DeviceStatus;

    /// Find devices reachable through this protocol
    async fn discover(&self, _options: &DiscoveryOptions) -> Result<Vec<DiscoveredDevice>> {
        Err(DeviceError::unsupported(Capability::Discover.as_str()))
    }

    /// List the address space below `path`
    async fn browse(&self, _path: Option<&str>) -> Result<Vec<BrowseNode>> {
        Err(DeviceError::unsupported(Capability::Browse.as_str()))
    }

    /// Read several addresses
    async fn read_many(
        &self,
        _addresses: &[String],
        _options: &OperationOptions,
    ) -> Result<HashMap<String, Value>> {
        Err(DeviceError::unsupported(Capability::ReadMany.as_str()))
    }

    /// Write several addresses
    async fn write_many(
        &self,
        _values: HashMap<String, Value>,
        _options: &OperationOptions,
    ) -> Result<()> {
        Err(DeviceError::unsupported(Capability::WriteMany.as_str()))
    }
}
