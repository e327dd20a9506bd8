/*!
 * fieldmux Devices
 *
 * The protocol adapter contract, the device manager that owns adapters and
 * their lifecycle, and the Modbus TCP and MQTT adapters.
 *
 * A host builds a [`DeviceManager`] around a shared event bus, registers an
 * [`AdapterFactory`] per protocol, adds [`DeviceConfig`]s and then reads,
 * writes and subscribes by device id and address.
 */

#![warn(missing_docs)]

// Re-export core types
pub use fieldmux_core::prelude;

pub mod adapter;
pub mod config;
pub mod discovery;
pub mod manager;
pub mod protocol;
pub mod protocols;
pub mod reconnect;
pub mod state;
pub mod subscription;

#[cfg(test)]
mod testing;

pub use adapter::{Capability, DeviceError, ProtocolAdapter, Result};
pub use config::{load_device_configs, DeviceConfig, Protocol, ProtocolSettings, ReconnectConfig};
pub use discovery::{BrowseNode, DiscoveredDevice, DiscoveryOptions};
pub use manager::DeviceManager;
pub use protocol::{AdapterContext, AdapterFactory, FnAdapterFactory, OperationOptions, SubscribeOptions};
pub use state::{DeviceMetrics, DeviceStatus};
pub use subscription::{DataSubscription, SubscriptionId};

/// fieldmux devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocols with an adapter compiled into this build
pub fn available_protocols() -> Vec<Protocol> {
    let mut protocols = Vec::new();

    #[cfg(feature = "modbus")]
    protocols.push(Protocol::Modbus);

    #[cfg(feature = "mqtt")]
    protocols.push(Protocol::Mqtt);

    protocols
}
