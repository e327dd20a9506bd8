/*!
 * Protocol adapters shipped with fieldmux.
 *
 * Each adapter sits behind its cargo feature. OPC UA and S7 devices can be
 * configured, but a host has to register its own factory for them.
 */

#[cfg(feature = "modbus")]
pub mod modbus;

#[cfg(feature = "mqtt")]
pub mod mqtt;

#[cfg(feature = "modbus")]
pub use modbus::{ModbusAdapter, ModbusAdapterFactory, ModbusAddress};

#[cfg(feature = "mqtt")]
pub use mqtt::{MqttAdapter, MqttAdapterFactory};

use crate::manager::DeviceManager;

/// Register a factory for every adapter compiled into the crate
#[cfg_attr(not(any(feature = "modbus", feature = "mqtt")), allow(unused_variables))]
pub fn register_builtin_factories(manager: &DeviceManager) {
    #[cfg(feature = "modbus")]
    manager.register_factory(ModbusAdapterFactory);

    #[cfg(feature = "mqtt")]
    manager.register_factory(MqttAdapterFactory);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use fieldmux_core::event::SharedEventBus;

    #[test]
    fn test_register_builtin_factories() {
        let manager = DeviceManager::new(SharedEventBus::new());
        register_builtin_factories(&manager);
        assert_eq!(manager.has_factory(Protocol::Modbus), cfg!(feature = "modbus"));
        assert_eq!(manager.has_factory(Protocol::Mqtt), cfg!(feature = "mqtt"));
        assert!(!manager.has_factory(Protocol::OpcUa));
    }
}
