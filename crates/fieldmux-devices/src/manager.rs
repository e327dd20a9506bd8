/*!
 * Device manager.
 *
 * The [`DeviceManager`] owns every device configuration, the adapter
 * connected for it (if any) and one [`AdapterFactory`] per protocol. It is
 * the single entry point for lifecycle and data operations. Connect and
 * disconnect are serialized per device, so at most one connect attempt is
 * ever in flight for a given id.
 */
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::join_all;
use tracing::{debug, info, warn, Instrument};

use fieldmux_core::{
    event::{ErrorEvent, SharedEventBus},
    logging::operation_span,
    types::Value,
};

use crate::adapter::{Capability, DeviceError, ProtocolAdapter, Result};
use crate::config::{DeviceConfig, Protocol};
use crate::discovery::{BrowseNode, DiscoveredDevice, DiscoveryOptions};
use crate::protocol::{AdapterContext, AdapterFactory, OperationOptions, SubscribeOptions};
use crate::state::DeviceStatus;
use crate::subscription::{DataSubscription, SubscriptionId};

struct DeviceEntry {
    config: Arc<DeviceConfig>,
    adapter: Option<Arc<dyn ProtocolAdapter>>,
}

/// Registry of devices and their adapters
pub struct DeviceManager {
    event_bus: SharedEventBus,
    factories: RwLock<HashMap<Protocol, Arc<dyn AdapterFactory>>>,
    devices: RwLock<HashMap<String, DeviceEntry>>,
    lifecycle: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("devices", &self.device_ids())
            .finish()
    }
}

impl DeviceManager {
    /// Create a manager publishing to `event_bus`
    pub fn new(event_bus: SharedEventBus) -> Self {
        Self {
            event_bus,
            factories: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(HashMap::new()),
        }
    }

    /// The bus adapters and the manager publish to
    pub fn event_bus(&self) -> &SharedEventBus {
        &self.event_bus
    }

    fn read_devices(&self) -> RwLockReadGuard<'_, HashMap<String, DeviceEntry>> {
        self.devices.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_devices(&self) -> RwLockWriteGuard<'_, HashMap<String, DeviceEntry>> {
        self.devices.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lifecycle_map(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lifecycle_lock(&self, device_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.lifecycle_map()
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    /// Register the factory for its protocol, replacing any previous one
    pub fn register_factory<F: AdapterFactory + 'static>(&self, factory: F) {
        let protocol = factory.protocol();
        self.factories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(protocol, Arc::new(factory));
        debug!("Registered adapter factory for {}", protocol);
    }

    /// Whether a factory is registered for `protocol`
    pub fn has_factory(&self, protocol: Protocol) -> bool {
        self.factory(protocol).is_ok()
    }

    fn factory(&self, protocol: Protocol) -> Result<Arc<dyn AdapterFactory>> {
        self.factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&protocol)
            .cloned()
            .ok_or_else(|| DeviceError::ProtocolNotRegistered(protocol.to_string()))
    }

    /// Add or replace a device configuration
    ///
    /// Replacing the configuration of a connected device leaves its adapter
    /// alone; the new settings apply on the next connect.
    pub fn add_device_config(&self, config: DeviceConfig) -> Result<()> {
        config.validate()?;
        let device_id = config.device_id.clone();
        let mut devices = self.write_devices();
        match devices.get_mut(&device_id) {
            Some(entry) => {
                entry.config = Arc::new(config);
                debug!(device_id = %device_id, "Replaced device configuration");
            }
            None => {
                devices.insert(
                    device_id.clone(),
                    DeviceEntry {
                        config: Arc::new(config),
                        adapter: None,
                    },
                );
                debug!(device_id = %device_id, "Added device configuration");
            }
        }
        Ok(())
    }

    /// Disconnect a device and forget its configuration
    ///
    /// Returns whether the device was known.
    pub async fn remove_device(&self, device_id: &str) -> bool {
        let lock = self.lifecycle_lock(device_id);
        let _guard = lock.lock().await;

        let removed = self.write_devices().remove(device_id);
        let Some(entry) = removed else {
            return false;
        };
        if let Some(adapter) = entry.adapter {
            adapter.disconnect().await;
        }
        self.lifecycle_map().remove(device_id);
        info!(device_id = %device_id, "Removed device");
        true
    }

    /// Configuration of a device
    pub fn device_config(&self, device_id: &str) -> Option<DeviceConfig> {
        self.read_devices()
            .get(device_id)
            .map(|entry| entry.config.as_ref().clone())
    }

    /// Identifiers of every configured device, sorted
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read_devices().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The registered adapter of a device, connected or not
    pub fn adapter(&self, device_id: &str) -> Option<Arc<dyn ProtocolAdapter>> {
        self.read_devices()
            .get(device_id)
            .and_then(|entry| entry.adapter.clone())
    }

    fn connected_adapter(&self, device_id: &str) -> Result<Arc<dyn ProtocolAdapter>> {
        self.adapter(device_id)
            .ok_or_else(|| DeviceError::DeviceNotConnected(device_id.to_string()))
    }

    fn report<T>(
        &self,
        device_id: &str,
        operation: &str,
        address: Option<&str>,
        result: Result<T>,
    ) -> Result<T> {
        if let Err(e) = &result {
            let mut event = ErrorEvent::new(device_id, operation, e.to_string());
            if let Some(address) = address {
                event = event.with_address(address);
            }
            self.event_bus.emit_error(event);
        }
        result
    }

    /// Connect a device, returning its adapter
    ///
    /// Returns the existing adapter if it is connected. Otherwise a fresh
    /// adapter is built and registered only once its connect succeeds.
    /// Concurrent calls for the same device wait for each other.
    pub async fn connect_device(&self, device_id: &str) -> Result<Arc<dyn ProtocolAdapter>> {
        let result = self
            .connect_serialized(device_id)
            .instrument(operation_span("connect", device_id))
            .await;
        self.report(device_id, "connect", None, result)
    }

    async fn connect_serialized(&self, device_id: &str) -> Result<Arc<dyn ProtocolAdapter>> {
        let lock = self.lifecycle_lock(device_id);
        let _guard = lock.lock().await;

        let (config, existing) = {
            let devices = self.read_devices();
            let entry = devices
                .get(device_id)
                .ok_or_else(|| DeviceError::DeviceNotFound(device_id.to_string()))?;
            (entry.config.clone(), entry.adapter.clone())
        };

        if let Some(adapter) = existing {
            if adapter.is_connected() {
                debug!("Device already connected");
                return Ok(adapter);
            }
            // stale adapter from an earlier session; start over
            self.take_adapter(device_id);
            adapter.disconnect().await;
        }

        let factory = self.factory(config.protocol())?;
        let adapter = factory
            .create(&config, AdapterContext::new(self.event_bus.clone()))
            .await?;

        adapter.connect().await?;

        match self.write_devices().get_mut(device_id) {
            Some(entry) => entry.adapter = Some(adapter.clone()),
            None => warn!("Device removed while connecting"),
        }
        info!(protocol = %config.protocol(), "Device connected");
        Ok(adapter)
    }

    fn take_adapter(&self, device_id: &str) -> Option<Arc<dyn ProtocolAdapter>> {
        self.write_devices()
            .get_mut(device_id)
            .and_then(|entry| entry.adapter.take())
    }

    /// Disconnect a device; does nothing if no adapter is registered
    pub async fn disconnect_device(&self, device_id: &str) {
        let lock = self.lifecycle_lock(device_id);
        let _guard = lock.lock().await;

        if let Some(adapter) = self.take_adapter(device_id) {
            adapter
                .disconnect()
                .instrument(operation_span("disconnect", device_id))
                .await;
            info!(device_id = %device_id, "Device disconnected");
        }
    }

    /// Connect every enabled device independently
    ///
    /// Disabled devices are skipped and absent from the result.
    pub async fn connect_all(&self) -> HashMap<String, Result<()>> {
        let ids: Vec<String> = {
            let devices = self.read_devices();
            devices
                .iter()
                .filter_map(|(id, entry)| {
                    if entry.config.enabled {
                        Some(id.clone())
                    } else {
                        debug!(device_id = %id, "Skipping disabled device");
                        None
                    }
                })
                .collect()
        };

        let results = join_all(ids.iter().map(|id| async move {
            (id.clone(), self.connect_device(id).await.map(|_| ()))
        }))
        .await;

        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        info!("Connected {} of {} devices", results.len() - failed, results.len());
        results.into_iter().collect()
    }

    /// Disconnect every device that has an adapter
    ///
    /// Returns the identifiers that were disconnected.
    pub async fn disconnect_all(&self) -> Vec<String> {
        let ids: Vec<String> = self
            .read_devices()
            .iter()
            .filter(|(_, entry)| entry.adapter.is_some())
            .map(|(id, _)| id.clone())
            .collect();

        join_all(ids.iter().map(|id| self.disconnect_device(id))).await;
        info!("Disconnected {} devices", ids.len());
        ids
    }

    /// Connect all enabled devices
    pub async fn start(&self) -> HashMap<String, Result<()>> {
        info!("Starting device manager");
        self.connect_all().await
    }

    /// Disconnect all devices; the event bus stays with its owner
    pub async fn stop(&self) {
        info!("Stopping device manager");
        self.disconnect_all().await;
    }

    /// Read one address with default options
    pub async fn read(&self, device_id: &str, address: &str) -> Result<Value> {
        self.read_with_options(device_id, address, &OperationOptions::default())
            .await
    }

    /// Read one address
    pub async fn read_with_options(
        &self,
        device_id: &str,
        address: &str,
        options: &OperationOptions,
    ) -> Result<Value> {
        let result = match self.connected_adapter(device_id) {
            Ok(adapter) => {
                adapter
                    .read(address, options)
                    .instrument(operation_span("read", device_id))
                    .await
            }
            Err(e) => Err(e),
        };
        self.report(device_id, "read", Some(address), result)
    }

    /// Write one address with default options
    pub async fn write(&self, device_id: &str, address: &str, value: Value) -> Result<()> {
        self.write_with_options(device_id, address, value, &OperationOptions::default())
            .await
    }

    /// Write one address
    pub async fn write_with_options(
        &self,
        device_id: &str,
        address: &str,
        value: Value,
        options: &OperationOptions,
    ) -> Result<()> {
        let result = match self.connected_adapter(device_id) {
            Ok(adapter) => {
                adapter
                    .write(address, value, options)
                    .instrument(operation_span("write", device_id))
                    .await
            }
            Err(e) => Err(e),
        };
        self.report(device_id, "write", Some(address), result)
    }

    /// Subscribe to an address
    pub async fn subscribe(
        &self,
        device_id: &str,
        address: &str,
        options: SubscribeOptions,
    ) -> Result<DataSubscription> {
        let result = match self.connected_adapter(device_id) {
            Ok(adapter) => adapter.subscribe(address, options).await,
            Err(e) => Err(e),
        };
        self.report(device_id, "subscribe", Some(address), result)
    }

    /// Remove every subscription to an address; no-op without an adapter
    pub async fn unsubscribe(&self, device_id: &str, address: &str) {
        if let Some(adapter) = self.adapter(device_id) {
            adapter.unsubscribe(address, None).await;
        }
    }

    /// Remove one subscription; no-op without an adapter
    pub async fn unsubscribe_one(&self, device_id: &str, address: &str, id: SubscriptionId) {
        if let Some(adapter) = self.adapter(device_id) {
            adapter.unsubscribe(address, Some(id)).await;
        }
    }

    fn capable_adapter(
        &self,
        device_id: &str,
        capability: Capability,
    ) -> Result<Arc<dyn ProtocolAdapter>> {
        let adapter = self.connected_adapter(device_id)?;
        if adapter.supports(capability) {
            Ok(adapter)
        } else {
            Err(DeviceError::unsupported(format!(
                "{} on {} device {}",
                capability.as_str(),
                adapter.protocol(),
                device_id
            )))
        }
    }

    /// Read several addresses at once
    pub async fn read_many(
        &self,
        device_id: &str,
        addresses: &[String],
        options: &OperationOptions,
    ) -> Result<HashMap<String, Value>> {
        let result = match self.capable_adapter(device_id, Capability::ReadMany) {
            Ok(adapter) => adapter.read_many(addresses, options).await,
            Err(e) => Err(e),
        };
        self.report(device_id, "read_many", None, result)
    }

    /// Write several addresses at once
    pub async fn write_many(
        &self,
        device_id: &str,
        values: HashMap<String, Value>,
        options: &OperationOptions,
    ) -> Result<()> {
        let result = match self.capable_adapter(device_id, Capability::WriteMany) {
            Ok(adapter) => adapter.write_many(values, options).await,
            Err(e) => Err(e),
        };
        self.report(device_id, "write_many", None, result)
    }

    /// List the address space of a device below `path`
    pub async fn browse(&self, device_id: &str, path: Option<&str>) -> Result<Vec<BrowseNode>> {
        let result = match self.capable_adapter(device_id, Capability::Browse) {
            Ok(adapter) => adapter.browse(path).await,
            Err(e) => Err(e),
        };
        self.report(device_id, "browse", path, result)
    }

    /// Find devices reachable through `protocol`
    ///
    /// Uses a throwaway adapter from the protocol's factory; nothing is
    /// registered.
    pub async fn discover(
        &self,
        protocol: Protocol,
        options: &DiscoveryOptions,
    ) -> Result<Vec<DiscoveredDevice>> {
        let factory = self.factory(protocol)?;
        let adapter = factory
            .discovery_adapter(options, AdapterContext::new(self.event_bus.clone()))
            .await?;
        if !adapter.supports(Capability::Discover) {
            return Err(DeviceError::unsupported(format!("discover on {}", protocol)));
        }
        let result = adapter.discover(options).await;
        adapter.disconnect().await;
        result
    }

    /// Status of one device
    pub fn device_status(&self, device_id: &str) -> Result<DeviceStatus> {
        let devices = self.read_devices();
        let entry = devices
            .get(device_id)
            .ok_or_else(|| DeviceError::DeviceNotFound(device_id.to_string()))?;
        Ok(Self::entry_status(device_id, entry))
    }

    /// Status of every configured device, sorted by id
    pub fn list_devices(&self) -> Vec<DeviceStatus> {
        let devices = self.read_devices();
        let mut statuses: Vec<DeviceStatus> = devices
            .iter()
            .map(|(id, entry)| Self::entry_status(id, entry))
            .collect();
        statuses.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        statuses
    }

    fn entry_status(device_id: &str, entry: &DeviceEntry) -> DeviceStatus {
        match &entry.adapter {
            Some(adapter) => adapter.status(),
            None => DeviceStatus::disconnected(device_id, entry.config.protocol()),
        }
    }
}
