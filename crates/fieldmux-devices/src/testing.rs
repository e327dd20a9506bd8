/*!
 * Scriptable in-memory adapter for tests.
 */
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;

use fieldmux_core::types::{ConnectionState, Value};

use crate::adapter::{Capability, DeviceError, ProtocolAdapter, Result};
use crate::config::{DeviceConfig, Protocol, ProtocolSettings, S7Settings};
use crate::protocol::{AdapterContext, FnAdapterFactory, OperationOptions, SubscribeOptions};
use crate::state::{DeviceStatus, StatusTracker};
use crate::subscription::{DataSubscription, ReadFn, SubscriptionId, SubscriptionRegistry};

/// Knobs and counters shared by every mock adapter a factory builds
#[derive(Debug, Default)]
pub(crate) struct MockControl {
    pub connect_calls: AtomicUsize,
    pub disconnect_calls: AtomicUsize,
    pub reads: AtomicUsize,
    /// Connect attempts that still have to fail
    pub failing_connects: AtomicUsize,
    pub connect_delay_ms: AtomicU64,
    pub values: Mutex<HashMap<String, Value>>,
}

impl MockControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connects(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn set_value(&self, address: &str, value: Value) {
        self.values.lock().unwrap().insert(address.to_string(), value);
    }

    fn read_value(&self, address: &str) -> Result<Value> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.values
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| DeviceError::InvalidAddress(address.to_string()))
    }
}

#[derive(Debug)]
pub(crate) struct MockAdapter {
    device_id: String,
    protocol: Protocol,
    tracker: StatusTracker,
    subscriptions: Arc<SubscriptionRegistry>,
    control: Arc<MockControl>,
}

impl MockAdapter {
    fn new(config: &DeviceConfig, context: AdapterContext, control: Arc<MockControl>) -> Self {
        let device_id = config.device_id.clone();
        Self {
            tracker: StatusTracker::new(&device_id, config.protocol(), context.event_bus.clone()),
            subscriptions: Arc::new(SubscriptionRegistry::new(&device_id, context.event_bus)),
            protocol: config.protocol(),
            device_id,
            control,
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.tracker.is_connected() {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }
}

#[async_trait]
impl ProtocolAdapter for MockAdapter {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::ReadMany]
    }

    async fn connect(&self) -> Result<()> {
        self.tracker.transition(ConnectionState::Connecting, None);
        let delay = self.control.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.control.connect_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self.control.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.control.failing_connects.store(failing - 1, Ordering::SeqCst);
            let msg = "connection refused".to_string();
            self.tracker.transition(ConnectionState::Error, Some(msg.clone()));
            return Err(DeviceError::Connection(msg));
        }

        self.tracker.transition(ConnectionState::Connected, None);
        Ok(())
    }

    async fn disconnect(&self) {
        self.subscriptions.clear();
        self.control.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.tracker.transition(ConnectionState::Disconnected, None);
    }

    fn is_connected(&self) -> bool {
        self.tracker.is_connected()
    }

    async fn read(&self, address: &str, _options: &OperationOptions) -> Result<Value> {
        self.ensure_connected()?;
        let result = self.control.read_value(address);
        self.tracker.record_read(1.0, result.is_ok());
        result
    }

    async fn write(&self, address: &str, value: Value, _options: &OperationOptions) -> Result<()> {
        self.ensure_connected()?;
        self.control.set_value(address, value);
        self.tracker.record_write(1.0, true);
        Ok(())
    }

    async fn subscribe(&self, address: &str, options: SubscribeOptions) -> Result<DataSubscription> {
        self.ensure_connected()?;
        let control = self.control.clone();
        let read: ReadFn = Arc::new(move |address: String| {
            let control = control.clone();
            async move { control.read_value(&address) }.boxed()
        });
        self.subscriptions.attach_polled(address, &options, read)
    }

    async fn unsubscribe(&self, address: &str, id: Option<SubscriptionId>) {
        self.subscriptions.detach(address, id);
    }

    fn status(&self) -> DeviceStatus {
        self.tracker.snapshot(self.subscriptions.len())
    }

    async fn read_many(
        &self,
        addresses: &[String],
        options: &OperationOptions,
    ) -> Result<HashMap<String, Value>> {
        let mut values = HashMap::new();
        for address in addresses {
            values.insert(address.clone(), self.read(address, options).await?);
        }
        Ok(values)
    }
}

/// Factory building [`MockAdapter`]s for `protocol`
pub(crate) fn mock_factory(protocol: Protocol, control: Arc<MockControl>) -> FnAdapterFactory {
    FnAdapterFactory::new(protocol, move |config, context| {
        let adapter: Arc<dyn ProtocolAdapter> =
            Arc::new(MockAdapter::new(config, context, control.clone()));
        Ok(adapter)
    })
}

/// Configuration of an S7 device served by the mock
pub(crate) fn s7_device(device_id: &str) -> DeviceConfig {
    DeviceConfig::new(
        device_id,
        ProtocolSettings::S7(S7Settings {
            host: "192.168.0.10".to_string(),
            port: 102,
            rack: 0,
            slot: 1,
        }),
    )
}
