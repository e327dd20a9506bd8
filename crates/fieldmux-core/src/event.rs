/*!
 * Event bus for fieldmux.
 *
 * Fans data, status and error events out to subscribers. Data events are
 * addressable at three scopes (exact point, whole device, global) and every
 * emitted data event is delivered to all three. Status and error events are
 * addressable per device or globally.
 *
 * Each scope owns a bounded broadcast channel. A slow receiver loses the
 * oldest events rather than stalling the publisher.
 */
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::types::{ConnectionState, Quality, Value};

/// Default number of events buffered per scope
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A sampled value from one device point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEvent {
    /// Device the value came from
    pub device_id: String,
    /// Point address within the device
    pub address: String,
    /// The value itself
    pub value: Value,
    /// How far the value can be trusted
    pub quality: Quality,
    /// When the value was sampled
    pub timestamp: DateTime<Utc>,
}

impl DataEvent {
    /// Create a data event stamped with the current time
    pub fn new(
        device_id: impl Into<String>,
        address: impl Into<String>,
        value: Value,
        quality: Quality,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            address: address.into(),
            value,
            quality,
            timestamp: Utc::now(),
        }
    }
}

/// A connection state change of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Device whose state changed
    pub device_id: String,
    /// State before the change
    pub previous: ConnectionState,
    /// State after the change
    pub state: ConnectionState,
    /// Optional detail, usually the error that caused the change
    pub message: Option<String>,
    /// When the change happened
    pub timestamp: DateTime<Utc>,
}

/// An error raised while operating on one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Device the error belongs to
    pub device_id: String,
    /// Operation that failed (`connect`, `read`, ...)
    pub operation: String,
    /// Point address, when the operation targeted one
    pub address: Option<String>,
    /// Error message
    pub message: String,
    /// When the error happened
    pub timestamp: DateTime<Utc>,
}

impl ErrorEvent {
    /// Create an error event stamped with the current time
    pub fn new(
        device_id: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            operation: operation.into(),
            address: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Attach the point address
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

/// Any event carried by the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    /// A sampled value
    Data(DataEvent),
    /// A connection state change
    Status(StatusEvent),
    /// An operation error
    Error(ErrorEvent),
}

impl Event {
    /// Device the event belongs to
    pub fn device_id(&self) -> &str {
        match self {
            Event::Data(e) => &e.device_id,
            Event::Status(e) => &e.device_id,
            Event::Error(e) => &e.device_id,
        }
    }

    /// When the event happened
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::Data(e) => e.timestamp,
            Event::Status(e) => e.timestamp,
            Event::Error(e) => e.timestamp,
        }
    }
}

/// Subscription scope for data events
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataScope {
    /// One point of one device
    Exact {
        /// Device id
        device_id: String,
        /// Point address
        address: String,
    },
    /// Every point of one device
    Device(String),
    /// Every point of every device
    Global,
}

impl DataScope {
    /// Scope for one point of one device
    pub fn exact(device_id: impl Into<String>, address: impl Into<String>) -> Self {
        DataScope::Exact {
            device_id: device_id.into(),
            address: address.into(),
        }
    }

    /// Scope for every point of one device
    pub fn device(device_id: impl Into<String>) -> Self {
        DataScope::Device(device_id.into())
    }

    fn matching(event: &DataEvent) -> [DataScope; 3] {
        [
            DataScope::exact(&event.device_id, &event.address),
            DataScope::device(&event.device_id),
            DataScope::Global,
        ]
    }
}

/// Subscription scope for status and error events
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceScope {
    /// One device
    Device(String),
    /// Every device
    Global,
}

impl DeviceScope {
    /// Scope for one device
    pub fn device(device_id: impl Into<String>) -> Self {
        DeviceScope::Device(device_id.into())
    }

    fn matching(device_id: &str) -> [DeviceScope; 2] {
        [DeviceScope::device(device_id), DeviceScope::Global]
    }
}

/// Throughput counters of the bus
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventBusStats {
    /// Events emitted since the bus was created
    pub event_count: u64,
    /// Events emitted after the bus was stopped
    pub dropped_count: u64,
    /// Time since the bus was created
    pub uptime: Duration,
    /// Average emit rate over the uptime
    pub events_per_second: f64,
}

/// One broadcast channel per scope key
#[derive(Debug)]
struct Topics<K, E> {
    senders: Mutex<HashMap<K, broadcast::Sender<E>>>,
}

impl<K, E> Topics<K, E>
where
    K: Eq + Hash + Clone + Debug,
    E: Clone,
{
    fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
        }
    }

    fn subscribe(&self, key: K, capacity: usize) -> Result<broadcast::Receiver<E>> {
        let mut senders = self
            .senders
            .lock()
            .map_err(|_| Error::event("Failed to lock event channels"))?;
        let sender = senders
            .entry(key)
            .or_insert_with(|| broadcast::channel(capacity).0);
        Ok(sender.subscribe())
    }

    /// Deliver `event` to every key in `keys`; returns the number of receivers reached
    fn send(&self, keys: &[K], event: &E) -> usize {
        let Ok(mut senders) = self.senders.lock() else {
            warn!("Event channels poisoned, dropping event");
            return 0;
        };

        let mut delivered = 0;
        for key in keys {
            let Some(sender) = senders.get(key) else {
                continue;
            };
            match sender.send(event.clone()) {
                Ok(n) => delivered += n,
                Err(_) => {
                    trace!("Pruning channel without receivers: {:?}", key);
                    senders.remove(key);
                }
            }
        }
        delivered
    }

    fn clear(&self) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.clear();
        }
    }

    fn len(&self) -> usize {
        self.senders.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// Event bus for publishing and subscribing to device events
#[derive(Debug)]
pub struct EventBus {
    data: Topics<DataScope, DataEvent>,
    status: Topics<DeviceScope, StatusEvent>,
    errors: Topics<DeviceScope, ErrorEvent>,
    channel_capacity: usize,
    event_count: AtomicU64,
    dropped_count: AtomicU64,
    started_at: Instant,
    stopped: AtomicBool,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with a specific per-scope channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Topics::new(),
            status: Topics::new(),
            errors: Topics::new(),
            channel_capacity: capacity.max(1),
            event_count: AtomicU64::new(0),
            dropped_count: AtomicU64::new(0),
            started_at: Instant::now(),
            stopped: AtomicBool::new(false),
        }
    }

    fn accept(&self) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            self.dropped_count.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.event_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Publish a data event at exact, device and global scope
    ///
    /// Returns the number of receivers the event reached.
    pub fn emit_data(&self, event: DataEvent) -> usize {
        if !self.accept() {
            return 0;
        }
        let delivered = self.data.send(&DataScope::matching(&event), &event);
        trace!(
            device_id = %event.device_id,
            address = %event.address,
            "Published data event to {} receivers",
            delivered
        );
        delivered
    }

    /// Publish a status event at device and global scope
    pub fn emit_status(&self, event: StatusEvent) -> usize {
        if !self.accept() {
            return 0;
        }
        debug!(
            device_id = %event.device_id,
            "Device state {} -> {}",
            event.previous,
            event.state
        );
        self.status.send(&DeviceScope::matching(&event.device_id), &event)
    }

    /// Publish an error event at device and global scope
    pub fn emit_error(&self, event: ErrorEvent) -> usize {
        if !self.accept() {
            return 0;
        }
        self.errors.send(&DeviceScope::matching(&event.device_id), &event)
    }

    /// Subscribe to data events in a scope
    pub fn subscribe_data(&self, scope: DataScope) -> Result<broadcast::Receiver<DataEvent>> {
        self.ensure_running()?;
        self.data.subscribe(scope, self.channel_capacity)
    }

    /// Subscribe to status events in a scope
    pub fn subscribe_status(&self, scope: DeviceScope) -> Result<broadcast::Receiver<StatusEvent>> {
        self.ensure_running()?;
        self.status.subscribe(scope, self.channel_capacity)
    }

    /// Subscribe to error events in a scope
    pub fn subscribe_errors(&self, scope: DeviceScope) -> Result<broadcast::Receiver<ErrorEvent>> {
        self.ensure_running()?;
        self.errors.subscribe(scope, self.channel_capacity)
    }

    /// Run `callback` for every data event in a scope
    ///
    /// The callback runs on a spawned task. A panicking callback is logged and
    /// the listener keeps going; other subscribers are unaffected.
    pub fn on_data<F>(&self, scope: DataScope, callback: F) -> Result<ListenerHandle>
    where
        F: Fn(&DataEvent) + Send + Sync + 'static,
    {
        let rx = self.subscribe_data(scope)?;
        Ok(ListenerHandle::spawn("data", rx, callback))
    }

    /// Run `callback` for every status event in a scope
    pub fn on_status<F>(&self, scope: DeviceScope, callback: F) -> Result<ListenerHandle>
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        let rx = self.subscribe_status(scope)?;
        Ok(ListenerHandle::spawn("status", rx, callback))
    }

    /// Run `callback` for every error event in a scope
    pub fn on_error<F>(&self, scope: DeviceScope, callback: F) -> Result<ListenerHandle>
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        let rx = self.subscribe_errors(scope)?;
        Ok(ListenerHandle::spawn("error", rx, callback))
    }

    /// Throughput counters
    pub fn stats(&self) -> EventBusStats {
        let uptime = self.started_at.elapsed();
        let event_count = self.event_count.load(Ordering::Relaxed);
        let secs = uptime.as_secs_f64();
        EventBusStats {
            event_count,
            dropped_count: self.dropped_count.load(Ordering::Relaxed),
            uptime,
            events_per_second: if secs > 0.0 { event_count as f64 / secs } else { 0.0 },
        }
    }

    /// Number of scopes that currently have a channel
    pub fn channel_count(&self) -> usize {
        self.data.len() + self.status.len() + self.errors.len()
    }

    /// Close every channel; later emits are dropped and later subscribes fail
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.data.clear();
        self.status.clear();
        self.errors.clear();
        debug!("Event bus stopped");
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            Err(Error::event("Event bus is stopped"))
        } else {
            Ok(())
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a callback listener; dropping it stops the listener
#[derive(Debug)]
#[must_use = "dropping the handle stops the listener"]
pub struct ListenerHandle {
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    fn spawn<E, F>(kind: &'static str, mut rx: broadcast::Receiver<E>, callback: F) -> Self
    where
        E: Clone + Send + 'static,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                            warn!("A {} event listener panicked; continuing", kind);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("A {} event listener lagged, skipped {} events", kind, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            trace!("{} event listener finished", kind);
        });
        Self { task: Some(task) }
    }

    /// Stop the listener now
    pub fn cancel(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Let the listener run until the bus stops
    pub fn detach(mut self) {
        self.task.take();
    }

    /// Whether the listener task has finished
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A shared event bus that can be cloned
#[derive(Debug, Clone)]
pub struct SharedEventBus(Arc<EventBus>);

impl SharedEventBus {
    /// Create a new shared event bus
    pub fn new() -> Self {
        Self(Arc::new(EventBus::new()))
    }

    /// Create a new shared event bus with a specific channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Arc::new(EventBus::with_capacity(capacity)))
    }
}

impl Default for SharedEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for SharedEventBus {
    type Target = EventBus;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<EventBus> for SharedEventBus {
    fn from(bus: EventBus) -> Self {
        Self(Arc::new(bus))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn sample(device: &str, address: &str, v: i64) -> DataEvent {
        DataEvent::new(device, address, Value::Integer(v), Quality::Good)
    }

    #[tokio::test]
    async fn test_emit_data_reaches_all_three_scopes() -> Result<()> {
        let bus = EventBus::new();
        let mut exact = bus.subscribe_data(DataScope::exact("d1", "a1"))?;
        let mut device = bus.subscribe_data(DataScope::device("d1"))?;
        let mut global = bus.subscribe_data(DataScope::Global)?;

        let delivered = bus.emit_data(sample("d1", "a1", 5));
        assert_eq!(delivered, 3);

        for rx in [&mut exact, &mut device, &mut global] {
            let event = rx.recv().await.map_err(|e| Error::event(e.to_string()))?;
            assert_eq!(event.value, Value::Integer(5));
            assert_eq!(event.address, "a1");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_scopes_filter_other_points() -> Result<()> {
        let bus = EventBus::new();
        let mut exact = bus.subscribe_data(DataScope::exact("d1", "a1"))?;
        let mut device = bus.subscribe_data(DataScope::device("d1"))?;
        let mut global = bus.subscribe_data(DataScope::Global)?;

        bus.emit_data(sample("d1", "a2", 1));
        bus.emit_data(sample("d2", "a1", 2));

        assert!(exact.try_recv().is_err());
        assert_eq!(device.try_recv().map(|e| e.address).ok(), Some("a2".to_string()));
        assert!(device.try_recv().is_err());
        assert_eq!(global.try_recv().map(|e| e.device_id).ok(), Some("d1".to_string()));
        assert_eq!(global.try_recv().map(|e| e.device_id).ok(), Some("d2".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_status_and_error_scopes() -> Result<()> {
        let bus = EventBus::new();
        let mut d1 = bus.subscribe_status(DeviceScope::device("d1"))?;
        let mut all_errors = bus.subscribe_errors(DeviceScope::Global)?;

        bus.emit_status(StatusEvent {
            device_id: "d2".into(),
            previous: ConnectionState::Disconnected,
            state: ConnectionState::Connecting,
            message: None,
            timestamp: Utc::now(),
        });
        bus.emit_status(StatusEvent {
            device_id: "d1".into(),
            previous: ConnectionState::Disconnected,
            state: ConnectionState::Connecting,
            message: None,
            timestamp: Utc::now(),
        });
        bus.emit_error(ErrorEvent::new("d9", "read", "boom").with_address("hr:1"));

        assert_eq!(d1.try_recv().map(|e| e.device_id).ok(), Some("d1".to_string()));
        assert!(d1.try_recv().is_err());
        let err = all_errors.try_recv().map_err(|e| Error::event(e.to_string()))?;
        assert_eq!(err.address.as_deref(), Some("hr:1"));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_panicking_listener_does_not_block_others() -> Result<()> {
        let bus = SharedEventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let _bad = bus.on_data(DataScope::Global, |_| panic!("listener bug"))?;
        let counter = seen.clone();
        let _good = bus.on_data(DataScope::device("d1"), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })?;

        bus.emit_data(sample("d1", "a1", 1));
        bus.emit_data(sample("d1", "a1", 2));

        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_lagging_receiver_drops_oldest() -> Result<()> {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe_data(DataScope::Global)?;
        for i in 0..5 {
            bus.emit_data(sample("d1", "a1", i));
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        let next = rx.recv().await.map_err(|e| Error::event(e.to_string()))?;
        assert_eq!(next.value, Value::Integer(3));
        Ok(())
    }

    #[tokio::test]
    async fn test_channels_without_receivers_are_pruned() -> Result<()> {
        let bus = EventBus::new();
        let rx = bus.subscribe_data(DataScope::exact("d1", "a1"))?;
        assert_eq!(bus.channel_count(), 1);
        drop(rx);
        assert_eq!(bus.emit_data(sample("d1", "a1", 1)), 0);
        assert_eq!(bus.channel_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_stats_and_stop() -> Result<()> {
        let bus = SharedEventBus::new();
        let mut rx = bus.subscribe_data(DataScope::Global)?;
        bus.emit_data(sample("d1", "a1", 1));
        bus.emit_error(ErrorEvent::new("d1", "write", "nope"));
        assert_eq!(bus.stats().event_count, 2);

        bus.stop();
        assert!(bus.is_stopped());
        assert_eq!(bus.emit_data(sample("d1", "a1", 2)), 0);
        assert_eq!(bus.stats().event_count, 2);
        assert_eq!(bus.stats().dropped_count, 1);
        assert!(bus.subscribe_data(DataScope::Global).is_err());

        // buffered event still drains, then the channel reports closed
        assert!(rx.recv().await.is_ok());
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
        Ok(())
    }

    #[tokio::test]
    async fn test_listener_cancel() -> Result<()> {
        let bus = SharedEventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handle = bus.on_data(DataScope::Global, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })?;
        handle.cancel();
        tokio::task::yield_now().await;
        bus.emit_data(sample("d1", "a1", 1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::Data(sample("d1", "a1", 3));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "data");
        assert_eq!(json["quality"], "good");
        assert_eq!(event.device_id(), "d1");
    }
}
