/*!
 * Subscription bookkeeping shared by all adapters.
 *
 * A [`SubscriptionRegistry`] keeps one entry per address. Each entry holds
 * the sinks of every subscriber and, for poll-based adapters, the single
 * poller task reading that address. Push-based adapters attach sinks and
 * forward native notifications through [`SubscriptionRegistry::publish`].
 *
 * Sinks are bounded channels. A subscriber that falls behind loses the
 * newest updates rather than stalling the poller or the transport.
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use fieldmux_core::{
    event::{DataEvent, SharedEventBus},
    types::{Quality, Value},
};

use crate::adapter::{DeviceError, Result};
use crate::protocol::SubscribeOptions;

/// Reads one address for a poller
pub type ReadFn = Arc<dyn Fn(String) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Identifies one subscriber of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receiving end of a subscription
#[derive(Debug)]
pub struct DataSubscription {
    id: SubscriptionId,
    device_id: String,
    address: String,
    receiver: mpsc::Receiver<DataEvent>,
}

impl DataSubscription {
    /// Identifier used to unsubscribe this sink alone
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Device the subscription belongs to
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Subscribed address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Wait for the next update; `None` once the subscription is removed
    pub async fn recv(&mut self) -> Option<DataEvent> {
        self.receiver.recv().await
    }

    /// Take an update if one is buffered
    pub fn try_recv(&mut self) -> Option<DataEvent> {
        self.receiver.try_recv().ok()
    }

    /// Give up the wrapper and keep the raw channel
    pub fn into_receiver(self) -> mpsc::Receiver<DataEvent> {
        self.receiver
    }
}

/// Outcome of [`SubscriptionRegistry::detach`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// Nothing matched; no state changed
    Unknown,
    /// Sinks were removed and this many remain
    Remaining(usize),
    /// The last sink is gone and the address was released
    Last,
}

struct Sink {
    id: SubscriptionId,
    tx: mpsc::Sender<DataEvent>,
}

struct Poller {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Poller {
    /// Stop before the next tick; an in-flight read still completes
    fn cancel(self) {
        let _ = self.stop.send(true);
        drop(self.task);
    }
}

#[derive(Default)]
struct Entry {
    sinks: Vec<Sink>,
    poller: Option<Poller>,
}

/// Per-address subscribers of one device
pub struct SubscriptionRegistry {
    device_id: String,
    event_bus: SharedEventBus,
    next_id: AtomicU64,
    dropped: AtomicU64,
    entries: Mutex<HashMap<String, Entry>>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("device_id", &self.device_id)
            .field("addresses", &self.len())
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new(device_id: impl Into<String>, event_bus: SharedEventBus) -> Self {
        Self {
            device_id: device_id.into(),
            event_bus,
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn new_sink(&self, address: &str, buffer: usize) -> (Sink, DataSubscription) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, receiver) = mpsc::channel(buffer.max(1));
        let subscription = DataSubscription {
            id,
            device_id: self.device_id.clone(),
            address: address.to_string(),
            receiver,
        };
        (Sink { id, tx }, subscription)
    }

    /// Add a sink to `address`
    ///
    /// The flag is `true` when this is the first sink, meaning the caller
    /// must now set up the native subscription.
    pub fn attach(&self, address: &str, buffer: usize) -> (DataSubscription, bool) {
        let (sink, subscription) = self.new_sink(address, buffer);
        let mut entries = self.lock();
        let entry = entries.entry(address.to_string()).or_default();
        let first = entry.sinks.is_empty();
        entry.sinks.push(sink);
        trace!(
            device_id = %self.device_id,
            address = %address,
            "Attached {} ({} sinks)", subscription.id, entry.sinks.len()
        );
        (subscription, first)
    }

    /// Add a sink to `address`, starting a poller if none runs yet
    ///
    /// One poller serves every sink of the address. Reads are issued one
    /// after another: a tick waits for the previous read to finish.
    pub fn attach_polled(
        self: &Arc<Self>,
        address: &str,
        options: &SubscribeOptions,
        read: ReadFn,
    ) -> Result<DataSubscription> {
        if options.interval.is_zero() {
            return Err(DeviceError::Validation("poll interval must be non-zero".to_string()));
        }
        let (sink, subscription) = self.new_sink(address, options.buffer);
        let mut entries = self.lock();
        let entry = entries.entry(address.to_string()).or_default();
        entry.sinks.push(sink);
        if entry.poller.is_none() {
            debug!(
                device_id = %self.device_id,
                address = %address,
                "Starting poller every {:?}", options.interval
            );
            entry.poller = Some(spawn_poller(
                Arc::downgrade(self),
                address.to_string(),
                options.interval,
                read,
            ));
        }
        Ok(subscription)
    }

    /// Remove one sink (`Some(id)`) or all sinks (`None`) from `address`
    ///
    /// Removing the last sink cancels the poller and drops the entry.
    pub fn detach(&self, address: &str, id: Option<SubscriptionId>) -> Detached {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(address) else {
            return Detached::Unknown;
        };

        match id {
            Some(id) => {
                let before = entry.sinks.len();
                entry.sinks.retain(|sink| sink.id != id);
                if entry.sinks.len() == before {
                    return Detached::Unknown;
                }
            }
            None => entry.sinks.clear(),
        }

        if !entry.sinks.is_empty() {
            return Detached::Remaining(entry.sinks.len());
        }

        if let Some(entry) = entries.remove(address) {
            if let Some(poller) = entry.poller {
                poller.cancel();
            }
        }
        debug!(device_id = %self.device_id, address = %address, "Released subscription");
        Detached::Last
    }

    /// Drop every subscription, cancelling all pollers
    ///
    /// Returns the released addresses.
    pub fn clear(&self) -> Vec<String> {
        let drained: Vec<(String, Entry)> = self.lock().drain().collect();
        drained
            .into_iter()
            .map(|(address, entry)| {
                if let Some(poller) = entry.poller {
                    poller.cancel();
                }
                address
            })
            .collect()
    }

    /// Deliver a value sampled at `address` to its sinks and the event bus
    pub fn publish(&self, address: &str, value: Value, quality: Quality) {
        let event = DataEvent::new(self.device_id.clone(), address, value, quality);
        self.publish_matching(event, |key| key == address);
    }

    /// Deliver `event` to the sinks of every address key accepted by `matches`
    ///
    /// Push adapters use this when a subscription key is a pattern, such as
    /// an MQTT topic filter.
    pub fn publish_matching<F>(&self, event: DataEvent, matches: F)
    where
        F: Fn(&str) -> bool,
    {
        {
            let entries = self.lock();
            for (key, entry) in entries.iter().filter(|(key, _)| matches(key)) {
                for sink in &entry.sinks {
                    match sink.tx.try_send(event.clone()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            trace!(address = %key, "Sink {} is full, dropping update", sink.id);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            trace!(address = %key, "Sink {} is closed", sink.id);
                        }
                    }
                }
            }
        }
        self.event_bus.emit_data(event);
    }

    /// Subscribed addresses
    pub fn addresses(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Number of subscribed addresses
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no address is subscribed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sinks attached to `address`
    pub fn sink_count(&self, address: &str) -> usize {
        self.lock().get(address).map(|e| e.sinks.len()).unwrap_or(0)
    }

    /// Whether a poller runs for `address`
    pub fn has_poller(&self, address: &str) -> bool {
        self.lock().get(address).map(|e| e.poller.is_some()).unwrap_or(false)
    }

    /// Updates lost to full sinks
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn spawn_poller(
    registry: Weak<SubscriptionRegistry>,
    address: String,
    period: Duration,
    read: ReadFn,
) -> Poller {
    let (stop, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stopped.changed() => break,
                _ = ticker.tick() => {}
            }

            // not raced against `stopped`: a started read always publishes
            let (value, quality) = match read(address.clone()).await {
                Ok(value) => (value, Quality::Good),
                Err(e) => {
                    debug!(address = %address, "Poll read failed: {}", e);
                    (Value::Null, Quality::Bad)
                }
            };

            match registry.upgrade() {
                Some(registry) => registry.publish(&address, value, quality),
                None => break,
            }
        }
        trace!(address = %address, "Poller stopped");
    });
    Poller { stop, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use fieldmux_core::event::DataScope;
    use futures::FutureExt;

    fn registry() -> (Arc<SubscriptionRegistry>, SharedEventBus) {
        let bus = SharedEventBus::new();
        (Arc::new(SubscriptionRegistry::new("plc-1", bus.clone())), bus)
    }

    fn counting_reader(reads: Arc<AtomicUsize>, delay: Duration) -> ReadFn {
        Arc::new(move |_address: String| {
            let reads = reads.clone();
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let n = reads.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Value::Integer(n as i64))
            }
            .boxed()
        })
    }

    fn drain(sub: &mut DataSubscription) -> usize {
        let mut n = 0;
        while sub.try_recv().is_some() {
            n += 1;
        }
        n
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_poller_per_address() -> Result<()> {
        let (registry, _bus) = registry();
        let reads = Arc::new(AtomicUsize::new(0));
        let options = SubscribeOptions::new().with_interval(Duration::from_millis(100));

        let mut a = registry.attach_polled("t1", &options, counting_reader(reads.clone(), Duration::ZERO))?;
        let mut b = registry.attach_polled("t1", &options, counting_reader(reads.clone(), Duration::ZERO))?;
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.sink_count("t1"), 2);

        tokio::time::sleep(Duration::from_millis(350)).await;

        // ticks at 0, 100, 200 and 300 ms, each read once and fanned out
        assert_eq!(reads.load(Ordering::SeqCst), 4);
        assert_eq!(drain(&mut a), 4);
        assert_eq!(drain(&mut b), 4);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_subscriber_keeps_receiving() -> Result<()> {
        let (registry, _bus) = registry();
        let reads = Arc::new(AtomicUsize::new(0));
        let options = SubscribeOptions::new().with_interval(Duration::from_millis(100));
        let reader = counting_reader(reads.clone(), Duration::ZERO);

        let mut a = registry.attach_polled("t1", &options, reader.clone())?;
        let mut b = registry.attach_polled("t1", &options, reader)?;
        tokio::time::sleep(Duration::from_millis(150)).await;
        drain(&mut a);
        drain(&mut b);

        assert_eq!(registry.detach("t1", Some(a.id())), Detached::Remaining(1));
        assert!(registry.has_poller("t1"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(b.try_recv().is_some());
        assert!(a.recv().await.is_none());

        assert_eq!(registry.detach("t1", Some(b.id())), Detached::Last);
        assert!(!registry.has_poller("t1"));
        assert!(registry.is_empty());

        let after = reads.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(reads.load(Ordering::SeqCst), after);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_read_still_published() -> Result<()> {
        let (registry, bus) = registry();
        let mut events = bus.subscribe_data(DataScope::exact("plc-1", "t1")).map_err(DeviceError::from)?;
        let reads = Arc::new(AtomicUsize::new(0));
        let options = SubscribeOptions::new().with_interval(Duration::from_millis(100));

        let _sub = registry.attach_polled("t1", &options, counting_reader(reads.clone(), Duration::from_millis(50)))?;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // first read is sleeping inside the device
        assert_eq!(registry.detach("t1", None), Detached::Last);
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(reads.load(Ordering::SeqCst), 1);
        let event = events.try_recv().map_err(|e| DeviceError::protocol(e.to_string()))?;
        assert_eq!(event.value, Value::Integer(1));
        assert_eq!(event.quality, Quality::Good);
        assert!(events.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_read_degrades_quality() -> Result<()> {
        let (registry, _bus) = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let reader: ReadFn = Arc::new(move |_: String| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(DeviceError::protocol("exception 0x02"))
                } else {
                    Ok(Value::Bool(true))
                }
            }
            .boxed()
        });
        let options = SubscribeOptions::new().with_interval(Duration::from_millis(100));
        let mut sub = registry.attach_polled("co:1", &options, reader)?;

        let first = sub.recv().await.ok_or(DeviceError::NotConnected)?;
        assert_eq!(first.quality, Quality::Bad);
        assert_eq!(first.value, Value::Null);

        // the poller keeps going after a failure
        let second = sub.recv().await.ok_or(DeviceError::NotConnected)?;
        assert_eq!(second.quality, Quality::Good);
        assert_eq!(second.value, Value::Bool(true));
        Ok(())
    }

    #[tokio::test]
    async fn test_full_sink_drops_newest() {
        let (registry, bus) = registry();
        let mut global = bus.subscribe_data(DataScope::Global).unwrap();
        let (mut sub, first) = registry.attach("sensors/temp", 1);
        assert!(first);

        for i in 0..3 {
            registry.publish("sensors/temp", Value::Integer(i), Quality::Good);
        }

        assert_eq!(sub.try_recv().map(|e| e.value), Some(Value::Integer(0)));
        assert!(sub.try_recv().is_none());
        assert_eq!(registry.dropped_count(), 2);

        // the bus still saw every update
        let mut seen = 0;
        while global.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 3);
    }

    #[tokio::test]
    async fn test_publish_matching_patterns() {
        let (registry, _bus) = registry();
        let (mut wildcard, _) = registry.attach("plant/+/temp", 8);
        let (mut exact, _) = registry.attach("plant/a/temp", 8);
        let (mut other, _) = registry.attach("plant/a/pressure", 8);

        let event = DataEvent::new("plc-1", "plant/a/temp", Value::Float(21.5), Quality::Good);
        registry.publish_matching(event, |key| key.ends_with("/temp"));

        assert!(wildcard.try_recv().is_some());
        assert!(exact.try_recv().is_some());
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_detach_unknown_is_noop() {
        let (registry, _bus) = registry();
        assert_eq!(registry.detach("nothing", None), Detached::Unknown);

        let (sub, _) = registry.attach("a", 4);
        let (other, first) = registry.attach("a", 4);
        assert!(!first);
        assert_eq!(registry.detach("a", Some(SubscriptionId(9999))), Detached::Unknown);
        assert_eq!(registry.sink_count("a"), 2);
        assert_eq!(registry.detach("a", Some(sub.id())), Detached::Remaining(1));
        assert_eq!(registry.detach("a", Some(other.id())), Detached::Last);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let (registry, _bus) = registry();
        let options = SubscribeOptions::new().with_interval(Duration::ZERO);
        let reader = counting_reader(Arc::new(AtomicUsize::new(0)), Duration::ZERO);
        assert!(matches!(
            registry.attach_polled("a", &options, reader),
            Err(DeviceError::Validation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_pollers() -> Result<()> {
        let (registry, _bus) = registry();
        let reads = Arc::new(AtomicUsize::new(0));
        let options = SubscribeOptions::new().with_interval(Duration::from_millis(100));
        let _a = registry.attach_polled("a", &options, counting_reader(reads.clone(), Duration::ZERO))?;
        let _b = registry.attach_polled("b", &options, counting_reader(reads.clone(), Duration::ZERO))?;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut released = registry.clear();
        released.sort();
        assert_eq!(released, vec!["a".to_string(), "b".to_string()]);

        let after = reads.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(reads.load(Ordering::SeqCst), after);
        Ok(())
    }
}
