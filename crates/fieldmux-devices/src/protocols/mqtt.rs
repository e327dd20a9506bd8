/*!
 * MQTT adapter.
 *
 * Subscriptions map onto broker subscriptions: the first subscriber of a
 * topic filter subscribes at the broker and the last one to leave
 * unsubscribes. Every incoming publish updates a last-value cache and is
 * fanned out to each subscription whose filter matches the topic.
 *
 * Payloads are decoded as JSON, then UTF-8 text, then raw bytes. A JSON
 * object carrying a `quality` field sets the quality of the sample, and its
 * `value` field, when present, becomes the value.
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn, Instrument};
use uuid::Uuid;

use fieldmux_core::{
    event::{DataEvent, SharedEventBus},
    logging::device_span,
    types::{ConnectionState, Quality, Value},
    utils::{elapsed_millis, spawn_and_log, with_timeout},
};

use crate::adapter::{Capability, DeviceError, ProtocolAdapter, Result};
use crate::config::{DeviceConfig, MqttSettings, Protocol, ProtocolSettings, ReconnectConfig};
use crate::discovery::{BrowseNode, DiscoveredDevice, DiscoveryOptions, NodeKind};
use crate::protocol::{AdapterContext, AdapterFactory, OperationOptions, SubscribeOptions};
use crate::reconnect::{run_reconnect, ReconnectPolicy};
use crate::state::{DeviceStatus, StatusTracker};
use crate::subscription::{DataSubscription, Detached, SubscriptionId, SubscriptionRegistry};

/// Requests the client may queue before `subscribe`/`publish` wait
const REQUEST_CAPACITY: usize = 64;

/// Prefix of generated client identifiers
const CLIENT_ID_PREFIX: &str = "fieldmux-";

/// How long `disconnect` waits for the DISCONNECT packet to go out
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Convert a numeric QoS level to the client's enum
fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Whether `topic` is matched by the subscription `filter`
///
/// Implements the MQTT wildcard rules: `+` matches one level, a trailing `#`
/// matches the parent level and everything below it, and wildcards at the
/// first level never match topics starting with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Check a subscription filter
fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(DeviceError::InvalidAddress("empty topic filter".to_string()));
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let misplaced_hash = level.contains('#') && (*level != "#" || i != levels.len() - 1);
        let misplaced_plus = level.contains('+') && *level != "+";
        if misplaced_hash || misplaced_plus {
            return Err(DeviceError::InvalidAddress(format!(
                "{:?}: wildcards must fill a whole level and `#` must be last",
                filter
            )));
        }
    }
    Ok(())
}

/// Check a concrete topic for read and write
fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.contains(|c| c == '+' || c == '#') {
        return Err(DeviceError::InvalidAddress(format!(
            "{:?}: expected a topic without wildcards",
            topic
        )));
    }
    Ok(())
}

/// Decode a publish payload into a value and its quality
pub fn decode_payload(payload: &Bytes) -> (Value, Quality) {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(payload) {
        if let serde_json::Value::Object(map) = &json {
            if let Some(quality) = map.get("quality").and_then(|q| q.as_str()) {
                let quality = quality.parse().unwrap_or(Quality::Uncertain);
                let value = match map.get("value") {
                    Some(value) => Value::from(value.clone()),
                    None => Value::from(json.clone()),
                };
                return (value, quality);
            }
        }
        return (Value::from(json), Quality::Good);
    }
    match std::str::from_utf8(payload) {
        Ok(text) => (Value::String(text.to_string()), Quality::Good),
        Err(_) => (Value::Binary(payload.to_vec()), Quality::Good),
    }
}

/// Arrange topics into a hierarchy rooted below `root`
fn build_topic_tree<'a, I>(topics: I, root: Option<&str>) -> Vec<BrowseNode>
where
    I: IntoIterator<Item = &'a str>,
{
    let root = root.map(|r| r.trim_end_matches('/')).filter(|r| !r.is_empty());
    let mut nodes = Vec::new();
    for topic in topics {
        let rest = match root {
            Some(root) => match topic.strip_prefix(root).and_then(|t| t.strip_prefix('/')) {
                Some(rest) if !rest.is_empty() => rest,
                _ => continue,
            },
            None => topic,
        };
        let segments: Vec<&str> = rest.split('/').collect();
        insert_topic(&mut nodes, root, &segments);
    }
    sort_nodes(&mut nodes);
    nodes
}

fn insert_topic(nodes: &mut Vec<BrowseNode>, parent: Option<&str>, segments: &[&str]) {
    let Some((head, tail)) = segments.split_first() else {
        return;
    };
    let address = match parent {
        Some(parent) => format!("{}/{}", parent, head),
        None => head.to_string(),
    };
    let index = match nodes.iter().position(|n| n.name == *head) {
        Some(index) => index,
        None if tail.is_empty() => {
            nodes.push(BrowseNode::variable(address, *head));
            return;
        }
        None => {
            nodes.push(BrowseNode::folder(address.clone(), *head));
            nodes.len() - 1
        }
    };
    let node = &mut nodes[index];
    if tail.is_empty() {
        // a topic can carry a value and have subtopics at the same time
        node.kind = NodeKind::Variable;
    } else {
        insert_topic(&mut node.children, Some(&address), tail);
    }
}

fn sort_nodes(nodes: &mut [BrowseNode]) {
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    for node in nodes {
        sort_nodes(&mut node.children);
    }
}

#[derive(Debug, Clone)]
struct CachedSample {
    value: Value,
    received_at: DateTime<Utc>,
}

struct Shared {
    device_id: String,
    settings: MqttSettings,
    client_id: String,
    qos: QoS,
    timeout: Duration,
    policy: ReconnectPolicy,
    tracker: StatusTracker,
    subscriptions: Arc<SubscriptionRegistry>,
    cache: RwLock<HashMap<String, CachedSample>>,
    client: RwLock<Option<AsyncClient>>,
    /// Serializes broker subscribe/unsubscribe with the sink bookkeeping
    native: tokio::sync::Mutex<()>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
}

impl Shared {
    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.settings.broker, self.settings.port);
        options.set_keep_alive(Duration::from_secs(self.settings.keep_alive_secs.max(5)));
        options.set_clean_session(self.settings.clean_session);
        if let (Some(username), Some(password)) = (&self.settings.username, &self.settings.password) {
            options.set_credentials(username, password);
        }
        options
    }

    fn client(&self) -> Result<AsyncClient> {
        if !self.tracker.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        self.client
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(DeviceError::NotConnected)
    }

    fn take_client(&self) -> Option<AsyncClient> {
        self.client.write().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
    }

    fn cached(&self, topic: &str) -> Option<CachedSample> {
        self.cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(topic)
            .cloned()
    }

    fn cached_topics(&self) -> Vec<String> {
        self.cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn handle_publish(&self, topic: &str, payload: &Bytes) {
        let (value, quality) = decode_payload(payload);
        trace!(device_id = %self.device_id, topic = %topic, "Received {} bytes", payload.len());

        let event = DataEvent::new(self.device_id.clone(), topic, value.clone(), quality);
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                topic.to_string(),
                CachedSample {
                    value,
                    received_at: event.timestamp,
                },
            );
        self.subscriptions
            .publish_matching(event, |filter| topic_matches(filter, topic));
    }

    /// Add a sink, subscribing at the broker when it is the first one
    async fn attach(&self, filter: &str, buffer: usize) -> Result<DataSubscription> {
        let client = self.client()?;
        let _native = self.native.lock().await;
        let (subscription, first) = self.subscriptions.attach(filter, buffer);
        if first {
            if let Err(e) = client.subscribe(filter, self.qos).await {
                self.subscriptions.detach(filter, Some(subscription.id()));
                return Err(DeviceError::protocol(format!("subscribe {}: {}", filter, e)));
            }
            debug!(device_id = %self.device_id, "Subscribed to {}", filter);
        }
        Ok(subscription)
    }

    /// Remove sinks, unsubscribing at the broker when none are left
    async fn detach(&self, filter: &str, id: Option<SubscriptionId>) {
        let _native = self.native.lock().await;
        if self.subscriptions.detach(filter, id) != Detached::Last {
            return;
        }
        let client = self.client.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone();
        if let Some(client) = client {
            match client.unsubscribe(filter).await {
                Ok(()) => debug!(device_id = %self.device_id, "Unsubscribed from {}", filter),
                Err(e) => warn!(device_id = %self.device_id, "Failed to unsubscribe from {}: {}", filter, e),
            }
        }
    }

    /// Subscribe again to every active filter after a new session
    async fn resubscribe(&self) {
        let Some(client) = self.client.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone() else {
            return;
        };
        for filter in self.subscriptions.addresses() {
            if let Err(e) = client.subscribe(filter.as_str(), self.qos).await {
                warn!(device_id = %self.device_id, "Failed to resubscribe to {}: {}", filter, e);
            }
        }
    }

    fn abort_event_task(&self) {
        let task = self
            .event_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Poll until the broker acknowledges the connection
async fn wait_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(DeviceError::connection(format!("broker refused connection: {:?}", ack.code)))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(DeviceError::connection(e.to_string())),
        }
    }
}

/// Drive the client until it is told to stop or gives up reconnecting
async fn run_event_loop(shared: Weak<Shared>, eventloop: EventLoop) -> Result<()> {
    let eventloop = Arc::new(tokio::sync::Mutex::new(eventloop));
    loop {
        let polled = eventloop.lock().await.poll().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };

        match polled {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                shared.handle_publish(&publish.topic, &publish.payload);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(_) if shared.stopping.load(Ordering::SeqCst) => break,
            Err(e) => {
                warn!(device_id = %shared.device_id, "MQTT connection lost: {}", e);
                shared.tracker.transition(ConnectionState::Reconnecting, Some(e.to_string()));

                let result = run_reconnect(&shared.tracker, &shared.policy, |_| {
                    let eventloop = eventloop.clone();
                    let timeout = shared.timeout;
                    async move {
                        let mut eventloop = eventloop.lock().await;
                        with_timeout(timeout, "mqtt reconnect", wait_connack(&mut eventloop)).await
                    }
                })
                .await;

                match result {
                    Ok(()) => shared.resubscribe().await,
                    Err(e) => return Err(e),
                }
            }
        }
    }
    trace!("MQTT event loop stopped");
    Ok(())
}

/// MQTT implementation of [`ProtocolAdapter`]
pub struct MqttAdapter {
    shared: Arc<Shared>,
}

impl fmt::Debug for MqttAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttAdapter")
            .field("device_id", &self.shared.device_id)
            .field("broker", &self.shared.settings.broker)
            .field("client_id", &self.shared.client_id)
            .field("state", &self.shared.tracker.state())
            .finish()
    }
}

impl MqttAdapter {
    /// Create a disconnected adapter
    pub fn new(config: &DeviceConfig, context: AdapterContext) -> Result<Self> {
        let settings = match &config.settings {
            ProtocolSettings::Mqtt(settings) => settings.clone(),
            other => {
                return Err(DeviceError::Validation(format!(
                    "device {}: expected mqtt settings, got {}",
                    config.device_id,
                    other.protocol()
                )))
            }
        };
        let client_id = settings
            .client_id
            .clone()
            .unwrap_or_else(|| format!("{}{}", CLIENT_ID_PREFIX, Uuid::new_v4().simple()));
        let device_id = config.device_id.clone();

        let shared = Shared {
            tracker: StatusTracker::new(&device_id, Protocol::Mqtt, context.event_bus.clone()),
            subscriptions: Arc::new(SubscriptionRegistry::new(&device_id, context.event_bus)),
            qos: qos_from_level(settings.qos),
            timeout: config.timeout(),
            policy: ReconnectPolicy::from(&config.reconnect),
            cache: RwLock::new(HashMap::new()),
            client: RwLock::new(None),
            native: tokio::sync::Mutex::new(()),
            event_task: Mutex::new(None),
            stopping: AtomicBool::new(false),
            device_id,
            settings,
            client_id,
        };
        Ok(Self { shared: Arc::new(shared) })
    }

    /// Client identifier presented to the broker
    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// When the last message on `topic` arrived
    pub fn last_received(&self, topic: &str) -> Option<DateTime<Utc>> {
        self.shared.cached(topic).map(|sample| sample.received_at)
    }

    async fn read_topic(&self, address: &str, options: &OperationOptions) -> Result<Value> {
        validate_topic(address)?;
        self.shared.client()?;

        if let Some(sample) = self.shared.cached(address) {
            return Ok(sample.value);
        }

        // nothing seen yet: wait for the next (or retained) message
        let timeout = options.timeout_or(self.shared.timeout);
        let mut subscription = self.shared.attach(address, 1).await?;
        let result = match self.shared.cached(address) {
            Some(sample) => Ok(sample.value),
            None => match tokio::time::timeout(timeout, subscription.recv()).await {
                Ok(Some(event)) => Ok(event.value),
                Ok(None) => Err(DeviceError::NotConnected),
                Err(_) => Err(DeviceError::Timeout(format!(
                    "no message on {} within {:?}",
                    address, timeout
                ))),
            },
        };
        self.shared.detach(address, Some(subscription.id())).await;
        result
    }

    async fn publish_value(&self, address: &str, value: Value, options: &OperationOptions) -> Result<()> {
        validate_topic(address)?;
        let client = self.shared.client()?;
        let payload = value
            .to_payload()
            .map_err(|e| DeviceError::InvalidValue(address.to_string(), e.to_string()))?;
        let qos = options
            .get_integer("qos")
            .map(|level| qos_from_level(level.clamp(0, 2) as u8))
            .unwrap_or(self.shared.qos);
        let retain = options.get_bool("retain").unwrap_or(self.shared.settings.retain);
        let timeout = options.timeout_or(self.shared.timeout);

        let publish = async {
            client
                .publish(address, qos, retain, payload)
                .await
                .map_err(|e| DeviceError::protocol(format!("publish {}: {}", address, e)))
        };
        with_timeout(timeout, "mqtt publish", publish).await
    }
}

impl Drop for MqttAdapter {
    fn drop(&mut self) {
        self.shared.abort_event_task();
        self.shared.subscriptions.clear();
    }
}

#[async_trait]
impl ProtocolAdapter for MqttAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Browse, Capability::Discover]
    }

    async fn connect(&self) -> Result<()> {
        if self.shared.tracker.is_connected() {
            return Ok(());
        }
        self.shared.tracker.transition(ConnectionState::Connecting, None);
        self.shared.stopping.store(false, Ordering::SeqCst);

        let settings = &self.shared.settings;
        debug!("Connecting to MQTT broker at {}:{}", settings.broker, settings.port);
        let (client, mut eventloop) = AsyncClient::new(self.shared.mqtt_options(), REQUEST_CAPACITY);

        if let Err(e) = with_timeout(self.shared.timeout, "mqtt connect", wait_connack(&mut eventloop)).await {
            self.shared.tracker.transition(ConnectionState::Error, Some(e.to_string()));
            return Err(e);
        }

        *self.shared.client.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(client);
        let span = device_span(&self.shared.device_id, Protocol::Mqtt.as_str());
        let task = spawn_and_log(
            "mqtt event loop",
            run_event_loop(Arc::downgrade(&self.shared), eventloop).instrument(span),
        );
        if let Some(previous) = self
            .shared
            .event_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(task)
        {
            previous.abort();
        }

        self.shared.tracker.transition(ConnectionState::Connected, None);
        info!(
            device_id = %self.shared.device_id,
            "Connected to MQTT broker at {}:{} as {}",
            settings.broker, settings.port, self.shared.client_id
        );
        Ok(())
    }

    async fn disconnect(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.subscriptions.clear();

        if let Some(client) = self.shared.take_client() {
            match tokio::time::timeout(self.shared.timeout, client.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(device_id = %self.shared.device_id, "Failed to send MQTT disconnect: {}", e);
                }
                Err(_) => {
                    warn!(
                        device_id = %self.shared.device_id,
                        "MQTT disconnect not accepted within {:?}, dropping the session",
                        self.shared.timeout
                    );
                }
            }
        }

        let task = self
            .shared
            .event_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut task) = task {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }

        self.shared.tracker.transition(ConnectionState::Disconnected, None);
    }

    fn is_connected(&self) -> bool {
        self.shared.tracker.is_connected()
    }

    async fn read(&self, address: &str, options: &OperationOptions) -> Result<Value> {
        let start = Instant::now();
        let result = self.read_topic(address, options).await;
        self.shared.tracker.read_outcome(elapsed_millis(start), &result);
        result
    }

    async fn write(&self, address: &str, value: Value, options: &OperationOptions) -> Result<()> {
        let start = Instant::now();
        let result = self.publish_value(address, value, options).await;
        self.shared.tracker.write_outcome(elapsed_millis(start), &result);
        result
    }

    async fn subscribe(&self, address: &str, options: SubscribeOptions) -> Result<DataSubscription> {
        validate_filter(address)?;
        self.shared.attach(address, options.buffer).await
    }

    async fn unsubscribe(&self, address: &str, id: Option<SubscriptionId>) {
        self.shared.detach(address, id).await;
    }

    fn status(&self) -> DeviceStatus {
        self.shared.tracker.snapshot(self.shared.subscriptions.len())
    }

    async fn browse(&self, path: Option<&str>) -> Result<Vec<BrowseNode>> {
        self.shared.client()?;
        let topics = self.shared.cached_topics();
        Ok(build_topic_tree(topics.iter().map(String::as_str), path))
    }

    async fn discover(&self, options: &DiscoveryOptions) -> Result<Vec<DiscoveredDevice>> {
        if !self.is_connected() {
            self.connect().await?;
        }
        let filter = options
            .protocol_options
            .get("topic")
            .and_then(Value::as_str)
            .unwrap_or("#")
            .to_string();
        validate_filter(&filter)?;

        let mut subscription = self.shared.attach(&filter, 1024).await?;
        let deadline = Instant::now() + options.timeout;
        let mut seen: HashMap<String, Vec<String>> = HashMap::new();
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, subscription.recv()).await {
            let root = event.address.split('/').next().unwrap_or_default().to_string();
            let topics = seen.entry(root).or_default();
            if !topics.contains(&event.address) {
                topics.push(event.address);
            }
        }
        self.shared.detach(&filter, Some(subscription.id())).await;

        let broker = format!("{}:{}", self.shared.settings.broker, self.shared.settings.port);
        let mut devices: Vec<DiscoveredDevice> = seen
            .into_iter()
            .filter(|(root, _)| !root.is_empty())
            .map(|(root, mut topics)| {
                topics.sort();
                let mut properties = HashMap::new();
                properties.insert("broker".to_string(), Value::from(broker.as_str()));
                properties.insert(
                    "topics".to_string(),
                    Value::Array(topics.into_iter().map(Value::from).collect()),
                );
                DiscoveredDevice {
                    protocol: Protocol::Mqtt,
                    address: format!("{}/#", root),
                    name: Some(root.clone()),
                    device_id: root,
                    properties,
                }
            })
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        info!("Discovered {} MQTT devices on {}", devices.len(), broker);
        Ok(devices)
    }
}

/// Builds [`MqttAdapter`]s
#[derive(Debug, Default)]
pub struct MqttAdapterFactory;

impl MqttAdapterFactory {
    fn discovery_config(options: &DiscoveryOptions) -> DeviceConfig {
        let option = |key: &str| options.protocol_options.get(key);
        let settings = MqttSettings {
            broker: option("broker")
                .and_then(Value::as_str)
                .unwrap_or("localhost")
                .to_string(),
            port: option("port")
                .and_then(Value::as_integer)
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(1883),
            client_id: None,
            username: option("username").and_then(Value::as_str).map(str::to_string),
            password: option("password").and_then(Value::as_str).map(str::to_string),
            keep_alive_secs: 30,
            qos: 0,
            clean_session: true,
            retain: false,
        };
        let device_id = format!("mqtt-discovery-{}", Uuid::new_v4().simple());
        DeviceConfig::new(device_id, ProtocolSettings::Mqtt(settings))
            .with_timeout(options.timeout)
            .with_reconnect(ReconnectConfig {
                enabled: false,
                ..ReconnectConfig::default()
            })
    }
}

#[async_trait]
impl AdapterFactory for MqttAdapterFactory {
    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    async fn create(
        &self,
        config: &DeviceConfig,
        context: AdapterContext,
    ) -> Result<Arc<dyn ProtocolAdapter>> {
        Ok(Arc::new(MqttAdapter::new(config, context)?))
    }

    async fn discovery_adapter(
        &self,
        options: &DiscoveryOptions,
        _context: AdapterContext,
    ) -> Result<Arc<dyn ProtocolAdapter>> {
        let config = Self::discovery_config(options);
        config.validate()?;
        // discovery traffic stays off the host's bus
        let context = AdapterContext::new(SharedEventBus::new());
        Ok(Arc::new(MqttAdapter::new(&config, context)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldmux_core::event::DataScope;

    fn adapter() -> (MqttAdapter, SharedEventBus) {
        let bus = SharedEventBus::new();
        let config = DeviceConfig::new(
            "broker-1",
            ProtocolSettings::Mqtt(MqttSettings {
                broker: "localhost".to_string(),
                port: 1883,
                client_id: None,
                username: None,
                password: None,
                keep_alive_secs: 30,
                qos: 1,
                clean_session: true,
                retain: false,
            }),
        );
        (MqttAdapter::new(&config, AdapterContext::new(bus.clone())).unwrap(), bus)
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("plant/a/temp", "plant/a/temp"));
        assert!(topic_matches("plant/+/temp", "plant/a/temp"));
        assert!(!topic_matches("plant/+/temp", "plant/a/b/temp"));
        assert!(topic_matches("plant/#", "plant/a/b/temp"));
        assert!(topic_matches("plant/#", "plant"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("plant/+", "plant"));
        assert!(!topic_matches("plant/a", "plant/a/temp"));
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(!topic_matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }

    #[test]
    fn test_filter_validation() {
        for good in ["a/b", "a/+/c", "a/#", "#", "+"] {
            assert!(validate_filter(good).is_ok(), "{}", good);
        }
        for bad in ["", "a/#/c", "a/b#", "a+/b", "##"] {
            assert!(validate_filter(bad).is_err(), "{}", bad);
        }
        assert!(validate_topic("a/+").is_err());
        assert!(validate_topic("a/b").is_ok());
    }

    #[test]
    fn test_payload_decoding() {
        let (value, quality) = decode_payload(&Bytes::from_static(b"21.5"));
        assert_eq!(value, Value::Float(21.5));
        assert_eq!(quality, Quality::Good);

        let (value, quality) = decode_payload(&Bytes::from_static(br#"{"value": 7, "quality": "bad"}"#));
        assert_eq!(value, Value::Integer(7));
        assert_eq!(quality, Quality::Bad);

        let (value, quality) = decode_payload(&Bytes::from_static(br#"{"temp": 3}"#));
        assert_eq!(value.as_object().map(|o| o.len()), Some(1));
        assert_eq!(quality, Quality::Good);

        let (value, quality) = decode_payload(&Bytes::from_static(br#"{"quality": "sketchy"}"#));
        assert!(value.as_object().is_some());
        assert_eq!(quality, Quality::Uncertain);

        let (value, _) = decode_payload(&Bytes::from_static(b"ON"));
        assert_eq!(value, Value::from("ON"));

        let (value, _) = decode_payload(&Bytes::from_static(&[0xff, 0x00, 0xfe]));
        assert_eq!(value, Value::Binary(vec![0xff, 0x00, 0xfe]));
    }

    #[test]
    fn test_topic_tree() {
        let topics = ["plant/a/temp", "plant/a/pressure", "plant/b", "plant/b/alarm", "site"];
        let tree = build_topic_tree(topics, None);

        assert_eq!(tree.len(), 2);
        let plant = &tree[0];
        assert_eq!(plant.name, "plant");
        assert_eq!(plant.kind, NodeKind::Folder);
        assert_eq!(plant.children[0].address, "plant/a");
        assert_eq!(plant.children[0].children[0].address, "plant/a/pressure");
        let b = &plant.children[1];
        assert_eq!(b.kind, NodeKind::Variable);
        assert_eq!(b.children[0].address, "plant/b/alarm");
        assert_eq!(tree[1].kind, NodeKind::Variable);

        let below = build_topic_tree(topics, Some("plant/a"));
        let names: Vec<&str> = below.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["pressure", "temp"]);
        assert_eq!(below[1].address, "plant/a/temp");
    }

    #[tokio::test]
    async fn test_incoming_publish_fans_out_to_matching_filters() {
        let (adapter, bus) = adapter();
        let mut events = bus.subscribe_data(DataScope::exact("broker-1", "plant/a/temp")).unwrap();
        let (mut wildcard, _) = adapter.shared.subscriptions.attach("plant/+/temp", 8);
        let (mut other, _) = adapter.shared.subscriptions.attach("plant/b/#", 8);

        adapter
            .shared
            .handle_publish("plant/a/temp", &Bytes::from_static(br#"{"value": 20.5, "quality": "good"}"#));

        let event = wildcard.try_recv().unwrap();
        assert_eq!(event.address, "plant/a/temp");
        assert_eq!(event.value, Value::Float(20.5));
        assert!(other.try_recv().is_none());
        assert_eq!(events.try_recv().unwrap().value, Value::Float(20.5));

        assert_eq!(adapter.shared.cached("plant/a/temp").map(|s| s.value), Some(Value::Float(20.5)));
        assert!(adapter.last_received("plant/a/temp").is_some());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let (adapter, _bus) = adapter();
        let options = OperationOptions::default();

        assert!(adapter.client_id().starts_with(CLIENT_ID_PREFIX));
        assert!(matches!(adapter.read("a/b", &options).await, Err(DeviceError::NotConnected)));
        assert!(matches!(
            adapter.write("a/b", Value::from(1), &options).await,
            Err(DeviceError::NotConnected)
        ));
        assert!(matches!(
            adapter.subscribe("a/#", SubscribeOptions::default()).await,
            Err(DeviceError::NotConnected)
        ));
        assert!(matches!(adapter.browse(None).await, Err(DeviceError::NotConnected)));
        assert!(matches!(adapter.read("a/+", &options).await, Err(DeviceError::InvalidAddress(_))));
        // unsubscribing something never subscribed is harmless
        adapter.unsubscribe("a/#", None).await;
        assert!(adapter.supports(Capability::Browse));
        assert!(!adapter.supports(Capability::ReadMany));
    }

    #[tokio::test]
    async fn test_failed_attempts_are_counted() {
        let (adapter, _bus) = adapter();
        let options = OperationOptions::default();

        let _ = adapter.read("a/b", &options).await;
        let _ = adapter.read("a/#", &options).await;
        let _ = adapter.write("a/b", Value::from(1), &options).await;
        let _ = adapter.write("", Value::from(1), &options).await;

        let status = adapter.status();
        assert_eq!(status.metrics.read_count, 2);
        assert_eq!(status.metrics.write_count, 2);
        assert_eq!(status.metrics.error_count, 4);
        assert!(status.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_with_stuck_event_loop() {
        let (adapter, _bus) = adapter();
        // nobody polls this event loop and its request queue is already full
        let (client, _eventloop) = AsyncClient::new(adapter.shared.mqtt_options(), 1);
        client.try_publish("a/b", QoS::AtMostOnce, false, "x").unwrap();
        *adapter.shared.client.write().unwrap() = Some(client);

        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(60), adapter.disconnect())
            .await
            .unwrap();
        assert!(started.elapsed() <= adapter.shared.timeout + Duration::from_millis(10));
        assert!(adapter.shared.client().is_err());
        assert_eq!(adapter.status().state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_discovery_config_from_options() {
        let options = DiscoveryOptions::default()
            .with_timeout(Duration::from_secs(3))
            .with_option("broker", "10.0.0.5")
            .with_option("port", 8883);
        let config = MqttAdapterFactory::discovery_config(&options);

        assert!(config.validate().is_ok());
        assert!(!config.reconnect.enabled);
        assert_eq!(config.timeout(), Duration::from_secs(3));
        match config.settings {
            ProtocolSettings::Mqtt(settings) => {
                assert_eq!(settings.broker, "10.0.0.5");
                assert_eq!(settings.port, 8883);
            }
            other => panic!("unexpected settings {:?}", other),
        }
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
    }
}
