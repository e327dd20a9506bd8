/*!
 * Connection state machine and operation metrics.
 *
 * A [`StatusTracker`] holds an adapter's state, last error and metrics
 * behind a short-lived lock so [`StatusTracker::snapshot`] never waits on
 * I/O. Every effective state change is published as a status event.
 */
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use fieldmux_core::{
    event::{SharedEventBus, StatusEvent},
    types::ConnectionState,
};

use crate::config::Protocol;

/// Counters for one adapter instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    /// Read attempts, successful or not
    pub read_count: u64,
    /// Write attempts, successful or not
    pub write_count: u64,
    /// Failed operations of any kind
    pub error_count: u64,
    /// Latency of the most recent read or write
    pub last_latency_ms: Option<f64>,
    /// Running mean latency over all reads and writes
    pub avg_latency_ms: f64,
}

impl DeviceMetrics {
    fn record_latency(&mut self, latency_ms: f64) {
        let samples = (self.read_count + self.write_count).max(1) as f64;
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / samples;
        self.last_latency_ms = Some(latency_ms);
    }
}

/// Point-in-time view of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Device identifier
    pub device_id: String,
    /// Device protocol
    pub protocol: Protocol,
    /// Current connection state
    pub state: ConnectionState,
    /// Most recent error message
    pub last_error: Option<String>,
    /// Operation counters
    pub metrics: DeviceMetrics,
    /// When the current connection was established
    pub connected_since: Option<DateTime<Utc>>,
    /// Addresses with at least one active subscription
    pub subscriptions: usize,
}

impl DeviceStatus {
    /// Status of a device that has no adapter
    pub fn disconnected(device_id: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            device_id: device_id.into(),
            protocol,
            state: ConnectionState::Disconnected,
            last_error: None,
            metrics: DeviceMetrics::default(),
            connected_since: None,
            subscriptions: 0,
        }
    }

    /// Whether the device is connected
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    state: ConnectionState,
    last_error: Option<String>,
    metrics: DeviceMetrics,
    connected_since: Option<DateTime<Utc>>,
}

/// State machine and metrics for one adapter
#[derive(Debug)]
pub struct StatusTracker {
    device_id: String,
    protocol: Protocol,
    event_bus: SharedEventBus,
    inner: Mutex<TrackerState>,
}

impl StatusTracker {
    /// Create a tracker in state `disconnected`
    pub fn new(device_id: impl Into<String>, protocol: Protocol, event_bus: SharedEventBus) -> Self {
        Self {
            device_id: device_id.into(),
            protocol,
            event_bus,
            inner: Mutex::new(TrackerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Device the tracker belongs to
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Bus that receives the status events
    pub fn event_bus(&self) -> &SharedEventBus {
        &self.event_bus
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Whether the state is `connected`
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Move to `next`
    ///
    /// Returns `false` without emitting anything when `next` equals the
    /// current state or the move is not allowed. Moving to `error` records
    /// `message` as the last error.
    pub fn transition(&self, next: ConnectionState, message: Option<String>) -> bool {
        let mut inner = self.lock();
        let previous = inner.state;
        if previous == next {
            return false;
        }
        if !previous.can_transition_to(next) {
            warn!(
                device_id = %self.device_id,
                "Ignoring state change {} -> {}", previous, next
            );
            return false;
        }
        inner.state = next;
        match next {
            ConnectionState::Connected => inner.connected_since = Some(Utc::now()),
            ConnectionState::Connecting => {}
            _ => inner.connected_since = None,
        }
        if next == ConnectionState::Error {
            if let Some(msg) = &message {
                inner.last_error = Some(msg.clone());
            }
        }

        // emitted under the lock so subscribers see changes in order
        self.event_bus.emit_status(StatusEvent {
            device_id: self.device_id.clone(),
            previous,
            state: next,
            message,
            timestamp: Utc::now(),
        });
        true
    }

    /// Count a read attempt
    pub fn record_read(&self, latency_ms: f64, ok: bool) {
        let mut inner = self.lock();
        inner.metrics.read_count += 1;
        inner.metrics.record_latency(latency_ms);
        if !ok {
            inner.metrics.error_count += 1;
        }
    }

    /// Count a write attempt
    pub fn record_write(&self, latency_ms: f64, ok: bool) {
        let mut inner = self.lock();
        inner.metrics.write_count += 1;
        inner.metrics.record_latency(latency_ms);
        if !ok {
            inner.metrics.error_count += 1;
        }
    }

    /// Count a finished read attempt and keep its error message
    pub fn read_outcome<T, E: fmt::Display>(&self, latency_ms: f64, result: &std::result::Result<T, E>) {
        self.record_read(latency_ms, result.is_ok());
        if let Err(e) = result {
            self.record_error(e.to_string());
        }
    }

    /// Count a finished write attempt and keep its error message
    pub fn write_outcome<T, E: fmt::Display>(&self, latency_ms: f64, result: &std::result::Result<T, E>) {
        self.record_write(latency_ms, result.is_ok());
        if let Err(e) = result {
            self.record_error(e.to_string());
        }
    }

    /// Remember an error message without changing state
    pub fn record_error(&self, message: impl Into<String>) {
        self.lock().last_error = Some(message.into());
    }

    /// Snapshot for [`ProtocolAdapter::status`](crate::adapter::ProtocolAdapter::status)
    pub fn snapshot(&self, subscriptions: usize) -> DeviceStatus {
        let inner = self.lock();
        DeviceStatus {
            device_id: self.device_id.clone(),
            protocol: self.protocol,
            state: inner.state,
            last_error: inner.last_error.clone(),
            metrics: inner.metrics.clone(),
            connected_since: inner.connected_since,
            subscriptions,
        }
    }
}
