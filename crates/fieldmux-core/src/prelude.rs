/*!
 * Prelude module for fieldmux core.
 *
 * Re-exports the types most callers need in one import.
 */

pub use crate::error::{Error, Result};

pub use crate::types::{ConnectionState, Quality, Value};

pub use crate::event::{
    DataEvent, DataScope, DeviceScope, ErrorEvent, Event, EventBus, EventBusStats, ListenerHandle,
    SharedEventBus, StatusEvent,
};

pub use crate::pool::{ConnectionPool, PoolConfig, PoolStats, Pooled, ResourceManager};

pub use crate::config::{Config, ConfigBuilder, SharedConfig};

pub use crate::utils::{elapsed_millis, spawn_and_log, with_timeout};

pub use tracing::{debug, error, info, trace, warn};

pub use crate::init;
