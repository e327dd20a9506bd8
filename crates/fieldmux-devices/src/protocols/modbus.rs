/*!
 * Modbus TCP adapter.
 *
 * Each device gets its own [`ConnectionPool`] of client contexts so that
 * concurrent reads do not queue behind one socket. Subscriptions are polled.
 *
 * Addresses take the form `<table>:<offset>[x<count>]`, for example
 * `holding:0`, `hr:10x4` or `coil:3`, or a classic 5/6-digit reference such
 * as `40001` (holding register 0) or `100017x2`.
 */
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::net::lookup_host;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::{Reader, Slave, Writer};
use tracing::{debug, info, warn, Instrument};

use fieldmux_core::{
    error::Error as CoreError,
    logging::device_span,
    pool::{ConnectionPool, ResourceManager},
    types::{ConnectionState, Value},
    utils::{elapsed_millis, spawn_and_log, with_timeout},
};

use crate::adapter::{Capability, DeviceError, ProtocolAdapter, Result};
use crate::config::{DeviceConfig, ModbusSettings, Protocol, ProtocolSettings};
use crate::protocol::{AdapterContext, AdapterFactory, OperationOptions, SubscribeOptions};
use crate::reconnect::{run_reconnect, ReconnectPolicy};
use crate::state::{DeviceStatus, StatusTracker};
use crate::subscription::{DataSubscription, ReadFn, SubscriptionId, SubscriptionRegistry};

/// Largest quantity a single read request may ask for
const MAX_READ_BITS: u16 = 2000;
const MAX_READ_REGISTERS: u16 = 125;

/// Modbus data table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Read/write single bits
    Coil,
    /// Read-only single bits
    DiscreteInput,
    /// Read-only 16-bit registers
    InputRegister,
    /// Read/write 16-bit registers
    HoldingRegister,
}

impl Table {
    /// Canonical name used in addresses
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Coil => "coil",
            Table::DiscreteInput => "discrete",
            Table::InputRegister => "input",
            Table::HoldingRegister => "holding",
        }
    }

    /// Whether the table can be written
    pub fn is_writable(&self) -> bool {
        matches!(self, Table::Coil | Table::HoldingRegister)
    }

    fn is_bit(&self) -> bool {
        matches!(self, Table::Coil | Table::DiscreteInput)
    }

    fn max_count(&self) -> u16 {
        if self.is_bit() {
            MAX_READ_BITS
        } else {
            MAX_READ_REGISTERS
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "coil" | "coils" | "co" => Some(Table::Coil),
            "discrete" | "di" => Some(Table::DiscreteInput),
            "input" | "ir" => Some(Table::InputRegister),
            "holding" | "hr" => Some(Table::HoldingRegister),
            _ => None,
        }
    }

    fn from_reference_digit(digit: char) -> Option<Self> {
        match digit {
            '0' => Some(Table::Coil),
            '1' => Some(Table::DiscreteInput),
            '3' => Some(Table::InputRegister),
            '4' => Some(Table::HoldingRegister),
            _ => None,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed Modbus point address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusAddress {
    /// Data table
    pub table: Table,
    /// Zero-based offset in the table
    pub offset: u16,
    /// Number of consecutive items
    pub count: u16,
}

impl ModbusAddress {
    /// Override the item count
    pub fn with_count(mut self, count: u16) -> Result<Self> {
        self.count = count;
        self.check_range()?;
        Ok(self)
    }

    fn check_range(&self) -> Result<()> {
        if self.count == 0 || self.count > self.table.max_count() {
            return Err(DeviceError::InvalidAddress(format!(
                "{}: count must be 1..={}, got {}",
                self, self.table.max_count(), self.count
            )));
        }
        if u32::from(self.offset) + u32::from(self.count) > 0x1_0000 {
            return Err(DeviceError::InvalidAddress(format!(
                "{}: range runs past the end of the table",
                self
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ModbusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.offset)?;
        if self.count != 1 {
            write!(f, "x{}", self.count)?;
        }
        Ok(())
    }
}

impl FromStr for ModbusAddress {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: &str| DeviceError::InvalidAddress(format!("{:?}: {}", s, why));
        let trimmed = s.trim();

        let (point, count) = match trimmed.split_once(|c| c == 'x' || c == 'X') {
            Some((point, count)) => {
                let count = count.parse::<u16>().map_err(|_| invalid("bad count"))?;
                (point, count)
            }
            None => (trimmed, 1),
        };

        let (table, offset) = match point.split_once(':') {
            Some((table, offset)) => {
                let table = Table::from_name(table).ok_or_else(|| invalid("unknown table"))?;
                let offset = offset.parse::<u16>().map_err(|_| invalid("bad offset"))?;
                (table, offset)
            }
            None => parse_reference(point)
                .ok_or_else(|| invalid("not a table:offset or 5/6-digit reference"))?,
        };

        let address = ModbusAddress { table, offset, count };
        address.check_range()?;
        Ok(address)
    }
}

/// `40001` → holding 0, `300010` → input 9
fn parse_reference(reference: &str) -> Option<(Table, u16)> {
    if !(5..=6).contains(&reference.len()) || !reference.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let mut chars = reference.chars();
    let table = Table::from_reference_digit(chars.next()?)?;
    let number: u32 = chars.as_str().parse().ok()?;
    if number == 0 || number > 0x1_0000 {
        return None;
    }
    Some((table, (number - 1) as u16))
}

/// Opens client contexts for the pool
pub struct ModbusConnector {
    host: String,
    port: u16,
    unit_id: u8,
    connect_timeout: Duration,
}

impl ModbusConnector {
    fn new(settings: &ModbusSettings, connect_timeout: Duration) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            unit_id: settings.unit_id,
            connect_timeout,
        }
    }

    async fn resolve(&self) -> std::result::Result<SocketAddr, CoreError> {
        lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| CoreError::resource_creation(format!("{} did not resolve", self.host)))
    }
}

#[async_trait]
impl ResourceManager for ModbusConnector {
    type Resource = Context;

    async fn create(&self) -> std::result::Result<Context, CoreError> {
        let addr = self.resolve().await?;
        debug!("Opening Modbus TCP connection to {}", addr);
        let connect = async {
            tcp::connect_slave(addr, Slave(self.unit_id))
                .await
                .map_err(|e| CoreError::resource_creation(format!("{}: {}", addr, e)))
        };
        with_timeout(self.connect_timeout, "modbus connect", connect).await
    }

    async fn validate(&self, _resource: &mut Context) -> bool {
        // broken contexts are invalidated when a request fails on them
        true
    }

    async fn destroy(&self, resource: Context) {
        drop(resource);
    }
}

type ModbusPool = ConnectionPool<ModbusConnector>;

/// One request against a context
#[derive(Debug, Clone)]
enum Operation {
    Read(ModbusAddress),
    WriteCoils(u16, Vec<bool>),
    WriteRegisters(u16, Vec<u16>),
}

impl Operation {
    async fn perform(&self, ctx: &mut Context) -> io::Result<Value> {
        match self {
            Operation::Read(address) => {
                let (offset, count) = (address.offset, address.count);
                let value = match address.table {
                    Table::Coil => bits_to_value(ctx.read_coils(offset, count).await?),
                    Table::DiscreteInput => bits_to_value(ctx.read_discrete_inputs(offset, count).await?),
                    Table::InputRegister => words_to_value(ctx.read_input_registers(offset, count).await?),
                    Table::HoldingRegister => {
                        words_to_value(ctx.read_holding_registers(offset, count).await?)
                    }
                };
                Ok(value)
            }
            Operation::WriteCoils(offset, bits) => {
                match bits.as_slice() {
                    [bit] => ctx.write_single_coil(*offset, *bit).await?,
                    _ => ctx.write_multiple_coils(*offset, bits).await?,
                }
                Ok(Value::Null)
            }
            Operation::WriteRegisters(offset, words) => {
                match words.as_slice() {
                    [word] => ctx.write_single_register(*offset, *word).await?,
                    _ => ctx.write_multiple_registers(*offset, words).await?,
                }
                Ok(Value::Null)
            }
        }
    }
}

fn bits_to_value(bits: Vec<bool>) -> Value {
    match bits.as_slice() {
        [bit] => Value::Bool(*bit),
        _ => Value::Array(bits.into_iter().map(Value::Bool).collect()),
    }
}

fn words_to_value(words: Vec<u16>) -> Value {
    match words.as_slice() {
        [word] => Value::Integer(i64::from(*word)),
        _ => Value::Array(words.into_iter().map(|w| Value::Integer(i64::from(w))).collect()),
    }
}

fn encode_word(address: &ModbusAddress, value: &Value) -> Result<u16> {
    match value.as_integer() {
        // negative values are written as their 16-bit two's complement
        Some(i) if (i64::from(i16::MIN)..0).contains(&i) => Ok(i as i16 as u16),
        Some(i) if (0..=i64::from(u16::MAX)).contains(&i) => Ok(i as u16),
        _ => Err(DeviceError::InvalidValue(
            address.to_string(),
            format!("expected a 16-bit integer, got {:?}", value),
        )),
    }
}

fn encode_bit(address: &ModbusAddress, value: &Value) -> Result<bool> {
    value.as_bool().ok_or_else(|| {
        DeviceError::InvalidValue(address.to_string(), format!("expected a boolean, got {:?}", value))
    })
}

/// Turn a value into the write for `address`
fn write_operation(address: &ModbusAddress, value: &Value) -> Result<Operation> {
    if !address.table.is_writable() {
        return Err(DeviceError::InvalidAddress(format!("{} is read-only", address)));
    }
    let items: Vec<&Value> = match value.as_array() {
        Some(items) => items.iter().collect(),
        None => vec![value],
    };
    if items.is_empty() || (address.count != 1 && items.len() != address.count as usize) {
        return Err(DeviceError::InvalidValue(
            address.to_string(),
            format!("expected {} items, got {}", address.count, items.len()),
        ));
    }
    if u32::from(address.offset) + items.len() as u32 > 0x1_0000 {
        return Err(DeviceError::InvalidAddress(format!("{}: write runs past the table", address)));
    }

    if address.table.is_bit() {
        let bits = items.iter().map(|v| encode_bit(address, v)).collect::<Result<Vec<_>>>()?;
        Ok(Operation::WriteCoils(address.offset, bits))
    } else {
        let words = items.iter().map(|v| encode_word(address, v)).collect::<Result<Vec<_>>>()?;
        Ok(Operation::WriteRegisters(address.offset, words))
    }
}

/// Exception responses surface as `Other` wrapping the decoded response;
/// anything else means the connection itself is unusable
fn is_exception(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::Other && error.get_ref().is_some()
}

struct Shared {
    device_id: String,
    settings: ModbusSettings,
    timeout: Duration,
    policy: ReconnectPolicy,
    tracker: StatusTracker,
    subscriptions: Arc<SubscriptionRegistry>,
    pool: RwLock<Option<Arc<ModbusPool>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn current_pool(&self) -> Result<Arc<ModbusPool>> {
        if !self.tracker.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        self.pool
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(DeviceError::NotConnected)
    }

    fn replace_pool(&self, pool: Option<Arc<ModbusPool>>) -> Option<Arc<ModbusPool>> {
        let mut slot = self.pool.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *slot, pool)
    }

    /// Build a pool and prove the device answers on at least one connection
    async fn open_pool(&self) -> Result<Arc<ModbusPool>> {
        let connector = ModbusConnector::new(&self.settings, self.timeout);
        let pool = ConnectionPool::new(connector, self.settings.pool.clone())?;
        let opened = async {
            pool.warm_up().await?;
            drop(pool.acquire().await?);
            Ok::<_, CoreError>(())
        };
        match opened.await {
            Ok(()) => Ok(Arc::new(pool)),
            Err(e) => {
                pool.shutdown().await;
                Err(match e {
                    CoreError::Timeout(msg) => DeviceError::Timeout(msg),
                    other => DeviceError::connection(other.to_string()),
                })
            }
        }
    }

    async fn install_pool(&self, pool: Arc<ModbusPool>) {
        if let Some(old) = self.replace_pool(Some(pool)) {
            old.shutdown().await;
        }
    }

    async fn execute(self: &Arc<Self>, operation: &Operation, timeout: Duration) -> Result<Value> {
        let pool = self.current_pool()?;
        let deadline = Instant::now() + timeout;

        let mut conn = match tokio::time::timeout_at(deadline, pool.acquire()).await {
            Ok(conn) => conn?,
            Err(_) => return Err(DeviceError::Timeout(format!("no connection within {:?}", timeout))),
        };

        let outcome = tokio::time::timeout_at(deadline, operation.perform(&mut conn)).await;
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if is_exception(&e) => Err(DeviceError::protocol(e.to_string())),
            Ok(Err(e)) => {
                conn.invalidate();
                self.connection_lost(e.to_string());
                Err(DeviceError::connection(e.to_string()))
            }
            Err(_) => {
                // a late response would confuse the next request on this context
                conn.invalidate();
                Err(DeviceError::Timeout(format!("request timed out after {:?}", timeout)))
            }
        }
    }

    async fn read_point(self: &Arc<Self>, address: ModbusAddress, timeout: Duration) -> Result<Value> {
        let start = Instant::now();
        let result = self.execute(&Operation::Read(address), timeout).await;
        self.tracker.read_outcome(elapsed_millis(start), &result);
        result
    }

    async fn write_point(self: &Arc<Self>, operation: Operation, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let result = self.execute(&operation, timeout).await.map(|_| ());
        self.tracker.write_outcome(elapsed_millis(start), &result);
        result
    }

    /// Start the reconnect loop unless one is already running
    fn connection_lost(self: &Arc<Self>, reason: String) {
        if !self.tracker.transition(ConnectionState::Reconnecting, Some(reason.clone())) {
            return;
        }
        warn!(device_id = %self.device_id, "Modbus connection lost: {}", reason);

        let weak: Weak<Self> = Arc::downgrade(self);
        let span = device_span(&self.device_id, Protocol::Modbus.as_str());
        let reconnect = async move {
            let Some(shared) = weak.upgrade() else {
                return Ok::<(), DeviceError>(());
            };
            let result = run_reconnect(&shared.tracker, &shared.policy, |_| {
                let shared = shared.clone();
                async move {
                    let pool = with_timeout(shared.timeout, "modbus reconnect", shared.open_pool()).await?;
                    shared.install_pool(pool).await;
                    Ok(())
                }
            })
            .await;
            if result.is_err() {
                if let Some(pool) = shared.replace_pool(None) {
                    pool.shutdown().await;
                }
            }
            result
        };
        let task = spawn_and_log("modbus reconnect", reconnect.instrument(span));

        let mut slot = self.reconnect_task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    fn abort_reconnect(&self) {
        let task = self
            .reconnect_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Modbus TCP implementation of [`ProtocolAdapter`]
pub struct ModbusAdapter {
    shared: Arc<Shared>,
}

impl fmt::Debug for ModbusAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusAdapter")
            .field("device_id", &self.shared.device_id)
            .field("host", &self.shared.settings.host)
            .field("port", &self.shared.settings.port)
            .field("state", &self.shared.tracker.state())
            .finish()
    }
}

impl ModbusAdapter {
    /// Create a disconnected adapter
    pub fn new(config: &DeviceConfig, context: AdapterContext) -> Result<Self> {
        let settings = match &config.settings {
            ProtocolSettings::Modbus(settings) => settings.clone(),
            other => {
                return Err(DeviceError::Validation(format!(
                    "device {}: expected modbus settings, got {}",
                    config.device_id,
                    other.protocol()
                )))
            }
        };
        let device_id = config.device_id.clone();
        let shared = Shared {
            tracker: StatusTracker::new(&device_id, Protocol::Modbus, context.event_bus.clone()),
            subscriptions: Arc::new(SubscriptionRegistry::new(&device_id, context.event_bus)),
            timeout: config.timeout(),
            policy: ReconnectPolicy::from(&config.reconnect),
            pool: RwLock::new(None),
            reconnect_task: Mutex::new(None),
            device_id,
            settings,
        };
        Ok(Self { shared: Arc::new(shared) })
    }

    fn parse(&self, address: &str, options: &OperationOptions) -> Result<ModbusAddress> {
        let parsed: ModbusAddress = address.parse()?;
        match options.get_integer("count") {
            Some(count) => {
                let count = u16::try_from(count)
                    .map_err(|_| DeviceError::InvalidAddress(format!("{}: bad count {}", address, count)))?;
                parsed.with_count(count)
            }
            None => Ok(parsed),
        }
    }
}

impl Drop for ModbusAdapter {
    fn drop(&mut self) {
        self.shared.abort_reconnect();
        self.shared.subscriptions.clear();
    }
}

#[async_trait]
impl ProtocolAdapter for ModbusAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Modbus
    }

    fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::ReadMany, Capability::WriteMany]
    }

    async fn connect(&self) -> Result<()> {
        if self.shared.tracker.is_connected() {
            return Ok(());
        }
        self.shared.tracker.transition(ConnectionState::Connecting, None);
        let settings = &self.shared.settings;
        debug!("Connecting to Modbus device at {}:{}", settings.host, settings.port);

        match with_timeout(self.shared.timeout, "modbus connect", self.shared.open_pool()).await {
            Ok(pool) => {
                self.shared.install_pool(pool).await;
                self.shared.tracker.transition(ConnectionState::Connected, None);
                info!(
                    device_id = %self.shared.device_id,
                    "Connected to Modbus device at {}:{} (unit {})",
                    settings.host, settings.port, settings.unit_id
                );
                Ok(())
            }
            Err(e) => {
                self.shared.tracker.transition(ConnectionState::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        self.shared.abort_reconnect();
        let released = self.shared.subscriptions.clear();
        if !released.is_empty() {
            debug!("Stopped {} pollers", released.len());
        }
        if let Some(pool) = self.shared.replace_pool(None) {
            pool.shutdown().await;
        }
        self.shared.tracker.transition(ConnectionState::Disconnected, None);
    }

    fn is_connected(&self) -> bool {
        self.shared.tracker.is_connected()
    }

    async fn read(&self, address: &str, options: &OperationOptions) -> Result<Value> {
        let start = Instant::now();
        let timeout = options.timeout_or(self.shared.timeout);
        let result = match self.parse(address, options) {
            Ok(parsed) => self.shared.execute(&Operation::Read(parsed), timeout).await,
            Err(e) => Err(e),
        };
        self.shared.tracker.read_outcome(elapsed_millis(start), &result);
        result
    }

    async fn write(&self, address: &str, value: Value, options: &OperationOptions) -> Result<()> {
        let start = Instant::now();
        let timeout = options.timeout_or(self.shared.timeout);
        let result = match self
            .parse(address, options)
            .and_then(|parsed| write_operation(&parsed, &value))
        {
            Ok(operation) => self.shared.execute(&operation, timeout).await.map(|_| ()),
            Err(e) => Err(e),
        };
        self.shared.tracker.write_outcome(elapsed_millis(start), &result);
        result
    }

    async fn subscribe(&self, address: &str, options: SubscribeOptions) -> Result<DataSubscription> {
        let parsed: ModbusAddress = address.parse()?;
        self.shared.current_pool()?;

        let weak = Arc::downgrade(&self.shared);
        let read: ReadFn = Arc::new(move |_address: String| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(shared) => {
                        let timeout = shared.timeout;
                        shared.read_point(parsed, timeout).await
                    }
                    None => Err(DeviceError::NotConnected),
                }
            }
            .boxed()
        });
        self.shared.subscriptions.attach_polled(address, &options, read)
    }

    async fn unsubscribe(&self, address: &str, id: Option<SubscriptionId>) {
        self.shared.subscriptions.detach(address, id);
    }

    fn status(&self) -> DeviceStatus {
        self.shared.tracker.snapshot(self.shared.subscriptions.len())
    }

    async fn read_many(
        &self,
        addresses: &[String],
        options: &OperationOptions,
    ) -> Result<HashMap<String, Value>> {
        let mut values = HashMap::with_capacity(addresses.len());
        for address in addresses {
            let value = self.read(address, options).await?;
            values.insert(address.clone(), value);
        }
        Ok(values)
    }

    async fn write_many(&self, values: HashMap<String, Value>, options: &OperationOptions) -> Result<()> {
        // validate everything before touching the device
        let validated = values
            .iter()
            .map(|(address, value)| self.parse(address, options).and_then(|parsed| write_operation(&parsed, value)))
            .collect::<Result<Vec<_>>>();
        let operations = match validated {
            Ok(operations) => operations,
            Err(e) => {
                let rejected: Result<()> = Err(e);
                self.shared.tracker.write_outcome(0.0, &rejected);
                return rejected;
            }
        };
        let timeout = options.timeout_or(self.shared.timeout);
        for operation in operations {
            self.shared.write_point(operation, timeout).await?;
        }
        Ok(())
    }
}

/// Builds [`ModbusAdapter`]s
#[derive(Debug, Default)]
pub struct ModbusAdapterFactory;

#[async_trait]
impl AdapterFactory for ModbusAdapterFactory {
    fn protocol(&self) -> Protocol {
        Protocol::Modbus
    }

    async fn create(
        &self,
        config: &DeviceConfig,
        context: AdapterContext,
    ) -> Result<Arc<dyn ProtocolAdapter>> {
        Ok(Arc::new(ModbusAdapter::new(config, context)?))
    }
}
