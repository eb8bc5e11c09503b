//! # Modbus Device Polling
//!
//! One polling loop per device. Each loop owns its connection exclusively;
//! register writes are sent to the loop as commands instead of opening a
//! second connection.
//!
//! ## Poll Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  interval tick                                                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  link open? ──no──► connect (up to device.retries attempts)            │
//! │       │                  │ all failed                                   │
//! │       │                  └──► status 'error', connection_errors++      │
//! │       ▼                       zero readings, retry next tick            │
//! │  for register in register map (in map order):                           │
//! │       read_holding(address, count)   ── timeout = device.timeout       │
//! │       decode + scale                 ── failure: warn, skip register   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  fold into one Reading ──► db.readings().insert()  (row + outbox)      │
//! │  status 'online'                                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Shutdown
//! `remove_device` and `stop` signal the loop and await it. A tick that is
//! already running finishes first, so no outbox transaction is cut short.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_modbus::client::{rtu, tcp, Client, Context, Reader, Writer};
use tokio_modbus::Slave;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, info, warn};

use fieldgate_core::{
    ConnectionConfig, DeviceConfig, DeviceState, DeviceStatus, Parity, Reading, RegisterReading,
};
use fieldgate_db::Database;

use crate::error::{IngestError, IngestResult};

// =============================================================================
// Register I/O Seam
// =============================================================================

/// An open link to one device.
#[async_trait]
pub trait RegisterIo: Send {
    /// Reads `count` holding registers starting at `address`.
    async fn read_holding(&mut self, address: u16, count: u16) -> IngestResult<Vec<u16>>;

    /// Writes one holding register.
    async fn write_single(&mut self, address: u16, value: u16) -> IngestResult<()>;

    async fn close(&mut self);
}

/// Opens links to devices.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, device: &DeviceConfig) -> IngestResult<Box<dyn RegisterIo>>;
}

/// Connector backed by tokio-modbus (TCP) and tokio-serial (RTU).
#[derive(Debug, Clone, Copy, Default)]
pub struct ModbusConnector;

#[async_trait]
impl Connector for ModbusConnector {
    async fn connect(&self, device: &DeviceConfig) -> IngestResult<Box<dyn RegisterIo>> {
        let slave = Slave(device.slave_address);
        let timeout = device.timeout();

        let ctx = match &device.connection {
            ConnectionConfig::Tcp { host, port } => {
                let addr = resolve(host, *port).await?;
                tokio::time::timeout(timeout, tcp::connect_slave(addr, slave))
                    .await
                    .map_err(|_| IngestError::Timeout(timeout))?
                    .map_err(|e| IngestError::Connection(e.to_string()))?
            }
            ConnectionConfig::Rtu {
                serial_port,
                baud_rate,
                parity,
                stop_bits,
                data_bits,
            } => {
                let stream = tokio_serial::new(serial_port, *baud_rate)
                    .parity(match parity {
                        Parity::None => tokio_serial::Parity::None,
                        Parity::Even => tokio_serial::Parity::Even,
                        Parity::Odd => tokio_serial::Parity::Odd,
                    })
                    .stop_bits(if *stop_bits == 2 {
                        tokio_serial::StopBits::Two
                    } else {
                        tokio_serial::StopBits::One
                    })
                    .data_bits(match data_bits {
                        5 => tokio_serial::DataBits::Five,
                        6 => tokio_serial::DataBits::Six,
                        7 => tokio_serial::DataBits::Seven,
                        _ => tokio_serial::DataBits::Eight,
                    })
                    .timeout(timeout)
                    .open_native_async()
                    .map_err(|e| IngestError::Connection(format!("{serial_port}: {e}")))?;
                rtu::attach_slave(stream, slave)
            }
        };

        Ok(Box::new(ModbusLink { ctx, timeout }))
    }
}

async fn resolve(host: &str, port: u16) -> IngestResult<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| IngestError::Connection(format!("{host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| IngestError::Connection(format!("{host}:{port}: no address")))
}

struct ModbusLink {
    ctx: Context,
    timeout: Duration,
}

#[async_trait]
impl RegisterIo for ModbusLink {
    async fn read_holding(&mut self, address: u16, count: u16) -> IngestResult<Vec<u16>> {
        tokio::time::timeout(self.timeout, self.ctx.read_holding_registers(address, count))
            .await
            .map_err(|_| IngestError::Timeout(self.timeout))?
            .map_err(|e| IngestError::Modbus(e.to_string()))?
            .map_err(|e| IngestError::Modbus(format!("exception: {e:?}")))
    }

    async fn write_single(&mut self, address: u16, value: u16) -> IngestResult<()> {
        tokio::time::timeout(self.timeout, self.ctx.write_single_register(address, value))
            .await
            .map_err(|_| IngestError::Timeout(self.timeout))?
            .map_err(|e| IngestError::Modbus(e.to_string()))?
            .map_err(|e| IngestError::Modbus(format!("exception: {e:?}")))
    }

    async fn close(&mut self) {
        let _ = self.ctx.disconnect().await;
    }
}

// =============================================================================
// Reading a Device
// =============================================================================

/// Result of reading one device's register map.
#[derive(Debug, Default)]
pub struct DeviceRead {
    pub readings: Vec<RegisterReading>,
    /// Registers that failed to read or decode.
    pub errors: u32,
    /// Set when a failure means the link itself is gone.
    pub link_lost: bool,
}

/// Reads every register of the device's map, in map order.
///
/// A failing register is logged and skipped; it never aborts the rest.
pub async fn read_device(io: &mut dyn RegisterIo, device: &DeviceConfig) -> DeviceRead {
    let mut result = DeviceRead::default();

    for register in device.register_map() {
        let words = match io.read_holding(register.address, register.count).await {
            Ok(words) => words,
            Err(e) => {
                warn!(
                    device = %device.name,
                    register = register.address,
                    error = %e,
                    "Failed to read register"
                );
                result.errors += 1;
                result.link_lost |= e.is_link_failure();
                continue;
            }
        };

        match register.read_value(&words) {
            Ok(value) => result.readings.push(RegisterReading::new(
                &device.name,
                register,
                value,
                Utc::now(),
            )),
            Err(e) => {
                warn!(
                    device = %device.name,
                    register = register.address,
                    error = %e,
                    "Failed to decode register"
                );
                result.errors += 1;
            }
        }
    }

    result
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModbusStats {
    pub devices_registered: usize,
    pub devices_connected: usize,
    pub total_readings: u64,
    pub connection_errors: u64,
    pub read_errors: u64,
    pub last_reading_time: Option<DateTime<Utc>>,
}

// =============================================================================
// Device Poller
// =============================================================================

struct WriteCommand {
    address: u16,
    value: u16,
    reply: oneshot::Sender<bool>,
}

struct DeviceLoop {
    shutdown_tx: watch::Sender<bool>,
    commands: mpsc::Sender<WriteCommand>,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
struct LoopContext {
    db: Database,
    connector: Arc<dyn Connector>,
    stats: Arc<RwLock<ModbusStats>>,
}

/// Owns one polling loop per registered device.
pub struct DevicePoller {
    ctx: LoopContext,
    loops: Mutex<HashMap<String, DeviceLoop>>,
}

impl DevicePoller {
    pub fn new(db: Database, connector: Arc<dyn Connector>) -> Self {
        DevicePoller {
            ctx: LoopContext {
                db,
                connector,
                stats: Arc::new(RwLock::new(ModbusStats::default())),
            },
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Validates the device and starts its polling loop.
    ///
    /// Disabled devices are accepted and ignored.
    pub async fn add_device(&self, device: DeviceConfig) -> IngestResult<()> {
        device.validate()?;
        if !device.enabled {
            info!(device = %device.name, "Device disabled, not polling");
            return Ok(());
        }

        let mut loops = self.loops.lock().await;
        if loops.contains_key(&device.name) {
            return Err(IngestError::DuplicateDevice(device.name));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (commands, command_rx) = mpsc::channel(8);
        let name = device.name.clone();

        info!(
            device = %device.name,
            device_type = %device.device_type,
            link = %device.connection.describe(),
            interval_secs = device.poll_interval_secs,
            "Starting device polling loop"
        );
        let handle = tokio::spawn(run_device_loop(
            device,
            self.ctx.clone(),
            shutdown_rx,
            command_rx,
        ));

        loops.insert(
            name,
            DeviceLoop {
                shutdown_tx,
                commands,
                handle,
            },
        );
        self.ctx.stats.write().await.devices_registered = loops.len();
        Ok(())
    }

    /// Stops a device's loop and waits for its in-flight poll to finish.
    ///
    /// ## Returns
    /// `false` if no such device was registered.
    pub async fn remove_device(&self, name: &str) -> bool {
        let removed = {
            let mut loops = self.loops.lock().await;
            let removed = loops.remove(name);
            self.ctx.stats.write().await.devices_registered = loops.len();
            removed
        };

        match removed {
            Some(device_loop) => {
                drain(name, device_loop).await;
                true
            }
            None => false,
        }
    }

    /// Names of devices with a running loop.
    pub async fn devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loops.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Writes one holding register through the device's own loop.
    ///
    /// Single request, no retry. Failures are logged and reported as `false`.
    pub async fn write_register(&self, name: &str, address: u16, value: u16) -> bool {
        let commands = match self.loops.lock().await.get(name) {
            Some(device_loop) => device_loop.commands.clone(),
            None => {
                warn!(device = %name, "Write to unknown device");
                return false;
            }
        };

        let (reply, response) = oneshot::channel();
        if commands
            .send(WriteCommand {
                address,
                value,
                reply,
            })
            .await
            .is_err()
        {
            warn!(device = %name, "Device loop stopped before write");
            return false;
        }
        response.await.unwrap_or(false)
    }

    pub async fn stats(&self) -> ModbusStats {
        self.ctx.stats.read().await.clone()
    }

    /// Stops every loop and waits for all of them.
    pub async fn stop(&self) {
        let drained: Vec<(String, DeviceLoop)> = self.loops.lock().await.drain().collect();
        info!(count = drained.len(), "Stopping device polling loops");

        for (name, device_loop) in drained {
            drain(&name, device_loop).await;
        }
        self.ctx.stats.write().await.devices_registered = 0;
    }
}

async fn drain(name: &str, device_loop: DeviceLoop) {
    let _ = device_loop.shutdown_tx.send(true);
    if let Err(e) = device_loop.handle.await {
        error!(device = %name, error = %e, "Device loop panicked");
    }
    debug!(device = %name, "Device loop stopped");
}

async fn run_device_loop(
    device: DeviceConfig,
    ctx: LoopContext,
    mut shutdown_rx: watch::Receiver<bool>,
    mut command_rx: mpsc::Receiver<WriteCommand>,
) {
    let mut interval = tokio::time::interval(device.poll_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut link: Option<Box<dyn RegisterIo>> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                poll_once(&device, &ctx, &mut link).await;
            }

            Some(command) = command_rx.recv() => {
                let ok = write_once(&device, &ctx, &mut link, command.address, command.value).await;
                let _ = command.reply.send(ok);
            }

            _ = shutdown_rx.changed() => {
                break;
            }
        }
    }

    drop_link(&ctx, &mut link).await;
}

/// Spacing between connect attempts within one poll cycle.
fn connect_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(50),
        max_interval: Duration::from_secs(2),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Opens the link if needed, trying up to `device.retries` times with a
/// growing pause between attempts.
async fn ensure_link<'a>(
    device: &DeviceConfig,
    ctx: &LoopContext,
    link: &'a mut Option<Box<dyn RegisterIo>>,
) -> IngestResult<&'a mut Box<dyn RegisterIo>> {
    if link.is_none() {
        let attempts = device.retries.max(1);
        let mut last_error = IngestError::Connection("no attempt made".to_string());
        let mut schedule = connect_backoff();

        for attempt in 1..=attempts {
            if attempt > 1 {
                if let Some(pause) = schedule.next_backoff() {
                    tokio::time::sleep(pause).await;
                }
            }
            match ctx.connector.connect(device).await {
                Ok(io) => {
                    info!(device = %device.name, attempt, "Connected to device");
                    ctx.stats.write().await.devices_connected += 1;
                    *link = Some(io);
                    break;
                }
                Err(e) => {
                    debug!(device = %device.name, attempt, error = %e, "Connect attempt failed");
                    last_error = e;
                }
            }
        }

        if link.is_none() {
            ctx.stats.write().await.connection_errors += 1;
            return Err(last_error);
        }
    }

    link.as_mut()
        .ok_or_else(|| IngestError::Connection("link unavailable".to_string()))
}

async fn drop_link(ctx: &LoopContext, link: &mut Option<Box<dyn RegisterIo>>) {
    if let Some(mut io) = link.take() {
        io.close().await;
        let mut stats = ctx.stats.write().await;
        stats.devices_connected = stats.devices_connected.saturating_sub(1);
    }
}

async fn poll_once(device: &DeviceConfig, ctx: &LoopContext, link: &mut Option<Box<dyn RegisterIo>>) {
    let io = match ensure_link(device, ctx, link).await {
        Ok(io) => io,
        Err(e) => {
            warn!(device = %device.name, error = %e, "Device unreachable");
            record_status(ctx, device, DeviceState::Error, Some(e.to_string())).await;
            return;
        }
    };

    let read = read_device(&mut **io, device).await;
    {
        let mut stats = ctx.stats.write().await;
        stats.total_readings += read.readings.len() as u64;
        stats.read_errors += u64::from(read.errors);
        if !read.readings.is_empty() {
            stats.last_reading_time = Some(Utc::now());
        }
    }

    if read.readings.is_empty() {
        if read.link_lost {
            drop_link(ctx, link).await;
            record_status(ctx, device, DeviceState::Error, Some("link lost".to_string())).await;
        }
        return;
    }
    if read.link_lost {
        drop_link(ctx, link).await;
    }

    let reading = Reading::from_register_readings(&device.name, device.device_type, &read.readings);
    match ctx.db.readings().insert(&reading).await {
        Ok(outbox_id) => debug!(
            device = %device.name,
            registers = read.readings.len(),
            outbox_id,
            "Stored device reading"
        ),
        Err(e) => error!(device = %device.name, error = %e, "Failed to store device reading"),
    }

    record_status(ctx, device, DeviceState::Online, None).await;
}

async fn write_once(
    device: &DeviceConfig,
    ctx: &LoopContext,
    link: &mut Option<Box<dyn RegisterIo>>,
    address: u16,
    value: u16,
) -> bool {
    let io = match ensure_link(device, ctx, link).await {
        Ok(io) => io,
        Err(e) => {
            warn!(device = %device.name, address, error = %e, "Register write failed: no link");
            return false;
        }
    };

    match io.write_single(address, value).await {
        Ok(()) => {
            info!(device = %device.name, address, value, "Register written");
            true
        }
        Err(e) => {
            warn!(device = %device.name, address, value, error = %e, "Register write failed");
            if e.is_link_failure() {
                drop_link(ctx, link).await;
            }
            false
        }
    }
}

async fn record_status(
    ctx: &LoopContext,
    device: &DeviceConfig,
    state: DeviceState,
    error: Option<String>,
) {
    let mut status = DeviceStatus::new(&device.name, device.device_type.as_str(), state);
    status.metadata = json!({
        "protocol": match device.connection {
            ConnectionConfig::Tcp { .. } => "tcp",
            ConnectionConfig::Rtu { .. } => "rtu",
        },
        "link": device.connection.describe(),
        "slave_address": device.slave_address,
        "last_error": error,
    });

    if let Err(e) = ctx.db.device_status().upsert(&status).await {
        error!(device = %device.name, error = %e, "Failed to update device status");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use fieldgate_core::{DeviceType, SyncTable};
    use fieldgate_db::DbConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    /// In-memory register bank. Addresses missing from the bank fail.
    #[derive(Clone, Default)]
    struct FakeBank {
        words: Arc<StdMutex<HashMap<u16, Vec<u16>>>>,
        writes: Arc<StdMutex<Vec<(u16, u16)>>>,
    }

    struct FakeLink(FakeBank);

    #[async_trait]
    impl RegisterIo for FakeLink {
        async fn read_holding(&mut self, address: u16, count: u16) -> IngestResult<Vec<u16>> {
            let words = self.0.words.lock().unwrap();
            match words.get(&address) {
                Some(w) => Ok(w.iter().copied().take(count as usize).collect()),
                None => Err(IngestError::Modbus("exception: IllegalDataAddress".into())),
            }
        }

        async fn write_single(&mut self, address: u16, value: u16) -> IngestResult<()> {
            self.0.writes.lock().unwrap().push((address, value));
            Ok(())
        }

        async fn close(&mut self) {}
    }

    struct FakeConnector {
        bank: FakeBank,
        reachable: bool,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, _device: &DeviceConfig) -> IngestResult<Box<dyn RegisterIo>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.reachable {
                Ok(Box::new(FakeLink(self.bank.clone())))
            } else {
                Err(IngestError::Connection("connection refused".into()))
            }
        }
    }

    fn inverter_bank() -> FakeBank {
        let bank = FakeBank::default();
        {
            let mut words = bank.words.lock().unwrap();
            words.insert(40001, vec![1200]); // AC Power
            words.insert(40002, vec![230]); // AC Voltage
            // 40003 AC Current missing: read fails
            words.insert(40004, vec![500]); // Frequency x0.1
            words.insert(40005, vec![0, 7]); // Total Energy u32
            words.insert(40007, vec![9]); // Power Factor x0.1
            words.insert(40008, vec![65531]); // Temperature int16 = -5
            words.insert(40009, vec![1]); // Status
        }
        bank
    }

    fn device() -> DeviceConfig {
        let mut device = DeviceConfig::tcp("inv-1", DeviceType::Inverter, "127.0.0.1", 502);
        device.poll_interval_secs = 1;
        device.retries = 2;
        device
    }

    #[tokio::test]
    async fn test_read_device_skips_failed_register() {
        let mut link = FakeLink(inverter_bank());
        let read = read_device(&mut link, &device()).await;

        assert_eq!(read.errors, 1);
        assert!(!read.link_lost);
        assert_eq!(read.readings.len(), 7);

        let addresses: Vec<u16> = read.readings.iter().map(|r| r.register_address).collect();
        assert_eq!(addresses, vec![40001, 40002, 40004, 40005, 40007, 40008, 40009]);

        let by_address = |a: u16| read.readings.iter().find(|r| r.register_address == a).unwrap();
        assert_eq!(by_address(40004).value, 50.0);
        assert_eq!(by_address(40005).value, 7.0);
        assert_eq!(by_address(40008).value, -5.0);
        assert_eq!(by_address(40001).unit, "W");
    }

    #[tokio::test]
    async fn test_poll_stores_reading_and_status() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let connector = Arc::new(FakeConnector {
            bank: inverter_bank(),
            reachable: true,
            attempts: AtomicU32::new(0),
        });
        let poller = DevicePoller::new(db.clone(), connector);

        poller.add_device(device()).await.unwrap();
        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(200)).await;
        poller.stop().await;

        let readings = db.readings().list(&Default::default()).await.unwrap();
        assert!(!readings.is_empty());
        assert_eq!(readings[0].device_id, "inv-1");
        assert_eq!(readings[0].power, Some(1200.0));
        assert_eq!(readings[0].temperature, Some(-5.0));

        let pending = db.sync_outbox().get_pending(10).await.unwrap();
        assert!(pending.iter().all(|r| r.table_name == SyncTable::EnergyReadings));

        let status = db.device_status().get("inv-1").await.unwrap().unwrap();
        assert_eq!(status.status, DeviceState::Online);

        let stats = poller.stats().await;
        assert!(stats.total_readings >= 7);
        assert_eq!(stats.devices_connected, 0);
        assert!(poller.devices().await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_device_marks_error_and_keeps_loop() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let connector = Arc::new(FakeConnector {
            bank: FakeBank::default(),
            reachable: false,
            attempts: AtomicU32::new(0),
        });
        let poller = DevicePoller::new(db.clone(), connector.clone());

        poller.add_device(device()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Still registered for the next cycle.
        assert_eq!(poller.devices().await, vec!["inv-1".to_string()]);
        assert!(poller.remove_device("inv-1").await);
        assert!(!poller.remove_device("inv-1").await);

        // Two connect attempts per cycle.
        assert_eq!(connector.attempts.load(Ordering::SeqCst) % 2, 0);
        let status = db.device_status().get("inv-1").await.unwrap().unwrap();
        assert_eq!(status.status, DeviceState::Error);
        assert_eq!(db.readings().count().await.unwrap(), 0);
        assert!(poller.stats().await.connection_errors >= 1);
    }

    /// Refuses the first `failures` connects and records when each attempt ran.
    struct FlakyConnector {
        bank: FakeBank,
        failures: usize,
        attempts: StdMutex<Vec<tokio::time::Instant>>,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self, _device: &DeviceConfig) -> IngestResult<Box<dyn RegisterIo>> {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(tokio::time::Instant::now());
            if attempts.len() <= self.failures {
                Err(IngestError::Connection("connection refused".into()))
            } else {
                Ok(Box::new(FakeLink(self.bank.clone())))
            }
        }
    }

    #[tokio::test]
    async fn test_connect_attempts_are_spaced_out() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let connector = Arc::new(FlakyConnector {
            bank: inverter_bank(),
            failures: 2,
            attempts: StdMutex::new(Vec::new()),
        });
        let ctx = LoopContext {
            db,
            connector: connector.clone(),
            stats: Arc::new(RwLock::new(ModbusStats::default())),
        };
        let mut dev = device();
        dev.retries = 3;

        let mut link = None;
        ensure_link(&dev, &ctx, &mut link).await.unwrap();
        assert!(link.is_some());

        let attempts = connector.attempts.lock().unwrap().clone();
        assert_eq!(attempts.len(), 3);
        // Randomized around 50ms, never below half of it.
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(20));
        }

        let stats = ctx.stats.read().await;
        assert_eq!(stats.devices_connected, 1);
        assert_eq!(stats.connection_errors, 0);
    }

    #[tokio::test]
    async fn test_write_register_goes_through_loop() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let bank = inverter_bank();
        let connector = Arc::new(FakeConnector {
            bank: bank.clone(),
            reachable: true,
            attempts: AtomicU32::new(0),
        });
        let poller = DevicePoller::new(db, connector);
        poller.add_device(device()).await.unwrap();

        assert!(poller.write_register("inv-1", 40100, 42).await);
        assert!(!poller.write_register("missing", 40100, 42).await);
        poller.stop().await;

        assert_eq!(*bank.writes.lock().unwrap(), vec![(40100, 42)]);
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_devices_rejected() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let connector = Arc::new(FakeConnector {
            bank: FakeBank::default(),
            reachable: false,
            attempts: AtomicU32::new(0),
        });
        let poller = DevicePoller::new(db, connector);

        poller.add_device(device()).await.unwrap();
        assert!(matches!(
            poller.add_device(device()).await,
            Err(IngestError::DuplicateDevice(_))
        ));

        let mut bad = device();
        bad.name = "other".into();
        bad.slave_address = 0;
        assert!(matches!(
            poller.add_device(bad).await,
            Err(IngestError::Validation(_))
        ));
        poller.stop().await;
    }
}
