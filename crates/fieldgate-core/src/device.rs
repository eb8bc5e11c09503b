//! # Device Configuration
//!
//! Closed, validated configuration for register-based field devices, plus the
//! fixed register map of every supported device type.
//!
//! ## Config File Shape
//! ```toml
//! [[modbus.devices]]
//! name = "inv-1"
//! device_type = "inverter"
//! protocol = "tcp"
//! host = "192.168.1.50"
//! port = 502
//! slave_address = 1
//!
//! [[modbus.devices]]
//! name = "bat-1"
//! device_type = "battery"
//! protocol = "rtu"
//! serial_port = "/dev/ttyUSB0"
//! baud_rate = 9600
//! slave_address = 2
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::codec::{DataType, Register};
use crate::error::ValidationError;
use crate::validation::{validate_device_name, validate_slave_address, ValidationResult};

// =============================================================================
// Device Type + Register Maps
// =============================================================================

/// Kind of field device; selects the register map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Inverter,
    Meter,
    Battery,
}

const INVERTER_REGISTERS: &[Register] = &[
    Register::new(40001, DataType::Uint16, "AC Power"),
    Register::new(40002, DataType::Uint16, "AC Voltage"),
    Register::new(40003, DataType::Uint16, "AC Current"),
    Register::new(40004, DataType::Uint16, "Frequency").scaled(0.1),
    Register::new(40005, DataType::Uint32, "Total Energy"),
    Register::new(40007, DataType::Uint16, "Power Factor").scaled(0.1),
    Register::new(40008, DataType::Int16, "Temperature"),
    Register::new(40009, DataType::Uint16, "Status"),
];

const METER_REGISTERS: &[Register] = &[
    Register::new(40001, DataType::Uint16, "Active Power"),
    Register::new(40002, DataType::Uint16, "Voltage L1"),
    Register::new(40003, DataType::Uint16, "Voltage L2"),
    Register::new(40004, DataType::Uint16, "Voltage L3"),
    Register::new(40005, DataType::Uint16, "Current L1"),
    Register::new(40006, DataType::Uint16, "Current L2"),
    Register::new(40007, DataType::Uint16, "Current L3"),
    Register::new(40008, DataType::Uint32, "Total Energy"),
    Register::new(40010, DataType::Uint16, "Frequency").scaled(0.1),
];

const BATTERY_REGISTERS: &[Register] = &[
    Register::new(40001, DataType::Uint16, "Voltage").scaled(0.1),
    Register::new(40002, DataType::Int16, "Current").scaled(0.1),
    Register::new(40003, DataType::Uint16, "State of Charge").scaled(0.1),
    Register::new(40004, DataType::Uint16, "Temperature").scaled(0.1),
    Register::new(40005, DataType::Uint16, "Status"),
    Register::new(40006, DataType::Uint32, "Total Energy"),
];

impl DeviceType {
    /// Registers read on every poll, in read order.
    pub fn register_map(self) -> &'static [Register] {
        match self {
            DeviceType::Inverter => INVERTER_REGISTERS,
            DeviceType::Meter => METER_REGISTERS,
            DeviceType::Battery => BATTERY_REGISTERS,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            DeviceType::Inverter => "inverter",
            DeviceType::Meter => "meter",
            DeviceType::Battery => "battery",
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Serial parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    #[serde(rename = "N", alias = "none")]
    None,
    #[serde(rename = "E", alias = "even")]
    Even,
    #[serde(rename = "O", alias = "odd")]
    Odd,
}

/// Physical link to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// Modbus TCP.
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
    /// Modbus RTU over a serial line.
    Rtu {
        serial_port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default)]
        parity: Parity,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
    },
}

fn default_tcp_port() -> u16 {
    502
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_stop_bits() -> u8 {
    1
}
fn default_data_bits() -> u8 {
    8
}

impl ConnectionConfig {
    /// Short label for logs: `tcp://host:port` or `rtu:/dev/ttyUSB0`.
    pub fn describe(&self) -> String {
        match self {
            ConnectionConfig::Tcp { host, port } => format!("tcp://{}:{}", host, port),
            ConnectionConfig::Rtu { serial_port, .. } => format!("rtu:{}", serial_port),
        }
    }

    fn validate(&self) -> ValidationResult<()> {
        match self {
            ConnectionConfig::Tcp { host, port } => {
                if host.trim().is_empty() {
                    return Err(ValidationError::Required {
                        field: "host".to_string(),
                    });
                }
                if *port == 0 {
                    return Err(ValidationError::OutOfRange {
                        field: "port".to_string(),
                        min: 1,
                        max: i64::from(u16::MAX),
                    });
                }
            }
            ConnectionConfig::Rtu {
                serial_port,
                baud_rate,
                stop_bits,
                data_bits,
                ..
            } => {
                if serial_port.trim().is_empty() {
                    return Err(ValidationError::Required {
                        field: "serial_port".to_string(),
                    });
                }
                if *baud_rate == 0 {
                    return Err(ValidationError::OutOfRange {
                        field: "baud_rate".to_string(),
                        min: 1,
                        max: i64::from(u32::MAX),
                    });
                }
                if !(1..=2).contains(stop_bits) {
                    return Err(ValidationError::OutOfRange {
                        field: "stop_bits".to_string(),
                        min: 1,
                        max: 2,
                    });
                }
                if !(5..=8).contains(data_bits) {
                    return Err(ValidationError::OutOfRange {
                        field: "data_bits".to_string(),
                        min: 5,
                        max: 8,
                    });
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Device Config
// =============================================================================

/// Configuration of one register-based device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique name; also used as `device_id` on stored readings.
    pub name: String,

    pub device_type: DeviceType,

    #[serde(flatten)]
    pub connection: ConnectionConfig,

    /// Modbus slave (unit) address, 1..=247.
    #[serde(default = "default_slave_address")]
    pub slave_address: u8,

    /// Per-request timeout (milliseconds).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Connect attempts per poll cycle.
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds between polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_slave_address() -> u8 {
    1
}
fn default_timeout_ms() -> u64 {
    3000
}
fn default_retries() -> u32 {
    3
}
fn default_enabled() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    10
}

impl DeviceConfig {
    /// Creates an enabled TCP device with default timing.
    pub fn tcp(name: impl Into<String>, device_type: DeviceType, host: impl Into<String>, port: u16) -> Self {
        DeviceConfig {
            name: name.into(),
            device_type,
            connection: ConnectionConfig::Tcp {
                host: host.into(),
                port,
            },
            slave_address: default_slave_address(),
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            enabled: default_enabled(),
            poll_interval_secs: default_poll_interval(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn register_map(&self) -> &'static [Register] {
        self.device_type.register_map()
    }

    /// Checks every field; called once at startup or when a device is added.
    pub fn validate(&self) -> ValidationResult<()> {
        validate_device_name(&self.name)?;
        validate_slave_address(self.slave_address)?;

        if self.timeout_ms == 0 {
            return Err(ValidationError::OutOfRange {
                field: "timeout_ms".to_string(),
                min: 1,
                max: i64::MAX,
            });
        }
        if self.poll_interval_secs == 0 {
            return Err(ValidationError::OutOfRange {
                field: "poll_interval_secs".to_string(),
                min: 1,
                max: i64::MAX,
            });
        }

        self.connection.validate()
    }
}

/// Validates a full device list, including name uniqueness.
pub fn validate_devices(devices: &[DeviceConfig]) -> ValidationResult<()> {
    let mut seen = HashSet::new();
    for device in devices {
        device.validate()?;
        if !seen.insert(device.name.as_str()) {
            return Err(ValidationError::Duplicate {
                field: "device name".to_string(),
                value: device.name.clone(),
            });
        }
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
