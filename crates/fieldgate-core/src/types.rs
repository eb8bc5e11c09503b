//! # Domain Types
//!
//! Core domain types persisted by the gateway.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Reading      │   │     Alert       │   │   Prediction    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │   │  id (UUID)      │   │  id (UUID)      │       │
//! │  │  device_id      │   │  severity       │   │  model_name     │       │
//! │  │  power, ...     │   │  ack / resolved │   │  confidence     │       │
//! │  └────────┬────────┘   └────────┬────────┘   └────────┬────────┘       │
//! │           │   same transaction  │                     │                 │
//! │           └─────────────────────┼─────────────────────┘                 │
//! │                                 ▼                                       │
//! │                     ┌─────────────────────┐                             │
//! │                     │   OutboxRecord      │  pending → synced           │
//! │                     │   table + record_id │          → failed           │
//! │                     └─────────────────────┘          → conflict         │
//! │                                                                         │
//! │  ┌─────────────────┐  latest-wins, not synced                          │
//! │  │  DeviceStatus   │                                                    │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::codec::RegisterReading;
use crate::device::DeviceType;
use crate::error::CoreError;

// =============================================================================
// Sync Table
// =============================================================================

/// Tables whose rows are mirrored to the cloud through the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum SyncTable {
    EnergyReadings,
    Alerts,
    AiPredictions,
}

impl SyncTable {
    pub const ALL: [SyncTable; 3] = [
        SyncTable::EnergyReadings,
        SyncTable::Alerts,
        SyncTable::AiPredictions,
    ];

    /// SQL table name, also the `{table}` path segment of the sync endpoint.
    pub const fn as_str(self) -> &'static str {
        match self {
            SyncTable::EnergyReadings => "energy_readings",
            SyncTable::Alerts => "alerts",
            SyncTable::AiPredictions => "ai_predictions",
        }
    }
}

impl std::fmt::Display for SyncTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncTable {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "energy_readings" => Ok(SyncTable::EnergyReadings),
            "alerts" => Ok(SyncTable::Alerts),
            "ai_predictions" => Ok(SyncTable::AiPredictions),
            other => Err(CoreError::unknown("sync table", other)),
        }
    }
}

// =============================================================================
// Outbox
// =============================================================================

/// Delivery state of an outbox record.
///
/// ## State Machine
/// ```text
///            ┌──────────► synced    (terminal)
///  pending ──┼──────────► conflict  (terminal, needs an operator)
///     ▲      └──────────► failed
///     │                     │
///     └── re-queue after ───┘  (only while attempts < retry limit)
///         backoff delay
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Synced,
    Failed,
    Conflict,
}

impl OutboxStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Synced => "synced",
            OutboxStatus::Failed => "failed",
            OutboxStatus::Conflict => "conflict",
        }
    }

    /// Returns true when a record in this state may move to `next`.
    pub const fn can_transition_to(self, next: OutboxStatus) -> bool {
        matches!(
            (self, next),
            (OutboxStatus::Pending, OutboxStatus::Synced)
                | (OutboxStatus::Pending, OutboxStatus::Failed)
                | (OutboxStatus::Pending, OutboxStatus::Conflict)
                | (OutboxStatus::Failed, OutboxStatus::Pending)
        )
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "synced" => Ok(OutboxStatus::Synced),
            "failed" => Ok(OutboxStatus::Failed),
            "conflict" => Ok(OutboxStatus::Conflict),
            other => Err(CoreError::unknown("outbox status", other)),
        }
    }
}

/// A durable "needs to be sent" marker for one domain row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct OutboxRecord {
    /// Monotonic id; batches are drained in this order.
    pub id: i64,
    pub table_name: SyncTable,
    /// Id of the row in `table_name`.
    pub record_id: String,
    pub status: OutboxStatus,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Failed transmission attempts so far.
    pub attempts: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Reading
// =============================================================================

/// Data quality flag carried by every reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum ReadingQuality {
    #[default]
    Good,
    Uncertain,
    Bad,
}

/// One energy/telemetry record. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub id: String,
    pub device_id: String,
    pub device_type: String,
    pub timestamp: DateTime<Utc>,
    pub power: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub frequency: Option<f64>,
    pub power_factor: Option<f64>,
    pub energy: Option<f64>,
    pub temperature: Option<f64>,
    /// Every raw value the producer sent, keyed by name.
    pub raw_data: Value,
    pub quality: ReadingQuality,
    pub created_at: DateTime<Utc>,
}

impl Reading {
    /// Creates an empty reading stamped now.
    pub fn new(device_id: impl Into<String>, device_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Reading {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            device_type: device_type.into(),
            timestamp: now,
            power: None,
            voltage: None,
            current: None,
            frequency: None,
            power_factor: None,
            energy: None,
            temperature: None,
            raw_data: Value::Object(Map::new()),
            quality: ReadingQuality::Good,
            created_at: now,
        }
    }

    pub fn with_power(mut self, power: f64) -> Self {
        self.power = Some(power);
        self
    }

    /// Folds one poll's register readings into a single reading.
    ///
    /// Measurement fields take the first register whose description names
    /// them ("Voltage L1" fills `voltage`); every value lands in `raw_data`.
    pub fn from_register_readings(
        device_id: &str,
        device_type: DeviceType,
        readings: &[RegisterReading],
    ) -> Self {
        let mut reading = Reading::new(device_id, device_type.as_str());
        if let Some(first) = readings.first() {
            reading.timestamp = first.timestamp;
        }

        let mut raw = Map::new();
        for r in readings {
            raw.insert(r.description.clone(), Value::from(r.value));

            let description = r.description.to_lowercase();
            let slot = if description.contains("power factor") {
                &mut reading.power_factor
            } else if description.contains("power") {
                &mut reading.power
            } else if description.contains("voltage") {
                &mut reading.voltage
            } else if description.contains("current") {
                &mut reading.current
            } else if description.contains("frequency") {
                &mut reading.frequency
            } else if description.contains("energy") {
                &mut reading.energy
            } else if description.contains("temperature") {
                &mut reading.temperature
            } else {
                continue;
            };
            if slot.is_none() {
                *slot = Some(r.value);
            }
        }
        reading.raw_data = Value::Object(raw);
        reading
    }

    /// Builds a reading from an MQTT energy payload.
    ///
    /// Accepts either `{"data": {...}}` or the measurement fields at top level.
    pub fn from_payload(device_id: &str, payload: &Value) -> Self {
        let data = payload.get("data").unwrap_or(payload);
        let device_type = payload
            .get("device_type")
            .or_else(|| data.get("device_type"))
            .and_then(Value::as_str)
            .unwrap_or("mqtt");

        let mut reading = Reading::new(device_id, device_type);
        let number = |key: &str| data.get(key).and_then(Value::as_f64);
        reading.power = number("power");
        reading.voltage = number("voltage");
        reading.current = number("current");
        reading.frequency = number("frequency");
        reading.power_factor = number("power_factor");
        reading.energy = number("energy");
        reading.temperature = number("temperature");
        if let Some(ts) = parse_timestamp(payload.get("timestamp")) {
            reading.timestamp = ts;
        }
        reading.raw_data = data.clone();
        reading
    }
}

// =============================================================================
// Alert
// =============================================================================

/// Alert severity. Critical alerts are exempt from retention cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Warning,
    #[default]
    Info,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "warning" => Ok(Severity::Warning),
            "info" => Ok(Severity::Info),
            other => Err(CoreError::unknown("severity", other)),
        }
    }
}

/// A device alert. Only `acknowledged` and `resolved` change after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub device_id: String,
    pub alert_type: String,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    pub resolved: bool,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        device_id: impl Into<String>,
        alert_type: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Alert {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            alert_type: alert_type.into(),
            severity,
            message: message.into(),
            timestamp: now,
            acknowledged: false,
            resolved: false,
            metadata: Value::Object(Map::new()),
            created_at: now,
        }
    }

    /// Builds an alert from an MQTT alert payload.
    ///
    /// Unknown severities fall back to `info` rather than dropping the alert.
    pub fn from_payload(device_id: &str, alert_type: &str, payload: &Value) -> Self {
        let severity = payload
            .get("severity")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string());

        let mut alert = Alert::new(device_id, alert_type, severity, message);
        if let Some(ts) = parse_timestamp(payload.get("timestamp")) {
            alert.timestamp = ts;
        }
        if let Some(metadata) = payload.get("metadata").filter(|m| m.is_object()) {
            alert.metadata = metadata.clone();
        }
        alert
    }
}

// =============================================================================
// Prediction
// =============================================================================

/// Output of an analytics model, stored like any other producer's data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub model_name: String,
    pub prediction_type: String,
    pub input_data: Value,
    pub prediction_result: Value,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Prediction {
    pub fn new(
        model_name: impl Into<String>,
        prediction_type: impl Into<String>,
        input_data: Value,
        prediction_result: Value,
        confidence: f64,
    ) -> Self {
        let now = Utc::now();
        Prediction {
            id: Uuid::new_v4().to_string(),
            model_name: model_name.into(),
            prediction_type: prediction_type.into(),
            input_data,
            prediction_result,
            confidence,
            timestamp: now,
            created_at: now,
        }
    }
}

// =============================================================================
// Device Status
// =============================================================================

/// Connectivity state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Online,
    Offline,
    Error,
}

impl std::str::FromStr for DeviceState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "online" => Ok(DeviceState::Online),
            "offline" => Ok(DeviceState::Offline),
            "error" => Ok(DeviceState::Error),
            other => Err(CoreError::unknown("device state", other)),
        }
    }
}

/// Latest known status of a device, one row per `device_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub device_type: String,
    pub status: DeviceState,
    pub last_seen: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
    pub firmware_version: Option<String>,
    pub hardware_version: Option<String>,
    pub metadata: Value,
}

impl DeviceStatus {
    pub fn new(device_id: impl Into<String>, device_type: impl Into<String>, status: DeviceState) -> Self {
        DeviceStatus {
            device_id: device_id.into(),
            device_type: device_type.into(),
            status,
            last_seen: Utc::now(),
            ip_address: None,
            mac_address: None,
            firmware_version: None,
            hardware_version: None,
            metadata: Value::Object(Map::new()),
        }
    }
}

/// Shallow-merges `patch` into `base`: top-level keys of `patch` replace
/// those of `base`, other keys of `base` survive. A non-object `base` is
/// replaced by `patch` wholesale.
pub fn merge_metadata(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            let mut merged = base.clone();
            for (key, value) in patch {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, Value::Null) => base.clone(),
        _ => patch.clone(),
    }
}

fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let raw = value?.as_str()?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    // Producers often send naive ISO timestamps; treat them as UTC.
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// =============================================================================
// Unit Tests
// =============================================================================
