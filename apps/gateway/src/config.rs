//! # Gateway Configuration
//!
//! One TOML file, every section optional.
//!
//! ## Load Order (later overrides earlier)
//! 1. Default values
//! 2. Config file: explicit path, then `FIELDGATE_CONFIG`, then
//!    `<platform config dir>/fieldgate.toml`
//! 3. `FIELDGATE_*` environment variables
//! 4. `validate()`
//!
//! ## Example
//! ```toml
//! [gateway]
//! id = "edge-01"
//! data_dir = "/var/lib/fieldgate"
//!
//! [storage]
//! backup_interval_hours = 12
//!
//! [sync]
//! cloud_api_url = "https://cloud.example.com"
//! conflict_resolution = "timestamp"
//!
//! [mqtt]
//! host = "broker.local"
//!
//! [[modbus.devices]]
//! name = "inverter_01"
//! device_type = "inverter"
//! protocol = "tcp"
//! host = "192.168.1.100"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fieldgate_core::device::validate_devices;
use fieldgate_core::{DeviceConfig, ValidationError};
use fieldgate_db::{BackupOptions, DbConfig};
use fieldgate_ingest::MqttSettings;
use fieldgate_sync::SyncSettings;

use crate::error::{GatewayError, GatewayResult};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "FIELDGATE_CONFIG";

const CONFIG_FILE_NAME: &str = "fieldgate.toml";

// =============================================================================
// [gateway]
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    /// Identity of this gateway in logs and status payloads.
    #[serde(default = "default_gateway_id")]
    pub id: String,

    #[serde(default = "default_gateway_name")]
    pub name: String,

    /// Base directory for the database and backups.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_gateway_id() -> String {
    "edge-gateway".to_string()
}

fn default_gateway_name() -> String {
    "Fieldgate Edge Gateway".to_string()
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("io", "fieldgate", "gateway")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

impl Default for GatewaySection {
    fn default() -> Self {
        GatewaySection {
            id: default_gateway_id(),
            name: default_gateway_name(),
            data_dir: default_data_dir(),
        }
    }
}

// =============================================================================
// [storage]
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Defaults to `{data_dir}/fieldgate.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_true")]
    pub backup_enabled: bool,

    /// Defaults to `{data_dir}/backups`.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,

    #[serde(default = "default_backup_interval_hours")]
    pub backup_interval_hours: u64,

    #[serde(default = "default_backup_retention_days")]
    pub backup_retention_days: u32,

    /// Readings, predictions and non-critical alerts older than this are
    /// removed by the maintenance loop.
    #[serde(default = "default_max_data_age_days")]
    pub max_data_age_days: u32,

    #[serde(default = "default_true")]
    pub compression_enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    5
}

fn default_backup_interval_hours() -> u64 {
    24
}

fn default_backup_retention_days() -> u32 {
    30
}

fn default_max_data_age_days() -> u32 {
    90
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            database_path: None,
            max_connections: default_max_connections(),
            backup_enabled: true,
            backup_dir: None,
            backup_interval_hours: default_backup_interval_hours(),
            backup_retention_days: default_backup_retention_days(),
            max_data_age_days: default_max_data_age_days(),
            compression_enabled: true,
        }
    }
}

// =============================================================================
// [modbus]
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModbusSettings {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySection,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub mqtt: MqttSettings,

    #[serde(default)]
    pub modbus: ModbusSettings,
}

impl GatewayConfig {
    /// Loads configuration from file, environment, and defaults.
    pub fn load(config_path: Option<PathBuf>) -> GatewayResult<Self> {
        let path = config_path
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(Self::default_config_path);

        let mut config = match path {
            Some(path) if path.exists() => {
                info!(?path, "Loading gateway config from file");
                Self::from_file(&path)?
            }
            Some(path) => {
                debug!(?path, "Config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> GatewayResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| GatewayError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> GatewayResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Rejects malformed configuration before anything is started.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.gateway.id.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "gateway.id".to_string(),
            }
            .into());
        }
        if self.storage.max_connections == 0 {
            return Err(ValidationError::OutOfRange {
                field: "storage.max_connections".to_string(),
                min: 1,
                max: i64::from(u32::MAX),
            }
            .into());
        }
        if self.storage.backup_interval_hours == 0 {
            return Err(ValidationError::OutOfRange {
                field: "storage.backup_interval_hours".to_string(),
                min: 1,
                max: i64::MAX,
            }
            .into());
        }
        if self.storage.max_data_age_days == 0 {
            return Err(ValidationError::OutOfRange {
                field: "storage.max_data_age_days".to_string(),
                min: 1,
                max: i64::from(u32::MAX),
            }
            .into());
        }

        self.sync.validate()?;
        if self.mqtt.enabled {
            self.mqtt.validate()?;
        }
        validate_devices(&self.modbus.devices)?;
        Ok(())
    }

    /// Applies `FIELDGATE_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("FIELDGATE_GATEWAY_ID") {
            debug!(gateway_id = %id, "Overriding gateway id from environment");
            self.gateway.id = id;
        }
        if let Some(dir) = lookup("FIELDGATE_DATA_DIR") {
            self.gateway.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("FIELDGATE_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }

        // Sync
        if let Some(enabled) = lookup("FIELDGATE_SYNC_ENABLED") {
            self.sync.enabled = parse_env("FIELDGATE_SYNC_ENABLED", &enabled)?;
        }
        if let Some(url) = lookup("FIELDGATE_CLOUD_API_URL") {
            debug!(url = %url, "Overriding cloud API URL from environment");
            self.sync.cloud_api_url = Some(url);
        }
        if let Some(key) = lookup("FIELDGATE_CLOUD_API_KEY") {
            self.sync.cloud_api_key = Some(key);
        }
        if let Some(secs) = lookup("FIELDGATE_SYNC_INTERVAL_SECS") {
            self.sync.interval_secs = parse_env("FIELDGATE_SYNC_INTERVAL_SECS", &secs)?;
        }
        if let Some(transport) = lookup("FIELDGATE_SYNC_TRANSPORT") {
            self.sync.transport = transport.parse()?;
        }
        if let Some(policy) = lookup("FIELDGATE_CONFLICT_RESOLUTION") {
            self.sync.conflict_resolution = policy.parse()?;
        }

        // MQTT
        if let Some(enabled) = lookup("FIELDGATE_MQTT_ENABLED") {
            self.mqtt.enabled = parse_env("FIELDGATE_MQTT_ENABLED", &enabled)?;
        }
        if let Some(host) = lookup("FIELDGATE_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("FIELDGATE_MQTT_PORT") {
            self.mqtt.port = parse_env("FIELDGATE_MQTT_PORT", &port)?;
        }
        if let Some(username) = lookup("FIELDGATE_MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = lookup("FIELDGATE_MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        Ok(())
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "fieldgate", "gateway")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    // =========================================================================
    // Derived Settings
    // =========================================================================

    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| self.gateway.data_dir.join("fieldgate.db"))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.storage
            .backup_dir
            .clone()
            .unwrap_or_else(|| self.gateway.data_dir.join("backups"))
    }

    pub fn db_config(&self) -> DbConfig {
        DbConfig::new(self.database_path()).max_connections(self.storage.max_connections)
    }

    pub fn backup_options(&self) -> BackupOptions {
        BackupOptions {
            dir: self.backup_dir(),
            compress: self.storage.compression_enabled,
            retention_days: self.storage.backup_retention_days,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> GatewayResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| GatewayError::InvalidValue(key.to_string()))
}
