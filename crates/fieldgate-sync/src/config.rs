//! # Sync Configuration
//!
//! The `[sync]` section of `fieldgate.toml`.
//!
//! ## Configuration File Format
//! ```toml
//! [sync]
//! enabled = true
//! interval_secs = 300
//! batch_size = 1000
//! retry_attempts = 3
//! retry_delay_secs = 60
//! conflict_resolution = "edge_priority"   # edge_priority | cloud_priority | timestamp
//! transport = "http"                      # http | mqtt_publish
//! cloud_api_url = "https://cloud.example.com"
//! cloud_api_key = "..."
//!
//! [sync.publish]                          # only for transport = "mqtt_publish"
//! host = "hub.example.net"
//! port = 8883
//! device_id = "edge-01"
//! ```

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Closed Choices
// =============================================================================

/// How a 409 from the cloud is settled.
///
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  EDGE_PRIORITY   local rows are authoritative, nothing is written      │
/// │  CLOUD_PRIORITY  remote fields overwrite local mutable columns         │
/// │  TIMESTAMP       per record, the strictly newer side wins; ties local  │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    #[serde(alias = "edge-priority")]
    EdgePriority,

    #[serde(alias = "cloud-priority")]
    CloudPriority,

    Timestamp,
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictPolicy::EdgePriority => write!(f, "edge_priority"),
            ConflictPolicy::CloudPriority => write!(f, "cloud_priority"),
            ConflictPolicy::Timestamp => write!(f, "timestamp"),
        }
    }
}

impl std::str::FromStr for ConflictPolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "edge_priority" => Ok(ConflictPolicy::EdgePriority),
            "cloud_priority" => Ok(ConflictPolicy::CloudPriority),
            "timestamp" => Ok(ConflictPolicy::Timestamp),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown conflict policy: '{}'. Valid options: edge_priority, cloud_priority, timestamp",
                other
            ))),
        }
    }
}

/// Which transport carries batches to the cloud. Exactly one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Http,

    #[serde(alias = "mqtt-publish")]
    MqttPublish,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Http => write!(f, "http"),
            TransportKind::MqttPublish => write!(f, "mqtt_publish"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "http" => Ok(TransportKind::Http),
            "mqtt_publish" | "mqtt" => Ok(TransportKind::MqttPublish),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown sync transport: '{}'. Valid options: http, mqtt_publish",
                other
            ))),
        }
    }
}

// =============================================================================
// Publish Transport Settings
// =============================================================================

/// Broker the message-publish transport sends batches to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSettings {
    #[serde(default = "default_publish_host")]
    pub host: String,

    #[serde(default = "default_publish_port")]
    pub port: u16,

    /// Identity used in `devices/{device_id}/messages/events/...`.
    #[serde(default)]
    pub device_id: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_publish_qos")]
    pub qos: u8,
}

fn default_publish_host() -> String {
    "localhost".to_string()
}

fn default_publish_port() -> u16 {
    8883
}

fn default_publish_qos() -> u8 {
    1
}

impl Default for PublishSettings {
    fn default() -> Self {
        PublishSettings {
            host: default_publish_host(),
            port: default_publish_port(),
            device_id: String::new(),
            username: None,
            password: None,
            qos: default_publish_qos(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// `[sync]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds between periodic cycles.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Pending records fetched per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Attempts before a failed record stays failed.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay before the first retry; doubles per attempt.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,

    #[serde(default)]
    pub conflict_resolution: ConflictPolicy,

    #[serde(default)]
    pub transport: TransportKind,

    #[serde(default)]
    pub cloud_api_url: Option<String>,

    #[serde(default)]
    pub cloud_api_key: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub publish: PublishSettings,
}

fn default_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    300
}

fn default_batch_size() -> u32 {
    1000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    60
}

fn default_max_retry_delay_secs() -> u64 {
    3600
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            retry_attempts: default_retry_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            max_retry_delay_secs: default_max_retry_delay_secs(),
            conflict_resolution: ConflictPolicy::default(),
            transport: TransportKind::default(),
            cloud_api_url: None,
            cloud_api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
            publish: PublishSettings::default(),
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Wait before a record that has failed `attempts` times is re-queued:
    /// `min(retry_delay * 2^(attempts - 1), max_retry_delay)`.
    pub fn retry_delay(&self, attempts: i64) -> Duration {
        let initial = Duration::from_secs(self.retry_delay_secs);
        let max = Duration::from_secs(self.max_retry_delay_secs.max(self.retry_delay_secs));
        let mut schedule = ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: max,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        let mut delay = initial;
        for _ in 0..attempts.max(1) {
            match schedule.next_backoff() {
                Some(next) => delay = next,
                None => return max,
            }
            if delay >= max {
                return max;
            }
        }
        delay
    }

    /// Checks limits and, for an enabled engine, the active transport's
    /// settings.
    pub fn validate(&self) -> SyncResult<()> {
        if self.interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "interval_secs must be greater than 0".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }
        if !self.enabled {
            return Ok(());
        }

        match self.transport {
            TransportKind::Http => {
                self.cloud_url()?;
            }
            TransportKind::MqttPublish => {
                if self.publish.device_id.trim().is_empty() {
                    return Err(SyncError::InvalidConfig(
                        "publish.device_id is required for the mqtt_publish transport".into(),
                    ));
                }
                if self.publish.qos > 2 {
                    return Err(SyncError::InvalidConfig(format!(
                        "publish.qos must be 0, 1 or 2 (got {})",
                        self.publish.qos
                    )));
                }
            }
        }
        Ok(())
    }

    /// Parsed `cloud_api_url`, with a trailing slash so relative joins keep
    /// any base path.
    pub fn cloud_url(&self) -> SyncResult<url::Url> {
        let raw = self
            .cloud_api_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| SyncError::InvalidUrl("cloud_api_url is not set".into()))?;

        let mut url = url::Url::parse(raw)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }
}
