//! # MQTT Client
//!
//! One rumqttc client shared by subscribers and publishers. The receive loop
//! owns the event loop; every inbound publish is decoded and handed to the
//! [`TopicRouter`], which spawns the handlers, so the loop goes straight back
//! to polling the socket.
//!
//! ## Receive Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  eventloop.poll()                                                       │
//! │     ├── ConnAck  ─────► connected = true, re-subscribe every pattern   │
//! │     ├── Publish  ─────► decode_payload ─► router.dispatch (no await    │
//! │     │                                      on handlers)                 │
//! │     ├── Err      ─────► connected = false, exponential backoff sleep   │
//! │     └── shutdown ─────► exit                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fieldgate_core::validation::{validate_qos, validate_topic_pattern};
use fieldgate_core::ValidationError;

use crate::error::IngestResult;
use crate::router::{decode_payload, TopicRouter};

// =============================================================================
// Settings
// =============================================================================

/// `[mqtt]` section of the gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Default QoS for publishes and subscriptions (0, 1 or 2).
    #[serde(default = "default_qos")]
    pub qos: u8,

    /// Default retain flag for publishes.
    #[serde(default = "default_retain")]
    pub retain: bool,

    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Patterns subscribed at start. Empty means the standard set under
    /// `topic_prefix`.
    #[serde(default)]
    pub topics: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "fieldgate_edge_gateway".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_qos() -> u8 {
    1
}

fn default_retain() -> bool {
    true
}

fn default_topic_prefix() -> String {
    "fieldgate".to_string()
}

impl Default for MqttSettings {
    fn default() -> Self {
        MqttSettings {
            enabled: default_enabled(),
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            qos: default_qos(),
            retain: default_retain(),
            topic_prefix: default_topic_prefix(),
            topics: Vec::new(),
        }
    }
}

impl MqttSettings {
    /// Patterns subscribed at start.
    pub fn subscriptions(&self) -> Vec<String> {
        if !self.topics.is_empty() {
            return self.topics.clone();
        }
        let prefix = &self.topic_prefix;
        vec![
            format!("{prefix}/energy/+/data"),
            format!("{prefix}/devices/+/status"),
            format!("{prefix}/discovery/+/announce"),
            format!("{prefix}/alerts/+/+"),
            format!("{prefix}/commands/+/+"),
        ]
    }

    pub fn energy_topic(&self, device_id: &str) -> String {
        format!("{}/energy/{}/data", self.topic_prefix, device_id)
    }

    pub fn status_topic(&self, device_id: &str) -> String {
        format!("{}/devices/{}/status", self.topic_prefix, device_id)
    }

    pub fn alert_topic(&self, device_id: &str, alert_type: &str) -> String {
        format!("{}/alerts/{}/{}", self.topic_prefix, device_id, alert_type)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "mqtt.host".to_string(),
            });
        }
        if self.port == 0 {
            return Err(ValidationError::OutOfRange {
                field: "mqtt.port".to_string(),
                min: 1,
                max: i64::from(u16::MAX),
            });
        }
        if self.client_id.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "mqtt.client_id".to_string(),
            });
        }
        validate_qos(self.qos)?;
        for topic in self.subscriptions() {
            validate_topic_pattern(&topic)?;
        }
        Ok(())
    }
}

/// Maps a configured QoS level onto rumqttc's enum.
pub fn qos_from_u8(value: u8) -> QoS {
    match value {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Serializes a publish payload. Strings go out verbatim, anything else as JSON.
pub fn encode_payload(payload: &Value) -> IngestResult<Vec<u8>> {
    match payload {
        Value::String(text) => Ok(text.as_bytes().to_vec()),
        other => Ok(serde_json::to_vec(other)?),
    }
}

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(60),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

// =============================================================================
// Service
// =============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct MqttStats {
    pub connected: bool,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub connection_errors: u64,
    pub handler_errors: u64,
    pub subscribed_topics: Vec<String>,
    pub registered_handlers: usize,
}

#[derive(Debug, Default)]
struct LinkState {
    connected: bool,
    messages_received: u64,
    messages_sent: u64,
    connection_errors: u64,
    topics: BTreeSet<String>,
}

/// Running MQTT client plus its receive loop.
pub struct MqttService {
    client: AsyncClient,
    settings: MqttSettings,
    router: Arc<TopicRouter>,
    state: Arc<RwLock<LinkState>>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttService {
    /// Creates the client and spawns the receive loop.
    ///
    /// Returns immediately; the broker connection is made (and remade) in
    /// the background. Configured patterns are subscribed on every ConnAck.
    pub fn start(settings: MqttSettings, router: Arc<TopicRouter>) -> IngestResult<Self> {
        settings.validate()?;

        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(5)));
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(username, password);
        }
        let (client, eventloop) = AsyncClient::new(options, 64);

        let state = Arc::new(RwLock::new(LinkState {
            topics: settings.subscriptions().into_iter().collect(),
            ..LinkState::default()
        }));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            host = %settings.host,
            port = settings.port,
            client_id = %settings.client_id,
            "Starting MQTT client"
        );
        let handle = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            Arc::clone(&router),
            Arc::clone(&state),
            qos_from_u8(settings.qos),
            shutdown_rx,
        ));

        Ok(MqttService {
            client,
            settings,
            router,
            state,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.connected
    }

    /// Adds a subscription. It is also restored after every reconnect.
    pub async fn subscribe(&self, pattern: &str) -> IngestResult<()> {
        validate_topic_pattern(pattern)?;
        self.state.write().await.topics.insert(pattern.to_string());
        self.client
            .try_subscribe(pattern, qos_from_u8(self.settings.qos))?;
        debug!(pattern = %pattern, "Subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, pattern: &str) -> IngestResult<()> {
        self.state.write().await.topics.remove(pattern);
        self.client.try_unsubscribe(pattern)?;
        debug!(pattern = %pattern, "Unsubscribed");
        Ok(())
    }

    /// Queues a publish. `qos` and `retain` fall back to the configured defaults.
    ///
    /// Never blocks on the broker: a full request queue is an error.
    pub async fn publish(
        &self,
        topic: &str,
        payload: &Value,
        qos: Option<u8>,
        retain: Option<bool>,
    ) -> IngestResult<()> {
        let qos = qos.unwrap_or(self.settings.qos);
        validate_qos(qos)?;
        let bytes = encode_payload(payload)?;

        self.client.try_publish(
            topic,
            qos_from_u8(qos),
            retain.unwrap_or(self.settings.retain),
            bytes,
        )?;
        self.state.write().await.messages_sent += 1;
        Ok(())
    }

    pub async fn publish_energy_data(&self, device_id: &str, data: &Value) -> IngestResult<()> {
        let topic = self.settings.energy_topic(device_id);
        self.publish(&topic, data, None, None).await
    }

    pub async fn publish_device_status(&self, device_id: &str, status: &Value) -> IngestResult<()> {
        let topic = self.settings.status_topic(device_id);
        self.publish(&topic, status, None, None).await
    }

    pub async fn publish_alert(
        &self,
        device_id: &str,
        alert_type: &str,
        alert: &Value,
    ) -> IngestResult<()> {
        let topic = self.settings.alert_topic(device_id, alert_type);
        self.publish(&topic, alert, None, Some(false)).await
    }

    pub async fn stats(&self) -> MqttStats {
        let state = self.state.read().await;
        MqttStats {
            connected: state.connected,
            messages_received: state.messages_received,
            messages_sent: state.messages_sent,
            connection_errors: state.connection_errors,
            handler_errors: self.router.handler_errors(),
            subscribed_topics: state.topics.iter().cloned().collect(),
            registered_handlers: self.router.handler_count().await,
        }
    }

    /// Disconnects and waits for the receive loop to exit.
    pub async fn shutdown(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "MQTT disconnect request not queued");
        }
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "MQTT receive loop panicked");
            }
        }
        self.state.write().await.connected = false;
        info!("MQTT client stopped");
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    router: Arc<TopicRouter>,
    state: Arc<RwLock<LinkState>>,
    qos: QoS,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = reconnect_backoff();

    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    state.write().await.messages_received += 1;
                    let payload = decode_payload(&publish.payload);
                    router.dispatch(&publish.topic, payload).await;
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    backoff.reset();
                    let topics: Vec<String> = {
                        let mut state = state.write().await;
                        state.connected = true;
                        state.topics.iter().cloned().collect()
                    };
                    info!(subscriptions = topics.len(), "Connected to MQTT broker");
                    for topic in topics {
                        if let Err(e) = client.try_subscribe(&topic, qos) {
                            warn!(topic = %topic, error = %e, "Failed to subscribe");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    state.write().await.connected = false;
                    warn!("Broker closed the MQTT session");
                }
                Ok(_) => {}
                Err(e) => {
                    {
                        let mut state = state.write().await;
                        state.connected = false;
                        state.connection_errors += 1;
                    }
                    let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                    warn!(error = %e, retry_in = ?delay, "MQTT connection error");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                }
            },

            _ = shutdown_rx.changed() => break,
        }
    }

    debug!("MQTT receive loop exited");
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offline_settings() -> MqttSettings {
        MqttSettings {
            host: "127.0.0.1".to_string(),
            // Nothing listens on the discard port.
            port: 9,
            topic_prefix: "fg".to_string(),
            ..MqttSettings::default()
        }
    }

    #[test]
    fn test_defaults_from_empty_section() {
        let settings: MqttSettings = serde_json::from_str("{}").unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.port, 1883);
        assert_eq!(settings.qos, 1);
        assert!(settings.retain);
        assert_eq!(settings.subscriptions().len(), 5);
        assert!(settings
            .subscriptions()
            .contains(&"fieldgate/energy/+/data".to_string()));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_topic_builders() {
        let settings = offline_settings();
        assert_eq!(settings.energy_topic("inv-1"), "fg/energy/inv-1/data");
        assert_eq!(settings.status_topic("inv-1"), "fg/devices/inv-1/status");
        assert_eq!(settings.alert_topic("inv-1", "overheat"), "fg/alerts/inv-1/overheat");
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut settings = offline_settings();
        settings.qos = 3;
        assert!(settings.validate().is_err());

        let mut settings = offline_settings();
        settings.topics = vec!["a/#/b".to_string()];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_qos_and_payload_encoding() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
        assert_eq!(qos_from_u8(9), QoS::AtLeastOnce);

        assert_eq!(encode_payload(&json!("ON")).unwrap(), b"ON".to_vec());
        assert_eq!(encode_payload(&json!({"a": 1})).unwrap(), br#"{"a":1}"#.to_vec());
    }

    #[tokio::test]
    async fn test_offline_client_queues_publishes() {
        let router = Arc::new(TopicRouter::new());
        let service = MqttService::start(offline_settings(), router).unwrap();

        service
            .publish_energy_data("inv-1", &json!({"power": 1.5}))
            .await
            .unwrap();
        service.subscribe("fg/extra/#").await.unwrap();
        assert!(service.subscribe("bad/#/x").await.is_err());

        let stats = service.stats().await;
        assert!(!stats.connected);
        assert_eq!(stats.messages_sent, 1);
        assert!(stats.subscribed_topics.contains(&"fg/extra/#".to_string()));

        service.shutdown().await;
        assert!(!service.is_connected().await);
    }
}
