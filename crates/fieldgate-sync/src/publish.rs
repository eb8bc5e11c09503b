//! # Message-Publish Transport
//!
//! One MQTT message per batch on
//! `devices/{device_id}/messages/events/{properties}`, where the properties
//! are URL-encoded `table`, `record_count`, content type and encoding.
//!
//! There is no conflict channel. A batch counts as delivered only once the
//! broker acknowledges it (`PUBACK` for QoS 1, `PUBCOMP` for QoS 2); a QoS 0
//! batch counts once it is written to the socket. No acknowledgement within
//! `request_timeout_secs` fails the batch.
//!
//! ```text
//!  send()                         event loop task
//!  ──────                         ───────────────
//!  slot.waiter = tx
//!  client.publish ───────────────► Outgoing::Publish(pkid)  → slot.pkid = pkid
//!                                  Incoming::PubAck(pkid)   → tx.send(())
//!  rx.await ◄──────────────────────┘
//! ```
//!
//! Sends are serialized so the next outgoing publish is always the waiting
//! one. A publish replayed by the client after a reconnect can still be
//! taken for it; the batch then resolves on the replay's acknowledgement.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::transport::{SyncEnvelope, Transport, TransportAck};

/// Topic for one batch of `table` carrying `record_count` records.
pub fn event_topic(device_id: &str, table: &str, record_count: usize) -> String {
    let properties = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("table", table)
        .append_pair("record_count", &record_count.to_string())
        .append_pair("$.ct", "application/json")
        .append_pair("$.ce", "utf-8")
        .finish();
    format!("devices/{device_id}/messages/events/{properties}")
}

/// Envelope plus the publishing device's id.
pub fn event_payload(device_id: &str, envelope: &SyncEnvelope) -> SyncResult<Vec<u8>> {
    let mut payload = serde_json::to_value(envelope)?;
    if let Value::Object(map) = &mut payload {
        map.insert("device_id".to_string(), Value::String(device_id.to_string()));
    }
    Ok(serde_json::to_vec(&payload)?)
}

fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// The one publish currently waiting for its acknowledgement.
#[derive(Default)]
struct AckSlot {
    waiter: Option<oneshot::Sender<()>>,
    pkid: Option<u16>,
}

impl AckSlot {
    fn on_outgoing(&mut self, pkid: u16, qos: QoS) {
        if self.waiter.is_none() || self.pkid.is_some() {
            return;
        }
        if qos == QoS::AtMostOnce {
            self.complete();
        } else {
            self.pkid = Some(pkid);
        }
    }

    fn on_ack(&mut self, pkid: u16) {
        if self.pkid == Some(pkid) {
            self.complete();
        }
    }

    fn complete(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(());
        }
    }
}

pub struct MqttPublishTransport {
    client: AsyncClient,
    device_id: String,
    qos: QoS,
    timeout: Duration,
    acks: Arc<Mutex<AckSlot>>,
    send_turn: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttPublishTransport {
    /// Creates the client and spawns the task driving its event loop.
    pub fn start(settings: &SyncSettings) -> SyncResult<Self> {
        let publish = &settings.publish;
        if publish.device_id.trim().is_empty() {
            return Err(SyncError::InvalidConfig("publish.device_id is required".into()));
        }

        let mut options = MqttOptions::new(&publish.device_id, &publish.host, publish.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&publish.username, &publish.password) {
            options.set_credentials(username, password);
        }
        let (client, mut eventloop) = AsyncClient::new(options, 16);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let qos = qos(publish.qos);
        let acks = Arc::new(Mutex::new(AckSlot::default()));
        let loop_acks = Arc::clone(&acks);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => info!("Sync publish link connected"),
                        Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                            loop_acks.lock().await.on_outgoing(pkid, qos);
                        }
                        Ok(Event::Incoming(Packet::PubAck(ack))) => {
                            debug!(pkid = ack.pkid, "Sync batch acknowledged");
                            loop_acks.lock().await.on_ack(ack.pkid);
                        }
                        Ok(Event::Incoming(Packet::PubComp(comp))) => {
                            debug!(pkid = comp.pkid, "Sync batch completed");
                            loop_acks.lock().await.on_ack(comp.pkid);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "Sync publish link error");
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                                _ = shutdown_rx.changed() => break,
                            }
                        }
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        info!(
            host = %publish.host,
            port = publish.port,
            device_id = %publish.device_id,
            "Sync publish transport started"
        );
        Ok(MqttPublishTransport {
            client,
            device_id: publish.device_id.clone(),
            qos,
            timeout: settings.request_timeout(),
            acks,
            send_turn: Mutex::new(()),
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    async fn publish_acked(
        &self,
        topic: String,
        payload: Vec<u8>,
        ack: oneshot::Receiver<()>,
    ) -> SyncResult<()> {
        self.client.publish(topic, self.qos, false, payload).await?;
        ack.await
            .map_err(|_| SyncError::PublishFailed("publish link closed before acknowledgement".into()))
    }
}

#[async_trait]
impl Transport for MqttPublishTransport {
    fn name(&self) -> &'static str {
        "mqtt_publish"
    }

    async fn send(&self, envelope: &SyncEnvelope) -> SyncResult<TransportAck> {
        let topic = event_topic(
            &self.device_id,
            envelope.table.as_str(),
            envelope.record_count(),
        );
        let payload = event_payload(&self.device_id, envelope)?;

        let _turn = self.send_turn.lock().await;
        let (ack_tx, ack_rx) = oneshot::channel();
        *self.acks.lock().await = AckSlot {
            waiter: Some(ack_tx),
            pkid: None,
        };

        let outcome = tokio::time::timeout(self.timeout, self.publish_acked(topic, payload, ack_rx)).await;
        *self.acks.lock().await = AckSlot::default();

        match outcome {
            Ok(Ok(())) => Ok(TransportAck::Delivered),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SyncError::RequestTimeout),
        }
    }

    async fn close(&self) {
        let _ = self.client.try_disconnect();
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PublishSettings, TransportKind};
    use fieldgate_core::SyncTable;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_event_topic_encodes_properties() {
        let topic = event_topic("edge-01", "energy_readings", 2);
        assert_eq!(
            topic,
            "devices/edge-01/messages/events/table=energy_readings&record_count=2&%24.ct=application%2Fjson&%24.ce=utf-8"
        );
    }

    #[test]
    fn test_event_payload_adds_device_id() {
        let envelope = SyncEnvelope::new(SyncTable::Alerts, vec![json!({"id": "a1"})]);
        let payload: Value = serde_json::from_slice(&event_payload("edge-01", &envelope).unwrap()).unwrap();
        assert_eq!(payload["device_id"], "edge-01");
        assert_eq!(payload["table"], "alerts");
        assert_eq!(payload["data"][0]["id"], "a1");
    }

    fn settings_for(port: u16) -> SyncSettings {
        SyncSettings {
            transport: TransportKind::MqttPublish,
            request_timeout_secs: 1,
            publish: PublishSettings {
                host: "127.0.0.1".into(),
                port,
                device_id: "edge-01".into(),
                ..PublishSettings::default()
            },
            ..SyncSettings::default()
        }
    }

    async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = stream.read_u8().await.ok()?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.ok()?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.ok()?;
        Some((header, body))
    }

    /// Single-connection MQTT 3.1.1 broker. Counts publishes and answers
    /// them with PUBACK when `ack` is set.
    async fn spawn_broker(ack: bool) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            while let Some((header, body)) = read_packet(&mut stream).await {
                match header >> 4 {
                    1 => stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap(),
                    3 => {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                        let pkid = [body[2 + topic_len], body[3 + topic_len]];
                        if ack {
                            stream.write_all(&[0x40, 0x02, pkid[0], pkid[1]]).await.unwrap();
                        }
                    }
                    12 => stream.write_all(&[0xD0, 0x00]).await.unwrap(),
                    14 => break,
                    _ => {}
                }
            }
        });
        (port, received)
    }

    #[tokio::test]
    async fn test_publish_delivered_after_puback() {
        let (port, received) = spawn_broker(true).await;
        let transport = MqttPublishTransport::start(&settings_for(port)).unwrap();

        let envelope = SyncEnvelope::new(SyncTable::Alerts, vec![json!({"id": "a1"})]);
        assert_eq!(transport.send(&envelope).await.unwrap(), TransportAck::Delivered);
        assert_eq!(transport.send(&envelope).await.unwrap(), TransportAck::Delivered);
        assert_eq!(received.load(Ordering::SeqCst), 2);
        transport.close().await;
    }

    #[tokio::test]
    async fn test_unacknowledged_publish_fails() {
        let (port, received) = spawn_broker(false).await;
        let transport = MqttPublishTransport::start(&settings_for(port)).unwrap();

        let envelope = SyncEnvelope::new(SyncTable::Alerts, vec![json!({"id": "a1"})]);
        let result = transport.send(&envelope).await;
        assert!(matches!(result, Err(SyncError::RequestTimeout)));
        assert_eq!(received.load(Ordering::SeqCst), 1);
        transport.close().await;
    }

    #[tokio::test]
    async fn test_broker_down_fails_batch() {
        let transport = MqttPublishTransport::start(&settings_for(9)).unwrap();

        let envelope = SyncEnvelope::new(SyncTable::Alerts, vec![json!({"id": "a1"})]);
        let result = transport.send(&envelope).await;
        assert!(matches!(result, Err(SyncError::RequestTimeout)));
        transport.close().await;
    }

    #[test]
    fn test_ack_slot_matches_pkid() {
        let (tx, mut rx) = oneshot::channel();
        let mut slot = AckSlot {
            waiter: Some(tx),
            pkid: None,
        };
        slot.on_ack(7);
        slot.on_outgoing(3, QoS::AtLeastOnce);
        slot.on_outgoing(4, QoS::AtLeastOnce);
        assert_eq!(slot.pkid, Some(3));
        slot.on_ack(4);
        assert!(rx.try_recv().is_err());
        slot.on_ack(3);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_start_requires_device_id() {
        let settings = SyncSettings {
            transport: TransportKind::MqttPublish,
            ..SyncSettings::default()
        };
        assert!(MqttPublishTransport::start(&settings).is_err());
    }
}
