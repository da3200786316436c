/*!
Transport MQTT simulé pour tester le kernel sans broker

Implémente `Publisher` : enregistre tous les messages publiés et permet de
simuler la réception d'un message via le handler enregistré, exactement
comme le ferait la boucle d'événements rumqttc.
*/

use anyhow::Result;
use foco_kernel::codec::{MessageKind, OutboundMessage};
use foco_kernel::config::{Qos, Topics};
use foco_kernel::error::TransportError;
use foco_kernel::health::ConnectionState;
use foco_kernel::transport::{LinkStatus, MessageHandler, Publisher};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub kind: MessageKind,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
}

pub struct MockTransport {
    topics: Topics,
    connected: AtomicBool,
    fail_publish: AtomicBool,
    publish_failures: AtomicU64,
    published_messages: Mutex<Vec<MockMessage>>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
}

impl MockTransport {
    /// Transport simulé, connecté par défaut.
    pub fn new(topics: Topics) -> Self {
        Self {
            topics,
            connected: AtomicBool::new(true),
            fail_publish: AtomicBool::new(false),
            publish_failures: AtomicU64::new(0),
            published_messages: Mutex::new(Vec::new()),
            handler: RwLock::new(None),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Tous les publish suivants échouent (file pleine simulée).
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Simule la réception d'un message (livré au handler comme par la boucle MQTT).
    pub fn simulate_incoming<V: AsRef<[u8]>>(&self, topic: &str, payload: V) -> Result<()> {
        let handler = self
            .handler
            .read()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no handler registered"))?;
        handler.on_message(topic, payload.as_ref());
        info!("📨 [MOCK] Simulated incoming: {topic}");
        Ok(())
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn find_messages_by_kind(&self, kind: MessageKind) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.kind == kind)
            .cloned()
            .collect()
    }

    /// Parse le dernier message d'un type donné en JSON
    pub fn get_last_json_message(&self, kind: MessageKind) -> Result<Option<Value>> {
        match self.find_messages_by_kind(kind).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().clear();
    }
}

impl Publisher for MockTransport {
    fn publish(&self, message: OutboundMessage, qos: Qos) -> Result<(), TransportError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            self.publish_failures.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::PublishFailure("mock: publish refusé".into()));
        }
        let kind = message.kind();
        let (topic, payload) = message.into_parts();
        info!("📤 [MOCK] Published {kind:?} to {topic}: {} bytes", payload.len());
        self.published_messages.lock().push(MockMessage { kind, topic, payload, qos });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn link_status(&self) -> LinkStatus {
        let connected = self.is_connected();
        LinkStatus {
            connected,
            state: if connected { ConnectionState::Connected } else { ConnectionState::Disconnected },
            client_id: "foco-kernel-mock".into(),
            broker: "mock:1883".into(),
            topics: self.topics.clone(),
            reconnects: 0,
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            subscribe_failures: 0,
        }
    }
}

/// Payloads ESP32 conformes au contrat casa/foco
pub struct DeviceMessageBuilder;

impl DeviceMessageBuilder {
    pub fn state_report(esp32_id: &str, estado: &str, timestamp: Option<OffsetDateTime>) -> Value {
        let mut report = serde_json::json!({
            "estado": estado,
            "esp32Id": esp32_id,
            "origen": "device",
        });
        if let Some(at) = timestamp {
            report["timestamp"] = Value::String(at.format(&Rfc3339).unwrap_or_default());
        }
        report
    }

    pub fn heartbeat(esp32_id: &str) -> Value {
        serde_json::json!({
            "esp32Id": esp32_id,
            "rssi": -58,
            "uptime": 3600,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foco_kernel::codec::OutboundMessage;
    use foco_kernel::models::{CommandPayload, DeviceValue, Origin};
    use time::macros::datetime;

    struct Echo(Mutex<Vec<String>>);

    impl MessageHandler for Echo {
        fn on_message(&self, topic: &str, _payload: &[u8]) {
            self.0.lock().push(topic.to_string());
        }
    }

    fn command() -> OutboundMessage {
        OutboundMessage::command(
            "casa/foco/comando",
            CommandPayload {
                estado: DeviceValue::Off,
                timestamp: datetime!(2025-01-01 00:00 UTC),
                origen: Origin::Backend,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_mock_records_publishes() {
        let mock = MockTransport::new(Topics::default());
        mock.publish(command(), Qos::AtLeastOnce).unwrap();

        let messages = mock.get_published_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "casa/foco/comando");
        assert_eq!(messages[0].qos, Qos::AtLeastOnce);

        let json = mock.get_last_json_message(MessageKind::Command).unwrap().unwrap();
        assert_eq!(json["estado"], "off");
        assert!(mock.get_last_json_message(MessageKind::StatusAck).unwrap().is_none());
    }

    #[test]
    fn test_mock_failure_mode() {
        let mock = MockTransport::new(Topics::default());
        mock.fail_publishes(true);
        assert!(mock.publish(command(), Qos::AtMostOnce).is_err());
        assert!(mock.get_published_messages().is_empty());
        assert_eq!(mock.link_status().publish_failures, 1);
    }

    #[test]
    fn test_simulate_incoming_requires_handler() {
        let mock = MockTransport::new(Topics::default());
        assert!(mock.simulate_incoming("casa/foco/heartbeat", b"{}").is_err());

        let echo = Arc::new(Echo(Mutex::new(Vec::new())));
        mock.set_handler(echo.clone());
        mock.simulate_incoming("casa/foco/heartbeat", b"{}").unwrap();
        assert_eq!(*echo.0.lock(), vec!["casa/foco/heartbeat"]);
    }

    #[test]
    fn test_message_builders() {
        let report = DeviceMessageBuilder::state_report("esp32-1", "on", Some(datetime!(2025-01-01 00:00 UTC)));
        assert_eq!(report["esp32Id"], "esp32-1");
        assert_eq!(report["timestamp"], "2025-01-01T00:00:00Z");
        assert!(DeviceMessageBuilder::state_report("esp32-1", "on", None).get("timestamp").is_none());
        assert_eq!(DeviceMessageBuilder::heartbeat("esp32-2")["esp32Id"], "esp32-2");
    }
}
