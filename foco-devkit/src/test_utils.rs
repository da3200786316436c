/*!
Test Harness pour le kernel foco

Assemble un coordinateur complet autour du transport simulé et d'une
horloge manuelle : les scénarios de skew et d'expiration se rejouent
sans broker ni attente réelle.
*/

use crate::mqtt_stub::{DeviceMessageBuilder, MockTransport};
use anyhow::Result;
use foco_kernel::clock::ManualClock;
use foco_kernel::codec::MessageKind;
use foco_kernel::config::KernelConfig;
use foco_kernel::coordinator::{CommandReceipt, CommandRequest, Coordinator, InboundOutcome};
use foco_kernel::error::CommandError;
use foco_kernel::http::AppState;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use time::macros::datetime;
use time::OffsetDateTime;
use tokio::time::{sleep, timeout};

/// Instant de démarrage par défaut des scénarios
pub const BOOT: OffsetDateTime = datetime!(2025-06-01 12:00 UTC);

pub struct TestHarness {
    pub config: KernelConfig,
    pub transport: Arc<MockTransport>,
    pub clock: Arc<ManualClock>,
    pub coordinator: Arc<Coordinator>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("foco_kernel=debug,foco_devkit=debug"))
            .with_test_writer()
            .try_init();

        let transport = Arc::new(MockTransport::new(config.topics.clone()));
        let clock = Arc::new(ManualClock::new(BOOT));
        let coordinator = Arc::new(Coordinator::new(&config, transport.clone(), clock.clone()));
        transport.set_handler(coordinator.clone());

        Self { config, transport, clock, coordinator }
    }

    pub fn app_state(&self) -> AppState {
        AppState { coordinator: Arc::clone(&self.coordinator) }
    }

    pub fn advance(&self, seconds: i64) {
        self.clock.advance(time::Duration::seconds(seconds));
    }

    pub fn now(&self) -> OffsetDateTime {
        use foco_kernel::clock::Clock;
        self.clock.now()
    }

    pub fn command(&self, estado: &str, timestamp: Option<&str>) -> Result<CommandReceipt, CommandError> {
        self.coordinator.execute_command(CommandRequest {
            device: "foco".into(),
            value: estado.into(),
            timestamp: timestamp.map(str::to_string),
        })
    }

    pub fn send_heartbeat(&self, esp32_id: &str) -> Result<InboundOutcome> {
        let payload = serde_json::to_vec(&DeviceMessageBuilder::heartbeat(esp32_id))?;
        Ok(self.coordinator.handle_inbound(&self.config.topics.heartbeat, &payload))
    }

    pub fn send_state_report(
        &self,
        esp32_id: &str,
        estado: &str,
        timestamp: Option<OffsetDateTime>,
    ) -> Result<InboundOutcome> {
        let payload = serde_json::to_vec(&DeviceMessageBuilder::state_report(esp32_id, estado, timestamp))?;
        Ok(self.coordinator.handle_inbound(&self.config.topics.state_report, &payload))
    }

    /// Passe par le handler enregistré sur le transport, comme la boucle MQTT.
    pub fn deliver_raw(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.transport.simulate_incoming(topic, payload)
    }

    pub fn last_published(&self, kind: MessageKind) -> Result<Option<Value>> {
        self.transport.get_last_json_message(kind)
    }

    pub fn published_count(&self, kind: MessageKind) -> usize {
        self.transport.find_messages_by_kind(kind).len()
    }

    /// Attend qu'au moins `count` messages d'un type aient été publiés.
    pub async fn wait_for_messages(&self, kind: MessageKind, count: usize, timeout_ms: u64) -> Result<()> {
        timeout(Duration::from_millis(timeout_ms), async {
            while self.published_count(kind) < count {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "expected {count} {kind:?} messages, got {} after {timeout_ms}ms",
                self.published_count(kind)
            )
        })
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
