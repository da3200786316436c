/**
 * COORDINATEUR DE SYNCHRONISATION - Cerveau du pont HTTP <-> ESP32
 *
 * RÔLE :
 * Seul propriétaire du DeviceStateStore et du LivenessRegistry. Toute lecture
 * ou écriture passe par un verrou unique, qu'elle vienne d'une requête HTTP
 * ou de la boucle MQTT.
 *
 * COMMANDE : Received -> Validated -> Applied -> Dispatched.
 * - rejet TransportUnavailable / InvalidValue / InvalidTimestamp avant toute mutation
 * - un échec de publish est loggé, l'état appliqué n'est jamais annulé
 * - aucune attente d'acquittement : la confirmation de l'ESP32 arrive plus tard
 *   comme un rapport d'état indépendant
 *
 * ENTRÉE MQTT :
 * - estado    -> store.apply_device_report + statusAck (toujours, même si périmé)
 * - heartbeat -> liveness.record_heartbeat(now), pas d'ack
 * - payload invalide / topic inconnu -> loggé et jeté
 */

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::codec::{decode_inbound, InboundMessage, OutboundMessage};
use crate::config::{KernelConfig, Qos, Topics};
use crate::error::{CodecError, CommandError};
use crate::liveness::{HeartbeatOutcome, LivenessRegistry, LivenessStats};
use crate::models::{parse_iso_timestamp, CommandPayload, DeviceState, DeviceValue, Origin, StatusAckPayload};
use crate::state::{new_state, Shared};
use crate::store::{DeviceStateStore, ReportOutcome, StoreStats};
use crate::transport::{LinkStatus, MessageHandler, Publisher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub device: String,
    pub value: String,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReceipt {
    pub message: String,
    pub state: DeviceState,
    pub live_devices: usize,
    pub transport_connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: DeviceState,
    pub live_devices: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationStats {
    #[serde(flatten)]
    pub store: StoreStats,
    #[serde(flatten)]
    pub liveness: LivenessStats,
    pub decode_failures: u64,
    pub unknown_topics: u64,
}

#[derive(Debug, Clone)]
pub struct Statistics {
    pub state: DeviceState,
    pub active_devices: Vec<String>,
    pub link: LinkStatus,
    pub reconciliation: ReconciliationStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub connected: bool,
    pub broker: String,
    pub live_devices: usize,
    pub value: DeviceValue,
}

/// Issue d'un message entrant, exposée pour l'observabilité et les tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    ReportApplied,
    ReportStale,
    Heartbeat(HeartbeatOutcome),
    Dropped,
}

struct SyncState {
    store: DeviceStateStore,
    liveness: LivenessRegistry,
    decode_failures: u64,
    unknown_topics: u64,
}

pub struct Coordinator {
    state: Shared<SyncState>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    topics: Topics,
    command_qos: Qos,
    ack_qos: Qos,
    server_name: String,
}

/// RFC 3339 d'abord (format de `toISOString`), ISO-8601 générique sinon.
pub fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, CommandError> {
    parse_iso_timestamp(raw).ok_or_else(|| CommandError::InvalidTimestamp(raw.to_string()))
}

fn command_message(value: DeviceValue) -> String {
    match value {
        DeviceValue::On => "Foco encendido".to_string(),
        DeviceValue::Off => "Foco apagado".to_string(),
    }
}

impl Coordinator {
    pub fn new(cfg: &KernelConfig, publisher: Arc<dyn Publisher>, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        let window = time::Duration::seconds(i64::try_from(cfg.liveness.window_secs).unwrap_or(i64::MAX));
        Self {
            state: new_state(SyncState {
                store: DeviceStateStore::new(started_at),
                liveness: LivenessRegistry::new(window),
                decode_failures: 0,
                unknown_topics: 0,
            }),
            publisher,
            clock,
            topics: cfg.topics.clone(),
            command_qos: cfg.mqtt.command_qos,
            ack_qos: cfg.mqtt.ack_qos,
            server_name: cfg.mqtt.server_name.clone(),
        }
    }

    pub fn execute_command(&self, request: CommandRequest) -> Result<CommandReceipt, CommandError> {
        info!("[coordinator] commande reçue pour '{}': {}", request.device, request.value);

        if !self.publisher.is_connected() {
            warn!("[coordinator] commande rejetée : transport MQTT indisponible");
            return Err(CommandError::TransportUnavailable);
        }
        let value: DeviceValue = request.value.parse().map_err(CommandError::InvalidValue)?;
        let now = self.clock.now();
        let at = match request.timestamp.as_deref().filter(|raw| !raw.is_empty()) {
            Some(raw) => parse_timestamp(raw)?,
            None => now,
        };

        let mut sync = self.state.lock();
        let state = sync.store.apply_command(value, at);
        let live_devices = sync.liveness.count(now);
        // publish sous verrou : l'ordre des commandes publiées suit l'ordre d'application
        self.publish(OutboundMessage::command(
            &self.topics.command,
            CommandPayload { estado: value, timestamp: at, origen: Origin::Backend },
        ), self.command_qos);
        drop(sync);

        Ok(CommandReceipt {
            message: command_message(value),
            state,
            live_devices,
            transport_connected: self.publisher.is_connected(),
        })
    }

    /// Commande directe de test : publiée sans toucher à l'état autoritaire.
    pub fn send_test_command(&self, value: &str) -> Result<OffsetDateTime, CommandError> {
        let value: DeviceValue = value.parse().map_err(CommandError::InvalidValue)?;
        let now = self.clock.now();
        self.publish(OutboundMessage::command(
            &self.topics.command,
            CommandPayload { estado: value, timestamp: now, origen: Origin::Backend },
        ), self.command_qos);
        Ok(now)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let now = self.clock.now();
        let mut sync = self.state.lock();
        StateSnapshot {
            state: sync.store.current(),
            live_devices: sync.liveness.count(now),
        }
    }

    pub fn statistics(&self) -> Statistics {
        let now = self.clock.now();
        let (state, active_devices, reconciliation) = {
            let mut sync = self.state.lock();
            let active = sync.liveness.active_devices(now);
            let stats = ReconciliationStats {
                store: sync.store.stats(),
                liveness: sync.liveness.stats(),
                decode_failures: sync.decode_failures,
                unknown_topics: sync.unknown_topics,
            };
            (sync.store.current(), active, stats)
        };
        Statistics {
            state,
            active_devices,
            link: self.publisher.link_status(),
            reconciliation,
        }
    }

    pub fn health(&self) -> HealthReport {
        let snapshot = self.snapshot();
        let link = self.publisher.link_status();
        HealthReport {
            connected: link.connected,
            broker: link.broker,
            live_devices: snapshot.live_devices,
            value: snapshot.state.value,
        }
    }

    pub fn is_transport_connected(&self) -> bool {
        self.publisher.is_connected()
    }

    pub fn handle_inbound(&self, topic: &str, payload: &[u8]) -> InboundOutcome {
        let Some(kind) = self.topics.kind_of(topic) else {
            debug!("[coordinator] topic inconnu '{topic}', message ignoré");
            self.state.lock().unknown_topics += 1;
            return InboundOutcome::Dropped;
        };
        let message = match decode_inbound(kind, payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("[coordinator] message invalide sur '{topic}': {e}");
                self.state.lock().decode_failures += 1;
                return InboundOutcome::Dropped;
            }
        };

        let now = self.clock.now();
        match message {
            InboundMessage::StateReport(report) => {
                let at = report.timestamp.unwrap_or(now);
                let outcome = self.state.lock().store.apply_device_report(report.estado, at);
                info!(
                    "[coordinator] estado {} depuis ESP32 {} ({:?})",
                    report.estado, report.device_id, outcome
                );

                let ack = StatusAckPayload {
                    mensaje: format!("Estado {} confirmado desde {}", report.estado, report.device_id),
                    timestamp: now,
                    servidor: self.server_name.clone(),
                    origen: Origin::Backend,
                };
                self.publish(OutboundMessage::status_ack(&self.topics.status_ack, ack), self.ack_qos);

                match outcome {
                    ReportOutcome::Applied => InboundOutcome::ReportApplied,
                    ReportOutcome::Stale => InboundOutcome::ReportStale,
                }
            }
            InboundMessage::Heartbeat(heartbeat) => {
                let outcome = self.state.lock().liveness.record_heartbeat(&heartbeat.device_id, now);
                match outcome {
                    HeartbeatOutcome::Registered => info!("[coordinator] ESP32 activo: {}", heartbeat.device_id),
                    _ => debug!("[coordinator] heartbeat {} ({outcome:?})", heartbeat.device_id),
                }
                InboundOutcome::Heartbeat(outcome)
            }
        }
    }

    pub fn sweep_liveness(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut sync = self.state.lock();
        let window = sync.liveness.window();
        sync.liveness.sweep_stale(now, window)
    }

    fn publish(&self, message: Result<OutboundMessage, CodecError>, qos: Qos) {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                error!("[coordinator] encodage impossible: {e}");
                return;
            }
        };
        let kind = message.kind();
        let topic = message.topic().to_string();
        match self.publisher.publish(message, qos) {
            Ok(()) => debug!("[coordinator] {kind:?} envoyé sur '{topic}'"),
            Err(e) => error!("[coordinator] {kind:?} vers '{topic}' non envoyé: {e}"),
        }
    }
}

impl MessageHandler for Coordinator {
    fn on_message(&self, topic: &str, payload: &[u8]) {
        self.handle_inbound(topic, payload);
    }
}

/// Sweep périodique du registre, en plus du sweep paresseux à la lecture.
pub fn spawn_liveness_sweeper(coordinator: Arc<Coordinator>, every: Duration) -> JoinHandle<()> {
    let every = every.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let evicted = coordinator.sweep_liveness();
            if !evicted.is_empty() {
                info!("[coordinator] {} ESP32 expirés: {:?}", evicted.len(), evicted);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codec::MessageKind;
    use crate::error::TransportError;
    use crate::health::ConnectionState;
    use crate::models::Source;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2025-06-01 12:00 UTC);

    #[derive(Default)]
    struct RecordingPublisher {
        connected: AtomicBool,
        failing: AtomicBool,
        sent: Mutex<Vec<(MessageKind, String, serde_json::Value)>>,
    }

    impl RecordingPublisher {
        fn kinds(&self) -> Vec<MessageKind> {
            self.sent.lock().iter().map(|(kind, _, _)| *kind).collect()
        }

        fn last(&self) -> serde_json::Value {
            self.sent.lock().last().map(|(_, _, json)| json.clone()).unwrap_or_default()
        }
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, message: OutboundMessage, _qos: Qos) -> Result<(), TransportError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(TransportError::PublishFailure("queue full".into()));
            }
            let kind = message.kind();
            let (topic, payload) = message.into_parts();
            let json = serde_json::from_slice(&payload).unwrap();
            self.sent.lock().push((kind, topic, json));
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
                client_id: "test".into(),
                broker: "localhost:1883".into(),
                topics: Topics::default(),
                reconnects: 0,
                publish_failures: 0,
                subscribe_failures: 0,
            }
        }
    }

    fn setup() -> (Coordinator, Arc<RecordingPublisher>, Arc<ManualClock>) {
        let publisher = Arc::new(RecordingPublisher::default());
        publisher.connected.store(true, Ordering::SeqCst);
        let clock = Arc::new(ManualClock::new(T0 - time::Duration::minutes(1)));
        let coordinator = Coordinator::new(&KernelConfig::default(), publisher.clone(), clock.clone());
        clock.set(T0);
        (coordinator, publisher, clock)
    }

    fn command(value: &str, timestamp: Option<&str>) -> CommandRequest {
        CommandRequest {
            device: "foco".into(),
            value: value.into(),
            timestamp: timestamp.map(str::to_string),
        }
    }

    #[test]
    fn command_applies_then_publishes() {
        let (coordinator, publisher, _) = setup();
        let receipt = coordinator.execute_command(command("on", None)).unwrap();

        assert_eq!(receipt.message, "Foco encendido");
        assert_eq!(receipt.state, DeviceState { value: DeviceValue::On, updated_at: T0, source: Source::Command });
        assert!(receipt.transport_connected);
        assert_eq!(publisher.kinds(), vec![MessageKind::Command]);
        assert_eq!(publisher.last()["estado"], "on");
        assert_eq!(publisher.last()["origen"], "backend");
        assert_eq!(coordinator.snapshot().state.value, DeviceValue::On);
    }

    #[test]
    fn disconnected_transport_rejects_without_mutation() {
        let (coordinator, publisher, _) = setup();
        publisher.connected.store(false, Ordering::SeqCst);
        let before = coordinator.snapshot();

        assert_eq!(
            coordinator.execute_command(command("on", None)),
            Err(CommandError::TransportUnavailable)
        );
        assert_eq!(coordinator.snapshot(), before);
        assert!(publisher.kinds().is_empty());
    }

    #[test]
    fn invalid_value_and_timestamp_are_rejected() {
        let (coordinator, publisher, _) = setup();
        assert_eq!(
            coordinator.execute_command(command("dim", None)),
            Err(CommandError::InvalidValue("dim".into()))
        );
        assert_eq!(
            coordinator.execute_command(command("on", Some("mañana"))),
            Err(CommandError::InvalidTimestamp("mañana".into()))
        );
        assert_eq!(coordinator.snapshot().state.value, DeviceValue::Off);
        assert!(publisher.kinds().is_empty());
    }

    #[test]
    fn caller_timestamp_is_used_and_echoed() {
        let (coordinator, publisher, _) = setup();
        let receipt = coordinator
            .execute_command(command("off", Some("2025-06-01T12:00:30.000Z")))
            .unwrap();
        assert_eq!(receipt.state.updated_at, datetime!(2025-06-01 12:00:30 UTC));
        assert_eq!(publisher.last()["timestamp"], "2025-06-01T12:00:30Z");
    }

    #[test]
    fn publish_failure_keeps_the_applied_state() {
        let (coordinator, publisher, _) = setup();
        publisher.failing.store(true, Ordering::SeqCst);
        let receipt = coordinator.execute_command(command("on", None)).unwrap();
        assert_eq!(receipt.state.value, DeviceValue::On);
        assert_eq!(coordinator.snapshot().state.value, DeviceValue::On);
    }

    #[test]
    fn stale_report_is_acked_but_ignored() {
        let (coordinator, publisher, clock) = setup();
        coordinator.execute_command(command("on", None)).unwrap();

        clock.advance(time::Duration::seconds(1));
        let outcome = coordinator.handle_inbound(
            "casa/foco/estado",
            br#"{"estado":"off","timestamp":"2025-06-01T11:59:55Z","esp32Id":"esp32-1"}"#,
        );
        assert_eq!(outcome, InboundOutcome::ReportStale);
        assert_eq!(coordinator.snapshot().state.value, DeviceValue::On);
        assert_eq!(publisher.kinds(), vec![MessageKind::Command, MessageKind::StatusAck]);
        assert_eq!(publisher.last()["mensaje"], "Estado off confirmado desde esp32-1");
        assert_eq!(publisher.last()["servidor"], "foco-kernel");

        clock.advance(time::Duration::seconds(1));
        let outcome = coordinator.handle_inbound(
            "casa/foco/estado",
            br#"{"estado":"off","timestamp":"2025-06-01T12:00:02Z","esp32Id":"esp32-1"}"#,
        );
        assert_eq!(outcome, InboundOutcome::ReportApplied);
        let state = coordinator.snapshot().state;
        assert_eq!(state.value, DeviceValue::Off);
        assert_eq!(state.source, Source::DeviceReport);
        assert_eq!(state.updated_at, datetime!(2025-06-01 12:00:02 UTC));

        let stats = coordinator.statistics().reconciliation;
        assert_eq!(stats.store.reports_stale, 1);
        assert_eq!(stats.store.reports_applied, 1);
    }

    #[test]
    fn report_without_timestamp_is_stamped_now() {
        let (coordinator, _, clock) = setup();
        clock.advance(time::Duration::seconds(7));
        coordinator.handle_inbound("casa/foco/estado", br#"{"estado":"on"}"#);
        let state = coordinator.snapshot().state;
        assert_eq!(state.value, DeviceValue::On);
        assert_eq!(state.updated_at, T0 + time::Duration::seconds(7));
    }

    #[test]
    fn heartbeats_feed_liveness_without_ack() {
        let (coordinator, publisher, clock) = setup();
        assert_eq!(
            coordinator.handle_inbound("casa/foco/heartbeat", br#"{"esp32Id":"esp32-1","rssi":-70}"#),
            InboundOutcome::Heartbeat(HeartbeatOutcome::Registered)
        );
        assert_eq!(coordinator.snapshot().live_devices, 1);
        assert!(publisher.kinds().is_empty());

        clock.advance(time::Duration::seconds(301));
        assert_eq!(coordinator.snapshot().live_devices, 0);
    }

    #[test]
    fn garbage_is_dropped_and_counted() {
        let (coordinator, publisher, _) = setup();
        assert_eq!(coordinator.handle_inbound("casa/foco/estado", b"{oops"), InboundOutcome::Dropped);
        assert_eq!(coordinator.handle_inbound("casa/foco/heartbeat", b"{}"), InboundOutcome::Dropped);
        assert_eq!(coordinator.handle_inbound("otra/cosa", b"{}"), InboundOutcome::Dropped);

        // le message suivant est traité normalement
        assert_eq!(
            coordinator.handle_inbound("casa/foco/estado", br#"{"estado":"on"}"#),
            InboundOutcome::ReportApplied
        );
        let stats = coordinator.statistics().reconciliation;
        assert_eq!(stats.decode_failures, 2);
        assert_eq!(stats.unknown_topics, 1);
        assert_eq!(publisher.kinds(), vec![MessageKind::StatusAck]);
    }

    #[test]
    fn test_command_does_not_touch_state() {
        let (coordinator, publisher, _) = setup();
        coordinator.send_test_command("on").unwrap();
        assert_eq!(coordinator.snapshot().state.value, DeviceValue::Off);
        assert_eq!(publisher.last()["estado"], "on");
        assert!(matches!(coordinator.send_test_command("blink"), Err(CommandError::InvalidValue(_))));
    }

    #[test]
    fn concurrent_writers_never_move_updated_at_back() {
        let (coordinator, _, _) = setup();
        std::thread::scope(|scope| {
            for worker in 0..4 {
                let coordinator = &coordinator;
                scope.spawn(move || {
                    for i in 0..50 {
                        let before = coordinator.snapshot().state.updated_at;
                        if worker % 2 == 0 {
                            let value = if i % 2 == 0 { "on" } else { "off" };
                            coordinator.execute_command(command(value, None)).unwrap();
                        } else {
                            let raw = format!(r#"{{"estado":"on","timestamp":"2025-06-01T12:00:{:02}Z"}}"#, i % 60);
                            coordinator.handle_inbound("casa/foco/estado", raw.as_bytes());
                        }
                        assert!(coordinator.snapshot().state.updated_at >= before);
                    }
                });
            }
        });
        let stats = coordinator.statistics().reconciliation;
        assert_eq!(stats.store.commands_applied, 100);
        assert_eq!(stats.store.reports_applied + stats.store.reports_stale, 100);
    }

    #[test]
    fn parses_iso_timestamps_to_utc() {
        assert_eq!(
            parse_timestamp("2025-06-01T14:00:00+02:00").unwrap(),
            datetime!(2025-06-01 12:00 UTC)
        );
        assert!(parse_timestamp("01/06/2025").is_err());
    }

    #[test]
    fn offsetless_command_timestamp_is_utc() {
        let (coordinator, publisher, _) = setup();
        let receipt = coordinator
            .execute_command(command("on", Some("2025-06-01T12:00:00.000")))
            .unwrap();
        assert_eq!(receipt.state.updated_at, T0);
        assert_eq!(publisher.last()["timestamp"], "2025-06-01T12:00:00Z");
        assert_eq!(parse_timestamp("2025-06-01T12:00:00").unwrap(), T0);
    }

    #[test]
    fn report_with_unreadable_timestamp_is_still_acked() {
        let (coordinator, publisher, clock) = setup();
        clock.advance(time::Duration::seconds(3));
        assert_eq!(
            coordinator.handle_inbound(
                "casa/foco/estado",
                br#"{"estado":"on","timestamp":"2025-06-01T12:00:05","esp32Id":"esp32-1"}"#,
            ),
            InboundOutcome::ReportApplied
        );
        assert_eq!(coordinator.snapshot().state.updated_at, datetime!(2025-06-01 12:00:05 UTC));

        // millis depuis le boot d'un ESP32 sans NTP : estampillé à la réception
        clock.advance(time::Duration::seconds(10));
        assert_eq!(
            coordinator.handle_inbound(
                "casa/foco/estado",
                br#"{"estado":"off","timestamp":98765,"esp32Id":"esp32-1"}"#,
            ),
            InboundOutcome::ReportApplied
        );
        let state = coordinator.snapshot().state;
        assert_eq!(state.value, DeviceValue::Off);
        assert_eq!(state.updated_at, T0 + time::Duration::seconds(13));
        assert_eq!(publisher.kinds(), vec![MessageKind::StatusAck, MessageKind::StatusAck]);
        assert_eq!(coordinator.statistics().reconciliation.decode_failures, 0);
    }

    #[test]
    fn huge_window_does_not_evict_everything() {
        let publisher = Arc::new(RecordingPublisher::default());
        let clock = Arc::new(ManualClock::new(T0));
        let mut cfg = KernelConfig::default();
        cfg.liveness.window_secs = u64::MAX;
        let coordinator = Coordinator::new(&cfg, publisher, clock.clone());

        coordinator.handle_inbound("casa/foco/heartbeat", br#"{"esp32Id":"esp32-1"}"#);
        clock.advance(time::Duration::days(365));
        assert_eq!(coordinator.snapshot().live_devices, 1);
    }
}
