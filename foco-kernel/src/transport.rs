/**
 * TRANSPORT MQTT - Cycle de vie de la connexion au broker
 *
 * RÔLE :
 * Possède le client rumqttc et sa boucle d'événements : connexion avec
 * credentials, réabonnement à chaque ConnAck, publish non bloquant,
 * livraison de chaque message entrant à un handler unique.
 *
 * FONCTIONNEMENT :
 * - câblage en deux temps : new() puis set_handler() puis start()
 * - connexion bornée par connect_timeout, échec loggé sans arrêter le process
 * - reconnexion infinie, pause fixe reconnect_period entre deux tentatives
 * - le transport ne touche jamais à l'état du foco, il ne fait que livrer
 */

use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::OutboundMessage;
use crate::config::{MqttConf, Qos, Topics};
use crate::error::TransportError;
use crate::health::{ConnectionState, HealthTracker};

/// Point de dispatch unique : reçoit tous les messages, quel que soit le topic.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, topic: &str, payload: &[u8]);
}

/// Côté sortant du transport, tel que le voit le coordinateur.
pub trait Publisher: Send + Sync {
    /// Fire-and-forget : Ok signifie « mis en file », pas « livré ».
    fn publish(&self, message: OutboundMessage, qos: Qos) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    fn link_status(&self) -> LinkStatus;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
    pub connected: bool,
    pub state: ConnectionState,
    pub client_id: String,
    pub broker: String,
    pub topics: Topics,
    pub reconnects: u32,
    pub publish_failures: u64,
    pub subscribe_failures: u64,
}

// Partagée entre publish et subscribe : garde de la marge pour les abonnements du ConnAck.
const REQUEST_CAPACITY: usize = 64;

/// Suite à donner par la boucle après un poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopStep {
    Continue,
    Subscribed(usize),
    Backoff,
}

pub struct MqttTransport {
    client: AsyncClient,
    eventloop: Mutex<Option<EventLoop>>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    health: HealthTracker,
    client_id: String,
    broker: String,
    topics: Topics,
    reconnect_period: Duration,
    connect_timeout: Duration,
}

pub fn generate_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("foco-kernel-{}", &id[..8])
}

fn build_options(cfg: &MqttConf, client_id: &str) -> MqttOptions {
    let mut opts = MqttOptions::new(client_id, cfg.host.as_str(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
    opts.set_clean_session(true);
    // connexion anonyme si pas d'utilisateur
    if let Some(user) = &cfg.username {
        opts.set_credentials(user.as_str(), cfg.password.clone().unwrap_or_default());
    }
    if cfg.use_tls() {
        opts.set_transport(Transport::tls_with_default_config());
    }
    opts
}

impl MqttTransport {
    pub fn new(cfg: &MqttConf, topics: &Topics) -> Self {
        let client_id = cfg.client_id.clone().unwrap_or_else(generate_client_id);
        let (client, eventloop) = AsyncClient::new(build_options(cfg, &client_id), REQUEST_CAPACITY);

        Self {
            client,
            eventloop: Mutex::new(Some(eventloop)),
            handler: RwLock::new(None),
            health: HealthTracker::new(),
            client_id,
            broker: cfg.broker(),
            topics: topics.clone(),
            reconnect_period: Duration::from_secs(cfg.reconnect_period_secs),
            connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
        }
    }

    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Lance la boucle d'événements; ne peut être appelé qu'une fois.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, TransportError> {
        let eventloop = self.eventloop.lock().take().ok_or(TransportError::AlreadyStarted)?;
        if self.handler.read().is_none() {
            warn!("[mqtt] démarrage sans handler : les messages entrants seront ignorés");
        }
        let transport = Arc::clone(self);
        Ok(tokio::spawn(async move { transport.run(eventloop).await }))
    }

    async fn run(&self, mut eventloop: EventLoop) {
        self.health.mark_connecting();
        info!("[mqtt] connexion à {} (client {})", self.broker, self.client_id);

        loop {
            // une fois connecté, poll() peut légitimement attendre longtemps
            let polled = if self.health.is_connected() {
                Ok(eventloop.poll().await)
            } else {
                timeout(self.connect_timeout, eventloop.poll()).await
            };
            match self.handle_event(polled) {
                LoopStep::Backoff => sleep(self.reconnect_period).await,
                LoopStep::Subscribed(queued) => debug!("[mqtt] {queued} abonnement(s) en file"),
                LoopStep::Continue => {}
            }
        }
    }

    /// Traite un résultat de poll; ne dort jamais, la pause est à la charge de `run`.
    fn handle_event(&self, polled: Result<Result<Event, ConnectionError>, Elapsed>) -> LoopStep {
        match polled {
            Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                if ack.code == ConnectReturnCode::Success {
                    self.health.mark_connected();
                    info!("[mqtt] connecté à {}", self.broker);
                    LoopStep::Subscribed(self.subscribe_all())
                } else {
                    warn!("[mqtt] connexion refusée par le broker: {:?}", ack.code);
                    LoopStep::Continue
                }
            }
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                debug!("[mqtt] reçu sur '{}': {} octets", publish.topic, publish.payload.len());
                self.dispatch(&publish.topic, &publish.payload);
                LoopStep::Continue
            }
            Ok(Ok(Event::Incoming(Packet::SubAck(suback)))) => {
                for code in &suback.return_codes {
                    if matches!(code, SubscribeReasonCode::Failure) {
                        self.health.record_subscribe_failure();
                        warn!("[mqtt] abonnement refusé (pkid {}), nouvel essai à la prochaine reconnexion", suback.pkid);
                    }
                }
                LoopStep::Continue
            }
            Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                warn!("[mqtt] déconnecté par le broker");
                self.health.mark_disconnected();
                LoopStep::Continue
            }
            Ok(Ok(_)) => LoopStep::Continue,
            Ok(Err(e)) => {
                error!("[mqtt] erreur: {e}; reconnexion dans {:?}", self.reconnect_period);
                self.health.increment_reconnects();
                LoopStep::Backoff
            }
            Err(_) => {
                warn!("[mqtt] {}", TransportError::ConnectTimeout(self.connect_timeout));
                self.health.increment_reconnects();
                LoopStep::Backoff
            }
        }
    }

    // Appelé à chaque ConnAck : la session est "clean", les abonnements sont perdus.
    // Renvoie le nombre d'abonnements mis en file.
    fn subscribe_all(&self) -> usize {
        let mut queued = 0;
        for topic in self.topics.subscriptions() {
            match self.client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                Ok(()) => {
                    info!("[mqtt] abonnement à '{topic}'");
                    queued += 1;
                }
                Err(e) => {
                    self.health.record_subscribe_failure();
                    warn!("[mqtt] abonnement à '{topic}' impossible: {e}");
                }
            }
        }
        queued
    }

    fn dispatch(&self, topic: &str, payload: &[u8]) {
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler.on_message(topic, payload),
            None => debug!("[mqtt] pas de handler, message '{topic}' ignoré"),
        }
    }
}

impl Publisher for MqttTransport {
    fn publish(&self, message: OutboundMessage, qos: Qos) -> Result<(), TransportError> {
        let kind = message.kind();
        let (topic, payload) = message.into_parts();
        match self.client.try_publish(topic.as_str(), qos.into(), false, payload) {
            Ok(()) => {
                debug!("[mqtt] {kind:?} mis en file vers '{topic}'");
                Ok(())
            }
            Err(e) => {
                self.health.record_publish_failure();
                Err(TransportError::PublishFailure(e.to_string()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.health.is_connected()
    }

    fn link_status(&self) -> LinkStatus {
        let health = self.health.snapshot();
        LinkStatus {
            connected: health.state == ConnectionState::Connected,
            state: health.state,
            client_id: self.client_id.clone(),
            broker: self.broker.clone(),
            topics: self.topics.clone(),
            reconnects: health.reconnects,
            publish_failures: health.publish_failures,
            subscribe_failures: health.subscribe_failures,
        }
    }
}
