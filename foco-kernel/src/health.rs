use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkHealth {
    pub uptime_seconds: u64,
    pub state: ConnectionState,
    pub reconnects: u32,
    pub publish_failures: u64,
    pub subscribe_failures: u64,
}

/// État vivant du lien MQTT, partagé entre la boucle d'événements et les lecteurs.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    state: Arc<RwLock<ConnectionState>>,
    reconnects: Arc<AtomicU32>,
    publish_failures: Arc<AtomicU64>,
    subscribe_failures: Arc<AtomicU64>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            reconnects: Arc::new(AtomicU32::new(0)),
            publish_failures: Arc::new(AtomicU64::new(0)),
            subscribe_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn mark_connecting(&self) {
        *self.state.write() = ConnectionState::Connecting;
    }

    pub fn mark_connected(&self) {
        *self.state.write() = ConnectionState::Connected;
    }

    pub fn mark_disconnected(&self) {
        *self.state.write() = ConnectionState::Disconnected;
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        *self.state.write() = ConnectionState::Reconnecting;
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscribe_failure(&self) {
        self.subscribe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Vrai uniquement quand le broker a confirmé la session (ConnAck).
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn snapshot(&self) -> LinkHealth {
        LinkHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            state: self.state(),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            subscribe_failures: self.subscribe_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
