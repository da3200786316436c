/**
 * LIVENESS REGISTRY - Suivi des ESP32 vivants par heartbeat
 *
 * RÔLE : map esp32Id -> dernier heartbeat, expurgée des entrées plus vieilles
 * que la fenêtre de staleness.
 *
 * FONCTIONNEMENT : le sweep est paresseux (déclenché par chaque lecture) et peut
 * aussi être lancé périodiquement par le coordinateur. Une lecture ne renvoie
 * jamais une entrée plus vieille que la fenêtre.
 */

use serde::Serialize;
use std::collections::HashMap;
use time::{Duration, OffsetDateTime};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Registered,
    Refreshed,
    /// Plus ancien que le dernier heartbeat connu : ignoré.
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessStats {
    pub registered: u64,
    pub refreshed: u64,
    pub stale_rejected: u64,
    pub evicted: u64,
}

#[derive(Debug)]
pub struct LivenessRegistry {
    entries: HashMap<String, OffsetDateTime>,
    window: Duration,
    stats: LivenessStats,
}

impl LivenessRegistry {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            window,
            stats: LivenessStats::default(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn record_heartbeat(&mut self, device_id: &str, at: OffsetDateTime) -> HeartbeatOutcome {
        match self.entries.get_mut(device_id) {
            Some(last) if at < *last => {
                self.stats.stale_rejected += 1;
                warn!("[liveness] heartbeat {device_id} antérieur au dernier connu ({at} < {last}), ignoré");
                HeartbeatOutcome::Stale
            }
            Some(last) => {
                *last = at;
                self.stats.refreshed += 1;
                HeartbeatOutcome::Refreshed
            }
            None => {
                self.entries.insert(device_id.to_string(), at);
                self.stats.registered += 1;
                HeartbeatOutcome::Registered
            }
        }
    }

    /// Retire toute entrée telle que `now - last > window`; renvoie les ids retirés.
    pub fn sweep_stale(&mut self, now: OffsetDateTime, window: Duration) -> Vec<String> {
        let mut evicted = Vec::new();
        self.entries.retain(|device_id, last| {
            if now - *last > window {
                evicted.push(device_id.clone());
                false
            } else {
                true
            }
        });
        for device_id in &evicted {
            warn!("[liveness] ESP32 {device_id} retiré par inactivité");
        }
        self.stats.evicted += evicted.len() as u64;
        evicted.sort();
        evicted
    }

    pub fn count(&mut self, now: OffsetDateTime) -> usize {
        self.sweep_stale(now, self.window);
        self.entries.len()
    }

    /// Ids vivants, triés pour un affichage stable.
    pub fn active_devices(&mut self, now: OffsetDateTime) -> Vec<String> {
        self.sweep_stale(now, self.window);
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn last_seen(&self, device_id: &str) -> Option<OffsetDateTime> {
        self.entries.get(device_id).copied()
    }

    pub fn stats(&self) -> LivenessStats {
        self.stats
    }
}
