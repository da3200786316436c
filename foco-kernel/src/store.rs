/**
 * DEVICE STATE STORE - État autoritaire unique du foco
 *
 * RÔLE : garde {valeur, updatedAt, source} et arbitre entre les deux
 * producteurs indépendants (commande utilisateur, rapport ESP32).
 *
 * POLITIQUE :
 * - commande : gagne toujours (intention explicite de l'utilisateur)
 * - rapport ESP32 : last-writer-wins par timestamp, un rapport plus ancien
 *   que updatedAt est accepté (ack) mais ne modifie rien
 * - updatedAt ne recule jamais
 */

use serde::Serialize;
use time::OffsetDateTime;
use tracing::warn;

use crate::models::{DeviceState, DeviceValue, Source};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Applied,
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub commands_applied: u64,
    pub reports_applied: u64,
    pub reports_stale: u64,
}

#[derive(Debug)]
pub struct DeviceStateStore {
    state: DeviceState,
    stats: StoreStats,
}

impl DeviceStateStore {
    /// État initial : `off`, horodaté au démarrage du process.
    pub fn new(started_at: OffsetDateTime) -> Self {
        Self {
            state: DeviceState {
                value: DeviceValue::Off,
                updated_at: started_at,
                source: Source::Command,
            },
            stats: StoreStats::default(),
        }
    }

    pub fn apply_command(&mut self, value: DeviceValue, at: OffsetDateTime) -> DeviceState {
        self.state = DeviceState {
            value,
            updated_at: at.max(self.state.updated_at),
            source: Source::Command,
        };
        self.stats.commands_applied += 1;
        self.state
    }

    pub fn apply_device_report(&mut self, value: DeviceValue, at: OffsetDateTime) -> ReportOutcome {
        if at < self.state.updated_at {
            self.stats.reports_stale += 1;
            warn!(
                "[store] rapport {value} du {at} plus ancien que l'état courant ({}), ignoré",
                self.state.updated_at
            );
            return ReportOutcome::Stale;
        }
        self.state = DeviceState {
            value,
            updated_at: at,
            source: Source::DeviceReport,
        };
        self.stats.reports_applied += 1;
        ReportOutcome::Applied
    }

    pub fn current(&self) -> DeviceState {
        self.state
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }
}
