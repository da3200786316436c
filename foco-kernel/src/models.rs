use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::warn;

/// Identifiant attribué à un rapport d'état qui n'a pas fourni d'`esp32Id`.
pub const UNKNOWN_DEVICE: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceValue {
    On,
    Off,
}

impl DeviceValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceValue::On => "on",
            DeviceValue::Off => "off",
        }
    }
}

impl fmt::Display for DeviceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceValue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(DeviceValue::On),
            "off" => Ok(DeviceValue::Off),
            other => Err(other.to_string()),
        }
    }
}

/// Chemin d'écriture qui a fixé la valeur courante.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    Command,
    DeviceReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub value: DeviceValue,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub source: Source,
}

/// Rôle de l'émetteur, porté par chaque message pour l'observabilité.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Backend,
    Device,
}

fn device_origin() -> Origin {
    Origin::Device
}

fn backend_origin() -> Origin {
    Origin::Backend
}

fn unknown_device() -> String {
    UNKNOWN_DEVICE.to_string()
}

/// RFC 3339, puis ISO-8601 avec offset, puis ISO-8601 sans offset lu comme UTC.
pub fn parse_iso_timestamp(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(raw, &Iso8601::DEFAULT))
        .or_else(|_| PrimitiveDateTime::parse(raw, &Iso8601::DEFAULT).map(PrimitiveDateTime::assume_utc))
        .map(|at| at.to_offset(UtcOffset::UTC))
        .ok()
}

// Horodatage envoyé par un ESP32 : illisible => absent, le rapport reste valide.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(text)) => {
            let parsed = parse_iso_timestamp(&text);
            if parsed.is_none() {
                warn!("[models] timestamp ESP32 illisible {text:?}, remplacé par l'heure de réception");
            }
            parsed
        }
        Some(other) => {
            warn!("[models] timestamp ESP32 non textuel {other}, remplacé par l'heure de réception");
            None
        }
    })
}

// backend → ESP32
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub estado: DeviceValue,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default = "backend_origin")]
    pub origen: Origin,
}

// ESP32 → backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateReportPayload {
    pub estado: DeviceValue,
    #[serde(
        default,
        serialize_with = "time::serde::rfc3339::option::serialize",
        deserialize_with = "lenient_timestamp"
    )]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(rename = "esp32Id", default = "unknown_device")]
    pub device_id: String,
    #[serde(default = "device_origin")]
    pub origen: Origin,
}

// ESP32 → backend, champs supplémentaires ignorés
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(rename = "esp32Id", default)]
    pub device_id: String,
    #[serde(
        default,
        serialize_with = "time::serde::rfc3339::option::serialize",
        deserialize_with = "lenient_timestamp"
    )]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(default = "device_origin")]
    pub origen: Origin,
}

// backend → ESP32 (confirmation de réception)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusAckPayload {
    pub mensaje: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub servidor: String,
    #[serde(default = "backend_origin")]
    pub origen: Origin,
}
