/**
 * CODEC MQTT - Sérialisation des quatre messages du contrat foco
 *
 * RÔLE :
 * Isole le format JSON du fil de la logique de synchronisation.
 * Le type d'un message entrant est déduit du topic, jamais du payload.
 *
 * RÈGLES :
 * - encode() garantit toujours un timestamp (maintenant si absent) et un `origen`
 * - decode() est tolérant : tout payload invalide devient une CodecError,
 *   jamais un panic, pour que la boucle de dispatch continue
 */

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::CodecError;
use crate::models::{CommandPayload, HeartbeatPayload, StateReportPayload, StatusAckPayload, UNKNOWN_DEVICE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Command,
    StateReport,
    Heartbeat,
    StatusAck,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Command(CommandPayload),
    StateReport(StateReportPayload),
    Heartbeat(HeartbeatPayload),
    StatusAck(StatusAckPayload),
}

impl WireMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            WireMessage::Command(_) => MessageKind::Command,
            WireMessage::StateReport(_) => MessageKind::StateReport,
            WireMessage::Heartbeat(_) => MessageKind::Heartbeat,
            WireMessage::StatusAck(_) => MessageKind::StatusAck,
        }
    }
}

/// Messages ESP32 → backend, seuls acceptés par le dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    StateReport(StateReportPayload),
    Heartbeat(HeartbeatPayload),
}

impl InboundMessage {
    pub fn device_id(&self) -> &str {
        match self {
            InboundMessage::StateReport(report) => &report.device_id,
            InboundMessage::Heartbeat(heartbeat) => &heartbeat.device_id,
        }
    }
}

/// Messages backend → ESP32 déjà encodés, prêts pour le transport.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Command { topic: String, payload: Vec<u8> },
    StatusAck { topic: String, payload: Vec<u8> },
}

impl OutboundMessage {
    pub fn command(topic: &str, command: CommandPayload) -> Result<Self, CodecError> {
        Ok(OutboundMessage::Command {
            topic: topic.to_string(),
            payload: encode(&WireMessage::Command(command))?,
        })
    }

    pub fn status_ack(topic: &str, ack: StatusAckPayload) -> Result<Self, CodecError> {
        Ok(OutboundMessage::StatusAck {
            topic: topic.to_string(),
            payload: encode(&WireMessage::StatusAck(ack))?,
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            OutboundMessage::Command { .. } => MessageKind::Command,
            OutboundMessage::StatusAck { .. } => MessageKind::StatusAck,
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            OutboundMessage::Command { topic, .. } | OutboundMessage::StatusAck { topic, .. } => topic,
        }
    }

    pub fn into_parts(self) -> (String, Vec<u8>) {
        match self {
            OutboundMessage::Command { topic, payload }
            | OutboundMessage::StatusAck { topic, payload } => (topic, payload),
        }
    }
}

pub fn encode(message: &WireMessage) -> Result<Vec<u8>, CodecError> {
    let bytes = match message {
        WireMessage::Command(command) => serde_json::to_vec(command)?,
        WireMessage::StatusAck(ack) => serde_json::to_vec(ack)?,
        WireMessage::StateReport(report) => {
            let mut report = report.clone();
            report.timestamp.get_or_insert_with(OffsetDateTime::now_utc);
            serde_json::to_vec(&report)?
        }
        WireMessage::Heartbeat(heartbeat) => {
            let mut heartbeat = heartbeat.clone();
            heartbeat.timestamp.get_or_insert_with(OffsetDateTime::now_utc);
            serde_json::to_vec(&heartbeat)?
        }
    };
    Ok(bytes)
}

pub fn decode(kind: MessageKind, bytes: &[u8]) -> Result<WireMessage, CodecError> {
    let message = match kind {
        MessageKind::Command => WireMessage::Command(serde_json::from_slice(bytes)?),
        MessageKind::StatusAck => WireMessage::StatusAck(serde_json::from_slice(bytes)?),
        MessageKind::StateReport => {
            let mut report: StateReportPayload = serde_json::from_slice(bytes)?;
            if report.device_id.trim().is_empty() {
                report.device_id = UNKNOWN_DEVICE.to_string();
            }
            WireMessage::StateReport(report)
        }
        MessageKind::Heartbeat => {
            let heartbeat: HeartbeatPayload = serde_json::from_slice(bytes)?;
            if heartbeat.device_id.trim().is_empty() {
                return Err(CodecError::MissingDeviceId);
            }
            WireMessage::Heartbeat(heartbeat)
        }
    };
    Ok(message)
}

/// Décode un message reçu sur un topic d'entrée.
pub fn decode_inbound(kind: MessageKind, bytes: &[u8]) -> Result<InboundMessage, CodecError> {
    match decode(kind, bytes)? {
        WireMessage::StateReport(report) => Ok(InboundMessage::StateReport(report)),
        WireMessage::Heartbeat(heartbeat) => Ok(InboundMessage::Heartbeat(heartbeat)),
        other => Err(CodecError::UnexpectedKind(other.kind())),
    }
}
