use std::time::Duration;
use thiserror::Error;

use crate::codec::MessageKind;

/// Rejets renvoyés à l'appelant d'une commande, toujours avant mutation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Servidor MQTT no disponible")]
    TransportUnavailable,
    #[error("Estado debe ser \"on\" o \"off\" (recibido: {0:?})")]
    InvalidValue(String),
    #[error("timestamp invalide: {0:?}")]
    InvalidTimestamp(String),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload JSON invalide: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("esp32Id manquant ou vide")]
    MissingDeviceId,
    #[error("message {0:?} non attendu en entrée")]
    UnexpectedKind(MessageKind),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connexion MQTT non établie après {0:?}")]
    ConnectTimeout(Duration),
    #[error("publish MQTT échoué: {0}")]
    PublishFailure(String),
    #[error("boucle MQTT déjà démarrée")]
    AlreadyStarted,
}
