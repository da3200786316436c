/**
 * API REST FOCO - Interface synchrone pour Alexa / appels HTTP
 *
 * RÔLE :
 * Traduit les requêtes HTTP en opérations du coordinateur et sérialise
 * ses réponses avec les noms de champs attendus par les clients existants.
 *
 * ROUTES :
 * - POST /api/dispositivo                 commande on/off
 * - GET  /api/dispositivo/estado          snapshot lecture seule
 * - GET  /api/dispositivo/estadisticas    état + ESP32 + transport + compteurs
 * - GET  /api/health                      santé du service
 * - POST /api/dispositivo/test/{estado}   commande directe, sans toucher à l'état
 *
 * ERREURS : TransportUnavailable -> 503, InvalidValue/InvalidTimestamp -> 400
 */

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

use crate::coordinator::{CommandRequest, Coordinator, ReconciliationStats};
use crate::error::CommandError;
use crate::models::{DeviceValue, Source};
use crate::transport::LinkStatus;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

fn iso(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_default()
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CommandBody {
    #[serde(alias = "device")]
    pub dispositivo: String,
    pub estado: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub success: bool,
    pub mensaje: String,
    pub estado: DeviceValue,
    pub timestamp: String,
    #[serde(rename = "esp32sConectados")]
    pub esp32s_conectados: usize,
    pub mqtt_connected: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct EstadoResponse {
    pub estado: DeviceValue,
    pub timestamp: String,
    #[serde(rename = "esp32sConectados")]
    pub esp32s_conectados: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EstadisticasResponse {
    pub estado_foco: DeviceValue,
    pub ultima_actualizacion: String,
    pub fuente: Source,
    #[serde(rename = "esp32sConectados")]
    pub esp32s_conectados: Vec<String>,
    #[serde(rename = "totalESP32s")]
    pub total_esp32s: usize,
    pub mqtt: LinkStatus,
    pub reconciliacion: ReconciliationStats,
}

#[derive(Debug, Serialize)]
pub struct MqttHealth {
    pub connected: bool,
    pub broker: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub service: &'static str,
    pub mqtt: MqttHealth,
    pub esp32s: usize,
    pub estado_foco: DeviceValue,
}

#[derive(Debug, Serialize)]
pub struct TestCommandResponse {
    pub success: bool,
    pub mensaje: String,
    pub timestamp: String,
}

impl IntoResponse for CommandError {
    fn into_response(self) -> Response {
        let status = match self {
            CommandError::TransportUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            CommandError::InvalidValue(_) | CommandError::InvalidTimestamp(_) => StatusCode::BAD_REQUEST,
        };
        let body = serde_json::json!({ "statusCode": status.as_u16(), "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(get_health))
        .route("/api/dispositivo", post(control_device))
        .route("/api/dispositivo/estado", get(get_state))
        .route("/api/dispositivo/estadisticas", get(get_statistics))
        .route("/api/dispositivo/test/{estado}", post(test_command))
        .with_state(app_state)
}

// POST /api/dispositivo
async fn control_device(
    State(app): State<AppState>,
    Json(body): Json<CommandBody>,
) -> Result<Json<CommandResponse>, CommandError> {
    info!("[http] petición: {} -> {}", body.dispositivo, body.estado);
    let receipt = app.coordinator.execute_command(CommandRequest {
        device: body.dispositivo,
        value: body.estado,
        timestamp: body.timestamp,
    })?;
    Ok(Json(CommandResponse {
        success: true,
        mensaje: receipt.message,
        estado: receipt.state.value,
        timestamp: iso(receipt.state.updated_at),
        esp32s_conectados: receipt.live_devices,
        mqtt_connected: receipt.transport_connected,
    }))
}

// GET /api/dispositivo/estado
async fn get_state(State(app): State<AppState>) -> Json<EstadoResponse> {
    let snapshot = app.coordinator.snapshot();
    Json(EstadoResponse {
        estado: snapshot.state.value,
        timestamp: iso(snapshot.state.updated_at),
        esp32s_conectados: snapshot.live_devices,
    })
}

// GET /api/dispositivo/estadisticas
async fn get_statistics(State(app): State<AppState>) -> Json<EstadisticasResponse> {
    let stats = app.coordinator.statistics();
    Json(EstadisticasResponse {
        estado_foco: stats.state.value,
        ultima_actualizacion: iso(stats.state.updated_at),
        fuente: stats.state.source,
        total_esp32s: stats.active_devices.len(),
        esp32s_conectados: stats.active_devices,
        mqtt: stats.link,
        reconciliacion: stats.reconciliation,
    })
}

// GET /api/health
async fn get_health(State(app): State<AppState>) -> Json<HealthResponse> {
    let health = app.coordinator.health();
    Json(HealthResponse {
        status: "ok",
        timestamp: iso(OffsetDateTime::now_utc()),
        service: "foco-kernel",
        mqtt: MqttHealth { connected: health.connected, broker: health.broker },
        esp32s: health.live_devices,
        estado_foco: health.value,
    })
}

// POST /api/dispositivo/test/{estado}
async fn test_command(
    State(app): State<AppState>,
    Path(estado): Path<String>,
) -> Result<Json<TestCommandResponse>, CommandError> {
    let sent_at = app.coordinator.send_test_command(&estado)?;
    Ok(Json(TestCommandResponse {
        success: true,
        mensaje: format!("Comando de test enviado: {estado}"),
        timestamp: iso(sent_at),
    }))
}
