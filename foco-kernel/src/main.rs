/**
 * FOCO KERNEL - Point d'entrée principal du serveur
 *
 * RÔLE : bootstrap config, logging, transport MQTT, coordinateur et HTTP.
 *
 * CÂBLAGE EN DEUX TEMPS :
 * 1. construire le transport puis le coordinateur (qui publie via le transport)
 * 2. brancher le coordinateur comme handler du transport
 * 3. seulement ensuite démarrer la boucle MQTT
 */

use anyhow::Context;
use foco_kernel::clock::SystemClock;
use foco_kernel::config::load_config;
use foco_kernel::coordinator::{spawn_liveness_sweeper, Coordinator};
use foco_kernel::http::{build_router, AppState};
use foco_kernel::transport::MqttTransport;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("foco_kernel=info")),
        )
        .init();

    let cfg = load_config().await;
    info!(
        "[kernel] broker {} (tls={}, usuario={})",
        cfg.mqtt.broker(),
        cfg.mqtt.use_tls(),
        cfg.mqtt.username.as_deref().unwrap_or("anonyme")
    );

    let transport = Arc::new(MqttTransport::new(&cfg.mqtt, &cfg.topics));
    let coordinator = Arc::new(Coordinator::new(&cfg, transport.clone(), Arc::new(SystemClock)));
    transport.set_handler(coordinator.clone());
    transport.start().context("failed to start MQTT event loop")?;

    spawn_liveness_sweeper(
        coordinator.clone(),
        Duration::from_secs(cfg.liveness.sweep_interval_secs),
    );

    let app = build_router(AppState { coordinator });

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http.port));
    info!("[kernel] listening on http://{addr}");
    info!(
        "[kernel] topics: {} (out), {} (in), {} (in), {} (out)",
        cfg.topics.command, cfg.topics.state_report, cfg.topics.heartbeat, cfg.topics.status_ack
    );
    let listener = TcpListener::bind(addr).await.context("failed to bind HTTP listener")?;
    axum::serve(listener, app).await.context("HTTP server stopped")?;
    Ok(())
}
