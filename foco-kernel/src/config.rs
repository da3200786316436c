use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

use crate::codec::MessageKind;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttConf,
    pub topics: Topics,
    pub liveness: LivenessConf,
    pub http: HttpConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    pub reconnect_period_secs: u64,
    pub connect_timeout_secs: u64,
    pub command_qos: Qos,
    pub ack_qos: Qos,
    pub server_name: String,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            tls: false,
            client_id: None,
            keep_alive_secs: 60,
            reconnect_period_secs: 5,
            connect_timeout_secs: 30,
            command_qos: Qos::AtMostOnce,
            ack_qos: Qos::AtMostOnce,
            server_name: "foco-kernel".into(),
        }
    }
}

impl MqttConf {
    pub fn broker(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// mqtts si demandé explicitement ou sur le port TLS standard.
    pub fn use_tls(&self) -> bool {
        self.tls || self.port == 8883
    }
}

/// QoS supportées : at-most-once et at-least-once uniquement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            other => Err(format!("qos {other} non supportée (0 ou 1)")),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
        }
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Topics {
    pub command: String,      // Backend → ESP32
    pub state_report: String, // ESP32 → Backend
    pub heartbeat: String,    // ESP32 → Backend (keep alive)
    pub status_ack: String,   // Backend → ESP32 (confirmation)
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            command: "casa/foco/comando".into(),
            state_report: "casa/foco/estado".into(),
            heartbeat: "casa/foco/heartbeat".into(),
            status_ack: "casa/foco/status".into(),
        }
    }
}

impl Topics {
    /// Topics auxquels le kernel s'abonne à chaque (re)connexion.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![self.state_report.clone(), self.heartbeat.clone()]
    }

    pub fn kind_of(&self, topic: &str) -> Option<MessageKind> {
        if topic == self.state_report {
            Some(MessageKind::StateReport)
        } else if topic == self.heartbeat {
            Some(MessageKind::Heartbeat)
        } else if topic == self.command {
            Some(MessageKind::Command)
        } else if topic == self.status_ack {
            Some(MessageKind::StatusAck)
        } else {
            None
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LivenessConf {
    pub window_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for LivenessConf {
    fn default() -> Self {
        Self { window_secs: 300, sweep_interval_secs: 60 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub port: u16,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { port: 3000 }
    }
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

/// Surcharges d'environnement (`MQTT_*`, `PORT`), appliquées après le fichier.
pub fn apply_env_overrides<F>(cfg: &mut KernelConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("MQTT_HOST") {
        cfg.mqtt.host = host;
    }
    if let Some(port) = lookup("MQTT_PORT") {
        match port.parse() {
            Ok(p) => cfg.mqtt.port = p,
            Err(_) => warn!("[config] MQTT_PORT invalide ignoré: {port}"),
        }
    }
    if let Some(user) = lookup("MQTT_USERNAME").filter(|u| !u.is_empty()) {
        cfg.mqtt.username = Some(user);
    }
    if let Some(pass) = lookup("MQTT_PASSWORD").filter(|p| !p.is_empty()) {
        cfg.mqtt.password = Some(pass);
    }
    if let Some(ssl) = lookup("MQTT_USE_SSL") {
        cfg.mqtt.tls = ssl == "true";
    }
    if let Some(id) = lookup("MQTT_CLIENT_ID").filter(|id| !id.is_empty()) {
        cfg.mqtt.client_id = Some(id);
    }
    if let Some(port) = lookup("PORT") {
        match port.parse() {
            Ok(p) => cfg.http.port = p,
            Err(_) => warn!("[config] PORT invalide ignoré: {port}"),
        }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("FOCO_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!("[config] config invalide: {e}");
            KernelConfig::default()
        })
    } else {
        info!("[config] pas de {path}, usage config par défaut");
        KernelConfig::default()
    };
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    cfg
}
