//! Foco kernel - pont entre une interface de commande synchrone (HTTP / Alexa)
//! et une flotte d'ESP32 joignables uniquement via MQTT.
//!
//! Le [`coordinator::Coordinator`] détient l'état autoritaire du foco et le
//! registre des ESP32 vivants; le [`transport::MqttTransport`] ne fait que
//! livrer et publier des messages.

pub mod clock;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod http;
pub mod liveness;
pub mod models;
pub mod state;
pub mod store;
pub mod transport;
