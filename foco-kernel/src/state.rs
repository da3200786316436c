use parking_lot::Mutex;
use std::sync::Arc;

/// Verrou unique partagé entre les tâches (HTTP, boucle MQTT, sweeper).
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
