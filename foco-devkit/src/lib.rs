/*!
# Foco DevKit - Stubs et utilitaires pour tester le kernel

Bibliothèque facilitant les tests du kernel foco sans broker :
- Transport MQTT simulé (publish enregistrés, connectivité pilotable)
- Builders des payloads ESP32 du contrat casa/foco
- Harness complet : coordinateur + transport simulé + horloge manuelle
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{DeviceMessageBuilder, MockMessage, MockTransport};
pub use test_utils::TestHarness;
