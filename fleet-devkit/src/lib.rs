/*!
# Fleet DevKit - Doublures de test pour le kernel et les agents

Bibliothèque de dev (dev-dependency uniquement) avec:
- `MockMqttClient` : implémente `Publisher`, journal des publications, vues typées par canal
- Builders de heartbeats, acks et commandes workload
- `TestHarness` : attente bornée des publications asynchrones du kernel
*/

pub mod builders;
pub mod mqtt_stub;
pub mod test_utils;

pub use builders::{HeartbeatBuilder, MessageBuilder};
pub use mqtt_stub::{MockMessage, MockMqttClient};
pub use test_utils::TestHarness;
