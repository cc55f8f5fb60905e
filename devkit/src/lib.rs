/*!
# Trellis DevKit - Stubs et Utilitaires pour Développement

Bibliothèque facilitant le développement de connecteurs Trellis avec:
- Client bus mock pour tests sans broker
- Fabrique de messages conformes au contrat filaire
- Harness de test avec assertions sur les topics
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MockBusClient, MockMessage, WireMessageBuilder};
pub use test_utils::TestHarness;
