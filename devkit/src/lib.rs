/*!
# Symbion Fleet DevKit - Outils de test pour le plan de contrôle

Bibliothèque facilitant l'écriture de tests de bout en bout avec:
- Kernel complet en mémoire branché sur un transport simulé
- Agents scriptés (identité, code de sortie, pannes)
- Builders pour les entrées d'inventaire, de règles et de planifications
*/

pub mod fixtures;
pub mod test_utils;

pub use fixtures::FleetFixtures;
pub use symbion_fleet::transport::stub::{StubAgent, StubCall, StubTransport};
pub use test_utils::{FleetHarness, HarnessStats};
