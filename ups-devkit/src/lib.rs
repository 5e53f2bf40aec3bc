/*!
# UPS DevKit - Stubs et Utilitaires pour Développement

Bibliothèque facilitant le développement du bridge UPS avec:
- Détecteur UPS simulé (découverte UDP + session TCP)
- Builders de messages au format du firmware
- Harness de test avec expectations sur les échos
*/

pub mod device_stub;
pub mod test_utils;

pub use device_stub::{MockDeviceConfig, MockUpsDevice, UpsMessageBuilder};
pub use test_utils::TestHarness;
