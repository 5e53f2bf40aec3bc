/*!
Test Harness pour le bridge UPS

Facilite l'écriture de tests bout-en-bout avec:
- Setup automatique du détecteur simulé
- Expectations sur les échos renvoyés par le bridge
- Statistiques sur les sondes, connexions et trames
*/

use crate::device_stub::{MockDeviceConfig, MockUpsDevice};
use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Harness de test autour d'un détecteur simulé
pub struct TestHarness {
    pub device: MockUpsDevice,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    status: String,
    expected_count: usize,
}

impl TestHarness {
    /// Crée un harness avec un détecteur par défaut sur localhost
    pub async fn new() -> Result<Self> {
        Self::with_config(MockDeviceConfig::default()).await
    }

    pub async fn with_config(config: MockDeviceConfig) -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        Ok(Self {
            device: MockUpsDevice::start(config).await?,
            expectations: Vec::new(),
        })
    }

    /// On s'attend à recevoir exactement N échos pour ce statut
    pub fn expect_echoes(&mut self, status: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            status: status.to_string(),
            expected_count: count,
        });
        self
    }

    /// Attend que le bridge se connecte
    pub async fn wait_for_bridge(&self, timeout_ms: u64) -> Result<()> {
        let connected = self
            .device
            .wait_for_connections(1, Duration::from_millis(timeout_ms))
            .await;
        if !connected {
            anyhow::bail!("bridge did not connect within {} ms", timeout_ms);
        }
        log::info!("✅ Bridge connected");
        Ok(())
    }

    /// Simule une coupure secteur
    pub async fn power_off(&self) -> Result<()> {
        self.device.send_status("off").await?;
        log::info!("🔌 Sent power off");
        Ok(())
    }

    /// Simule le retour du secteur
    pub async fn power_on(&self) -> Result<()> {
        self.device.send_status("on").await?;
        log::info!("💡 Sent power on");
        Ok(())
    }

    /// Attend un écho donné; Ok(false) en cas de timeout
    pub async fn wait_for_echo(&self, status: &str, count: usize, timeout_ms: u64) -> Result<bool> {
        let seen = self
            .device
            .wait_for_status(status, count, Duration::from_millis(timeout_ms))
            .await;
        if !seen {
            log::warn!("⏰ Timeout waiting for echo '{}' x{}", status, count);
        }
        Ok(seen)
    }

    /// Vérifie toutes les expectations configurées
    pub fn verify_expectations(&self) -> Result<()> {
        let counts = self.get_stats().status_counts;

        for expectation in &self.expectations {
            let actual = counts.get(&expectation.status).copied().unwrap_or(0);
            if actual != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for status '{}': expected {} echoes, got {}",
                    expectation.status,
                    expectation.expected_count,
                    actual
                );
            }
        }

        log::info!("🎉 {} expectations verified", self.expectations.len());
        Ok(())
    }

    /// Stats sur les échanges collectés
    pub fn get_stats(&self) -> TestStats {
        let mut status_counts = HashMap::new();
        for status in self.device.received_statuses() {
            *status_counts.entry(status).or_insert(0) += 1;
        }

        TestStats {
            probes: self.device.probes_received(),
            connections: self.device.connections_accepted(),
            frames: self.device.received_frames().len(),
            status_counts,
        }
    }

    /// Reset pour un nouveau scénario
    pub fn reset(&mut self) {
        self.device.clear();
        self.expectations.clear();
    }
}

#[derive(Debug, Serialize)]
pub struct TestStats {
    pub probes: u32,
    pub connections: u32,
    pub frames: usize,
    pub status_counts: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_harness_expectations() {
        let mut harness = TestHarness::new().await.unwrap();
        harness.expect_echoes("off", 2).expect_echoes("on", 0);

        let mut bridge = TcpStream::connect(("127.0.0.1", harness.device.session_port()))
            .await
            .unwrap();
        harness.wait_for_bridge(2000).await.unwrap();

        bridge
            .write_all(b"{\"status\":\"off\"}\n{\"status\":\"off\"}\n")
            .await
            .unwrap();
        assert!(harness.wait_for_echo("off", 2, 2000).await.unwrap());

        harness.verify_expectations().unwrap();
        let stats = harness.get_stats();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.frames, 2);

        harness.reset();
        assert_eq!(harness.get_stats().frames, 0);
    }
}
