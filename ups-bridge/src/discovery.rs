//! Detector discovery over UDP broadcast
//!
//! This module handles:
//! - Binding the discovery port with broadcast enabled
//! - Probing the configured broadcast address and every IPv4 interface's
//!   directed broadcast address at a fixed interval
//! - Accepting the first datagram carrying the reply payload as the peer
//! - Optional overall timeout

use crate::config::DiscoveryConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::models::PeerAddress;
use if_addrs::{get_if_addrs, IfAddr};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct PeerLocator {
    config: DiscoveryConfig,
}

impl PeerLocator {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Probe until a detector answers. Completes once; the socket is closed on return,
    /// so no further probes go out and later replies are never seen.
    pub async fn locate(&self) -> BridgeResult<PeerAddress> {
        match self.config.timeout() {
            Some(limit) => tokio::time::timeout(limit, self.probe_until_reply())
                .await
                .map_err(|_| BridgeError::DiscoveryTimeout(limit)),
            None => Ok(self.probe_until_reply().await),
        }
    }

    async fn probe_until_reply(&self) -> PeerAddress {
        let socket = self.bind().await;
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut buf = [0u8; 512];
        let mut probes: u64 = 0;

        info!(
            "Looking for detector: probing port {} every {:?}",
            self.config.device_port,
            self.config.interval()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    probes += 1;
                    self.send_probes(&socket, probes).await;
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) if self.is_reply(&buf[..len]) => {
                        let peer = PeerAddress::from(from);
                        info!("Detector found at {} after {} probe(s)", peer, probes);
                        return peer;
                    }
                    Ok((len, from)) => {
                        debug!("Ignoring {}-byte datagram from {}", len, from);
                    }
                    Err(e) => {
                        warn!("Discovery receive failed: {}", e);
                    }
                },
            }
        }
    }

    /// Keeps retrying until the port can be bound
    async fn bind(&self) -> UdpSocket {
        let local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.listen_port));
        loop {
            match UdpSocket::bind(local).await {
                Ok(socket) => {
                    if let Err(e) = socket.set_broadcast(true) {
                        warn!("Could not enable broadcast on discovery socket: {}", e);
                    }
                    debug!("Discovery socket bound to {:?}", socket.local_addr());
                    return socket;
                }
                Err(e) => {
                    let err = BridgeError::transport("binding discovery socket", e);
                    warn!("{}, retrying in {:?}", err, self.config.interval());
                    tokio::time::sleep(self.config.interval()).await;
                }
            }
        }
    }

    async fn send_probes(&self, socket: &UdpSocket, probe_no: u64) {
        let payload = self.config.probe_payload.as_bytes();
        for target in self.probe_targets() {
            match socket.send_to(payload, SocketAddr::V4(target)).await {
                Ok(_) => debug!("Probe #{} sent to {}", probe_no, target),
                Err(e) => debug!("Probe #{} to {} failed: {}", probe_no, target, e),
            }
        }
    }

    fn probe_targets(&self) -> Vec<SocketAddrV4> {
        let port = self.config.device_port;
        let mut targets = vec![SocketAddrV4::new(self.config.broadcast_addr, port)];

        if self.config.interface_broadcasts {
            for addr in interface_broadcasts() {
                let target = SocketAddrV4::new(addr, port);
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }

        targets
    }

    fn is_reply(&self, payload: &[u8]) -> bool {
        std::str::from_utf8(payload)
            .map(|text| text.trim() == self.config.reply_payload.trim())
            .unwrap_or(false)
    }
}

/// Directed broadcast addresses of the non-loopback IPv4 interfaces
fn interface_broadcasts() -> Vec<Ipv4Addr> {
    match get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .filter_map(|iface| match iface.addr {
                IfAddr::V4(v4) => v4.broadcast,
                IfAddr::V6(_) => None,
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate network interfaces: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use ups_devkit::{MockDeviceConfig, MockUpsDevice};

    fn local_config(device_port: u16) -> DiscoveryConfig {
        DiscoveryConfig {
            listen_port: 0,
            device_port,
            broadcast_addr: Ipv4Addr::LOCALHOST,
            interface_broadcasts: false,
            interval_ms: 50,
            ..DiscoveryConfig::default()
        }
    }

    #[test]
    fn test_reply_matching_trims_whitespace() {
        let locator = PeerLocator::new(DiscoveryConfig::default());
        assert!(locator.is_reply(b"Here I am"));
        assert!(locator.is_reply(b"Here I am\r\n"));
        assert!(!locator.is_reply(b"Where are you?"));
        assert!(!locator.is_reply(b"here i am"));
        assert!(!locator.is_reply(&[0xff, 0xfe]));
    }

    #[test]
    fn test_probe_targets_without_interfaces() {
        let locator = PeerLocator::new(DiscoveryConfig {
            interface_broadcasts: false,
            ..DiscoveryConfig::default()
        });
        assert_eq!(
            locator.probe_targets(),
            vec![SocketAddrV4::new(Ipv4Addr::BROADCAST, 7792)]
        );
    }

    #[tokio::test]
    async fn test_locates_mock_device() {
        let device = MockUpsDevice::start(MockDeviceConfig::default()).await.unwrap();
        let locator = PeerLocator::new(local_config(device.discovery_port()));

        let peer = tokio::time::timeout(Duration::from_secs(5), locator.locate())
            .await
            .expect("discovery hung")
            .unwrap();

        assert_eq!(peer.host, std::net::IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(peer.port, device.discovery_port());
        device.stop().await;
    }

    #[tokio::test]
    async fn test_probing_stops_after_late_reply() {
        let device = MockUpsDevice::start(MockDeviceConfig {
            silent_probes: 3,
            ..MockDeviceConfig::default()
        })
        .await
        .unwrap();
        let locator = PeerLocator::new(local_config(device.discovery_port()));

        locator.locate().await.unwrap();
        let probes_at_reply = device.probes_received();
        assert!(probes_at_reply >= 4, "device stayed silent for 3 probes");

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(device.probes_received(), probes_at_reply);
        device.stop().await;
    }

    #[tokio::test]
    async fn test_configured_timeout_is_reported() {
        // Bound but mute: probes land somewhere and nobody answers
        let mute = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = mute.local_addr().unwrap().port();

        let locator = PeerLocator::new(DiscoveryConfig {
            timeout_secs: Some(1),
            ..local_config(port)
        });

        match locator.locate().await {
            Err(BridgeError::DiscoveryTimeout(limit)) => assert_eq!(limit, Duration::from_secs(1)),
            other => panic!("expected discovery timeout, got {:?}", other),
        }
    }
}
