use crate::models::PeerAddress;
use crate::session::ConnectionState;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct BridgeHealth {
    pub uptime_seconds: u64,
    pub peer: Option<String>,
    pub connection: ConnectionState,
    pub reconnect_attempts: u32,
    pub power_status: String,
    pub last_transition: Option<DateTime<Utc>>,
    pub template_fetches: u32,
    pub template_failures: u32,
    pub sms_sent: u32,
    pub sms_failed: u32,
    pub cadence_active: bool,
}

struct Inner {
    start_time: Instant,
    peer: Mutex<Option<PeerAddress>>,
    connection: Mutex<ConnectionState>,
    reconnect_attempts: AtomicU32,
    power_status: Mutex<String>,
    last_transition: Mutex<Option<DateTime<Utc>>>,
    template_fetches: AtomicU32,
    template_failures: AtomicU32,
    sms_sent: AtomicU32,
    sms_failed: AtomicU32,
    cadence_active: AtomicBool,
}

#[derive(Clone)]
pub struct HealthTracker {
    inner: Arc<Inner>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                start_time: Instant::now(),
                peer: Mutex::new(None),
                connection: Mutex::new(ConnectionState::Disconnected),
                reconnect_attempts: AtomicU32::new(0),
                power_status: Mutex::new("on".to_string()),
                last_transition: Mutex::new(None),
                template_fetches: AtomicU32::new(0),
                template_failures: AtomicU32::new(0),
                sms_sent: AtomicU32::new(0),
                sms_failed: AtomicU32::new(0),
                cadence_active: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_peer(&self, peer: PeerAddress) {
        *self.inner.peer.lock() = Some(peer);
    }

    pub fn set_connection(&self, state: ConnectionState) {
        *self.inner.connection.lock() = state;
    }

    pub fn increment_reconnects(&self) {
        self.inner.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the new status; only real changes stamp the transition time
    pub fn record_status(&self, status: &str) {
        let mut current = self.inner.power_status.lock();
        if *current != status {
            *current = status.to_string();
            *self.inner.last_transition.lock() = Some(Utc::now());
        }
    }

    pub fn record_template_fetch(&self, ok: bool) {
        self.inner.template_fetches.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.inner.template_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_sms(&self, ok: bool) {
        let counter = if ok { &self.inner.sms_sent } else { &self.inner.sms_failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_cadence_active(&self, active: bool) {
        self.inner.cadence_active.store(active, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BridgeHealth {
        let inner = &self.inner;
        BridgeHealth {
            uptime_seconds: inner.start_time.elapsed().as_secs(),
            peer: inner.peer.lock().as_ref().map(|p| p.to_string()),
            connection: *inner.connection.lock(),
            reconnect_attempts: inner.reconnect_attempts.load(Ordering::Relaxed),
            power_status: inner.power_status.lock().clone(),
            last_transition: *inner.last_transition.lock(),
            template_fetches: inner.template_fetches.load(Ordering::Relaxed),
            template_failures: inner.template_failures.load(Ordering::Relaxed),
            sms_sent: inner.sms_sent.load(Ordering::Relaxed),
            sms_failed: inner.sms_failed.load(Ordering::Relaxed),
            cadence_active: inner.cadence_active.load(Ordering::Relaxed),
        }
    }

    /// Log a health snapshot every `every` until cancelled
    pub fn spawn_reporter(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
            // First tick is immediate; nothing worth reporting yet
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match serde_json::to_string(&tracker.snapshot()) {
                            Ok(payload) => info!("[health] {}", payload),
                            Err(e) => warn!("[health] failed to serialize snapshot: {}", e),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_in_snapshot() {
        let health = HealthTracker::new();
        health.set_peer(PeerAddress::from("10.0.0.9:7792".parse::<std::net::SocketAddr>().unwrap()));
        health.set_connection(ConnectionState::Connected);
        health.increment_reconnects();
        health.record_template_fetch(true);
        health.record_template_fetch(false);
        health.record_sms(true);
        health.record_sms(true);
        health.record_sms(false);
        health.set_cadence_active(true);

        let snap = health.snapshot();
        assert_eq!(snap.peer.as_deref(), Some("10.0.0.9:7792"));
        assert_eq!(snap.connection, ConnectionState::Connected);
        assert_eq!(snap.reconnect_attempts, 1);
        assert_eq!((snap.template_fetches, snap.template_failures), (2, 1));
        assert_eq!((snap.sms_sent, snap.sms_failed), (2, 1));
        assert!(snap.cadence_active);
    }

    #[test]
    fn test_repeated_status_keeps_transition_time() {
        let health = HealthTracker::new();
        health.record_status("on");
        assert!(health.snapshot().last_transition.is_none());

        health.record_status("off");
        let first = health.snapshot().last_transition;
        assert!(first.is_some());

        health.record_status("off");
        assert_eq!(health.snapshot().last_transition, first);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(HealthTracker::new().snapshot()).unwrap();
        assert_eq!(json["connection"], "disconnected");
        assert_eq!(json["power_status"], "on");
        assert!(json["peer"].is_null());
    }
}
