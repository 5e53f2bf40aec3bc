//! Coordinating task
//!
//! Owns the status machine, the notification scheduler, the session handle
//! and the pending template fetch. Every other component reports to it over
//! one event channel, so frames are handled strictly in arrival order and no
//! state is shared between tasks.

use crate::cloud::CloudApi;
use crate::config::BridgeConfig;
use crate::discovery::PeerLocator;
use crate::error::{BridgeError, BridgeResult};
use crate::health::HealthTracker;
use crate::models::{NotificationTemplate, PeerAddress, StatusFrame};
use crate::notifier::NotificationScheduler;
use crate::session::{SessionEvent, SessionHandle, SessionManager};
use crate::status::{PowerStatus, StatusMachine, Transition};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub enum BridgeEvent {
    PeerFound(PeerAddress),
    DiscoveryFailed(BridgeError),
    Session(SessionEvent),
    TemplateFetched {
        generation: u64,
        result: BridgeResult<NotificationTemplate>,
    },
}

impl From<SessionEvent> for BridgeEvent {
    fn from(event: SessionEvent) -> Self {
        BridgeEvent::Session(event)
    }
}

pub struct Bridge {
    config: BridgeConfig,
    api: Arc<dyn CloudApi>,
    health: HealthTracker,
    cancel: CancellationToken,
    events_tx: mpsc::UnboundedSender<BridgeEvent>,
    events_rx: mpsc::UnboundedReceiver<BridgeEvent>,
    machine: StatusMachine,
    scheduler: NotificationScheduler,
    peer: Option<PeerAddress>,
    session: Option<SessionHandle>,
    /// Bumped on every power transition; fetch results from older generations are stale
    generation: u64,
    pending_fetch: Option<JoinHandle<()>>,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        api: Arc<dyn CloudApi>,
        health: HealthTracker,
        cancel: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let scheduler = NotificationScheduler::new(Arc::clone(&api), health.clone(), cancel.clone());

        Self {
            config,
            api,
            health,
            cancel,
            events_tx,
            events_rx,
            machine: StatusMachine::new(),
            scheduler,
            peer: None,
            session: None,
            generation: 0,
            pending_fetch: None,
        }
    }

    /// Discover the detector, then serve events until cancelled.
    /// Only a discovery failure ends this early.
    pub async fn run(mut self) -> BridgeResult<()> {
        let locator = self.spawn_locator();

        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                event = self.events_rx.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event) {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
            }
        };

        locator.abort();
        self.shutdown();
        outcome
    }

    fn spawn_locator(&self) -> JoinHandle<()> {
        let locator = PeerLocator::new(self.config.discovery.clone());
        let events = self.events_tx.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                found = locator.locate() => {
                    let event = match found {
                        Ok(peer) => BridgeEvent::PeerFound(peer),
                        Err(e) => BridgeEvent::DiscoveryFailed(e),
                    };
                    let _ = events.send(event);
                }
            }
        })
    }

    fn handle_event(&mut self, event: BridgeEvent) -> BridgeResult<()> {
        match event {
            BridgeEvent::PeerFound(peer) => self.on_peer_found(peer),
            BridgeEvent::DiscoveryFailed(e) => {
                error!("Discovery failed: {}", e);
                return Err(e);
            }
            BridgeEvent::Session(SessionEvent::FrameReceived(frame)) => self.on_frame(frame),
            BridgeEvent::Session(SessionEvent::StateChanged(state)) => {
                debug!("Session state: {:?}", state);
                self.health.set_connection(state);
            }
            BridgeEvent::Session(SessionEvent::ReconnectScheduled(_)) => {
                self.health.increment_reconnects();
            }
            BridgeEvent::Session(SessionEvent::Disconnected { reason }) => {
                warn!("Detector connection lost: {}", reason);
            }
            BridgeEvent::TemplateFetched { generation, result } => {
                self.on_template_fetched(generation, result)
            }
        }
        Ok(())
    }

    fn on_peer_found(&mut self, peer: PeerAddress) {
        if let Some(current) = self.peer {
            debug!("Ignoring discovery reply from {}, already bound to {}", peer, current);
            return;
        }

        let target = peer.with_port(self.config.session.port);
        info!("Using detector at {}", target);
        self.peer = Some(target);
        self.health.set_peer(target);

        let (handle, _task) = SessionManager::spawn(
            target,
            self.config.session.clone(),
            self.events_tx.clone(),
            self.cancel.child_token(),
        );
        self.session = Some(handle);
    }

    fn on_frame(&mut self, frame: StatusFrame) {
        let status = PowerStatus::parse(&frame.status);

        // Repeats are acknowledged too; the detector resends until it sees one
        self.echo(&status);

        match self.machine.evaluate(&status) {
            Transition::Repeat => debug!("Status '{}' unchanged", status),
            Transition::PowerLost => {
                warn!("⚡ Power lost");
                self.begin_power_loss();
            }
            Transition::PowerRestored => {
                info!("💡 Power restored");
                self.restore_power();
            }
            Transition::Unexpected { from, to } => {
                warn!("Unexpected status transition '{}' -> '{}', ignoring", from, to);
                if to == PowerStatus::On && self.scheduler.is_active() {
                    warn!(
                        "Power reported on after '{}' but notification cadence is still running",
                        from
                    );
                }
            }
        }

        self.machine.commit(status);
        self.health.record_status(self.machine.last().as_str());
    }

    fn echo(&self, status: &PowerStatus) {
        match &self.session {
            Some(session) => {
                if !session.send(status.to_frame()) {
                    warn!("Session task gone, echo '{}' dropped", status);
                }
            }
            None => warn!("No session, echo '{}' dropped", status),
        }
    }

    fn begin_power_loss(&mut self) {
        self.generation += 1;
        self.cancel_pending_fetch();
        self.spawn_fetch(Duration::ZERO);
    }

    fn restore_power(&mut self) {
        self.generation += 1;
        self.cancel_pending_fetch();
        self.scheduler.stop();
    }

    fn spawn_fetch(&mut self, delay: Duration) {
        let generation = self.generation;
        let api = Arc::clone(&self.api);
        let health = self.health.clone();
        let events = self.events_tx.clone();

        self.pending_fetch = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = api.fetch_template().await;
            health.record_template_fetch(result.is_ok());
            let _ = events.send(BridgeEvent::TemplateFetched { generation, result });
        }));
    }

    fn cancel_pending_fetch(&mut self) {
        if let Some(fetch) = self.pending_fetch.take() {
            fetch.abort();
            debug!("Pending template fetch cancelled");
        }
    }

    fn on_template_fetched(&mut self, generation: u64, result: BridgeResult<NotificationTemplate>) {
        if generation != self.generation || *self.machine.last() != PowerStatus::Off {
            debug!("Discarding superseded template fetch (generation {})", generation);
            return;
        }
        self.pending_fetch = None;

        match result {
            Ok(template) => {
                self.scheduler.start(Some(template));
            }
            Err(e) => {
                let retry = Duration::from_secs(self.config.notify.template_retry_secs.max(1));
                if e.is_transient() {
                    warn!("Template fetch failed: {}, retrying in {:?}", e, retry);
                } else {
                    error!("Template fetch failed: {}, retrying in {:?}", e, retry);
                }
                self.spawn_fetch(retry);
            }
        }
    }

    fn shutdown(&mut self) {
        self.cancel_pending_fetch();
        self.scheduler.stop();
        self.cancel.cancel();
        info!("Bridge stopped");
    }
}
