//! Persistent TCP session with the UPS detector
//!
//! This module handles:
//! - Connecting to the discovered detector with TCP keepalive enabled
//! - Framing inbound status documents and outbound echoes
//! - Disconnect detection and reconnection with exponential backoff
//! - Dropping outbound frames while no connection is up

pub mod backoff;
pub mod codec;

use crate::config::SessionConfig;
use crate::models::{PeerAddress, StatusFrame};
use backoff::Backoff;
use codec::StatusCodec;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::io;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the session reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    FrameReceived(StatusFrame),
    Disconnected { reason: String },
    ReconnectScheduled(Duration),
}

/// Cheap handle used to write frames to the detector
#[derive(Debug, Clone)]
pub struct SessionHandle {
    outbound: mpsc::UnboundedSender<StatusFrame>,
}

impl SessionHandle {
    /// Queue a frame for the current connection; false once the session task is gone
    pub fn send(&self, frame: StatusFrame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    /// Handle wired to a plain receiver instead of a live connection
    #[cfg(test)]
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<StatusFrame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (Self { outbound }, rx)
    }
}

enum SessionEnd {
    Closed,
    Failed(String),
    Stopped,
}

pub struct SessionManager<E> {
    peer: PeerAddress,
    config: SessionConfig,
    events: mpsc::UnboundedSender<E>,
    cancel: CancellationToken,
    state: ConnectionState,
}

impl<E> SessionManager<E>
where
    E: From<SessionEvent> + Send + 'static,
{
    /// Start the session task; it runs until `cancel` fires or the owner goes away
    pub fn spawn(
        peer: PeerAddress,
        config: SessionConfig,
        events: mpsc::UnboundedSender<E>,
        cancel: CancellationToken,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let manager = SessionManager {
            peer,
            config,
            events,
            cancel,
            state: ConnectionState::Disconnected,
        };
        let task = tokio::spawn(manager.run(outbound_rx));
        (SessionHandle { outbound: outbound_tx }, task)
    }

    async fn run(mut self, mut outbound: mpsc::UnboundedReceiver<StatusFrame>) {
        let mut backoff = Backoff::new(self.config.reconnect_base(), self.config.reconnect_max());
        info!("Session manager started for detector {}", self.peer);

        loop {
            self.set_state(ConnectionState::Connecting);

            let connected = {
                let connect = self.connect();
                tokio::pin!(connect);
                let mut outbound_open = true;

                loop {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        result = &mut connect => break result,
                        queued = outbound.recv(), if outbound_open => match queued {
                            Some(frame) => warn!(
                                "Detector not connected yet, dropping outbound status={}",
                                frame.status
                            ),
                            None => outbound_open = false,
                        },
                    }
                }
            };

            match connected {
                Ok(stream) => {
                    backoff.reset();
                    self.set_state(ConnectionState::Connected);
                    info!("Connected to detector {}", self.peer);

                    let reason = match self.serve(stream, &mut outbound).await {
                        SessionEnd::Stopped => return,
                        SessionEnd::Closed => "closed by peer".to_string(),
                        SessionEnd::Failed(e) => e,
                    };
                    info!("Session with {} ended: {}", self.peer, reason);
                    self.emit(SessionEvent::Disconnected { reason });
                }
                Err(e) => {
                    warn!("Connect to detector {} failed: {}", self.peer, e);
                }
            }

            self.set_state(ConnectionState::Disconnected);

            let delay = backoff.next_delay();
            info!("Reconnecting to {} in {:?}", self.peer, delay);
            self.emit(SessionEvent::ReconnectScheduled(delay));

            if !self.wait_before_reconnect(delay, &mut outbound).await {
                return;
            }
        }
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        let addr = self.peer.socket_addr();
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;

        let timeout = Duration::from_secs(self.config.connect_timeout_secs.max(1));
        let stream = tokio::time::timeout(timeout, socket.connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

        tune_keepalive(&stream, self.config.keepalive_secs);
        Ok(stream)
    }

    async fn serve(
        &mut self,
        stream: TcpStream,
        outbound: &mut mpsc::UnboundedReceiver<StatusFrame>,
    ) -> SessionEnd {
        let mut framed = Framed::new(stream, StatusCodec::new(self.config.max_frame_bytes));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Stopped,

                inbound = framed.next() => match inbound {
                    Some(Ok(frame)) => {
                        debug!("Received from detector: {:?}", frame);
                        if !self.emit(SessionEvent::FrameReceived(frame)) {
                            return SessionEnd::Stopped;
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                    None => return SessionEnd::Closed,
                },

                queued = outbound.recv() => match queued {
                    Some(frame) => {
                        let status = frame.status.clone();
                        if let Err(e) = framed.send(frame).await {
                            return SessionEnd::Failed(format!("write failed: {}", e));
                        }
                        debug!("Sent to detector: status={}", status);
                    }
                    None => return SessionEnd::Stopped,
                },
            }
        }
    }

    /// Sleep out the backoff; frames queued meanwhile are stale and dropped
    async fn wait_before_reconnect(
        &self,
        delay: Duration,
        outbound: &mut mpsc::UnboundedReceiver<StatusFrame>,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let mut outbound_open = true;

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = self.cancel.cancelled() => return false,
                queued = outbound.recv(), if outbound_open => match queued {
                    Some(frame) => warn!(
                        "Detector not connected, dropping outbound status={}",
                        frame.status
                    ),
                    None => outbound_open = false,
                },
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SessionEvent) -> bool {
        self.events.send(E::from(event)).is_ok()
    }
}

#[cfg(target_os = "linux")]
fn tune_keepalive(stream: &TcpStream, idle_secs: u64) {
    use nix::sys::socket::{setsockopt, sockopt};

    let secs = u32::try_from(idle_secs.max(1)).unwrap_or(u32::MAX);
    if let Err(e) = setsockopt(stream, sockopt::TcpKeepIdle, &secs) {
        debug!("Could not set TCP_KEEPIDLE: {}", e);
    }
    if let Err(e) = setsockopt(stream, sockopt::TcpKeepInterval, &secs) {
        debug!("Could not set TCP_KEEPINTVL: {}", e);
    }
}

#[cfg(not(target_os = "linux"))]
fn tune_keepalive(_stream: &TcpStream, _idle_secs: u64) {}
