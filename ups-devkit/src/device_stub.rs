/*!
Détecteur UPS simulé pour développement sans matériel

Reproduit le protocole du détecteur:
- Répondeur UDP à la sonde de découverte ("Where are you?" -> "Here I am")
- Serveur TCP qui envoie des documents `{"status": ...}` sans retour à la ligne
- Enregistre toutes les trames renvoyées par le bridge
*/

use anyhow::{Context, Result};
use serde_json::Value;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct MockDeviceConfig {
    pub bind_ip: Ipv4Addr,
    /// 0 = port éphémère
    pub discovery_port: u16,
    pub session_port: u16,
    pub probe_payload: String,
    pub reply_payload: String,
    /// Nombre de sondes ignorées avant de répondre
    pub silent_probes: u32,
    /// Port de réponse fixe (le vrai firmware répond toujours sur 7792);
    /// None = port source de la sonde
    pub reply_port: Option<u16>,
}

impl Default for MockDeviceConfig {
    fn default() -> Self {
        Self {
            bind_ip: Ipv4Addr::LOCALHOST,
            discovery_port: 0,
            session_port: 0,
            probe_payload: "Where are you?".to_string(),
            reply_payload: "Here I am".to_string(),
            silent_probes: 0,
            reply_port: None,
        }
    }
}

#[derive(Default)]
struct DeviceState {
    probes: AtomicU32,
    connections: AtomicU32,
    received: Mutex<Vec<Value>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
}

/// Détecteur simulé: découverte UDP + session TCP sur localhost
pub struct MockUpsDevice {
    discovery_port: u16,
    session_port: u16,
    state: Arc<DeviceState>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockUpsDevice {
    /// Démarre le répondeur UDP et le serveur TCP
    pub async fn start(config: MockDeviceConfig) -> Result<Self> {
        let udp = UdpSocket::bind(SocketAddr::from((config.bind_ip, config.discovery_port)))
            .await
            .context("bind UDP discovery socket")?;
        let listener = TcpListener::bind(SocketAddr::from((config.bind_ip, config.session_port)))
            .await
            .context("bind TCP session listener")?;

        let discovery_port = udp.local_addr()?.port();
        let session_port = listener.local_addr()?.port();
        let state = Arc::new(DeviceState::default());

        let tasks = vec![
            tokio::spawn(run_responder(udp, config, Arc::clone(&state))),
            tokio::spawn(run_server(listener, Arc::clone(&state))),
        ];

        log::info!(
            "🔌 [MOCK UPS] discovery on :{}, session on :{}",
            discovery_port,
            session_port
        );

        Ok(Self {
            discovery_port,
            session_port,
            state,
            tasks,
        })
    }

    pub fn discovery_port(&self) -> u16 {
        self.discovery_port
    }

    pub fn session_port(&self) -> u16 {
        self.session_port
    }

    /// Sondes valides reçues (ignorées ou non)
    pub fn probes_received(&self) -> u32 {
        self.state.probes.load(Ordering::SeqCst)
    }

    pub fn connections_accepted(&self) -> u32 {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Attend qu'au moins `count` connexions aient été acceptées
    pub async fn wait_for_connections(&self, count: u32, timeout: Duration) -> bool {
        poll_until(timeout, || self.connections_accepted() >= count).await
    }

    /// Envoie un statut comme le firmware: JSON sans séparateur
    pub async fn send_status(&self, status: &str) -> Result<()> {
        let payload = UpsMessageBuilder::to_wire(&UpsMessageBuilder::status(status));
        self.send_raw(&payload).await
    }

    /// Écrit des octets bruts sur la connexion courante
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.state.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("no bridge connected"))?;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        log::debug!("📤 [MOCK UPS] sent {} bytes", bytes.len());
        Ok(())
    }

    /// Ferme la connexion courante côté détecteur
    pub async fn drop_connection(&self) {
        if let Some(mut stream) = self.state.writer.lock().await.take() {
            let _ = stream.shutdown().await;
            log::info!("✂️ [MOCK UPS] connection dropped");
        }
    }

    /// Trames JSON reçues du bridge, dans l'ordre
    pub fn received_frames(&self) -> Vec<Value> {
        self.state.received.lock().unwrap().clone()
    }

    /// Valeurs `status` des trames reçues
    pub fn received_statuses(&self) -> Vec<String> {
        self.received_frames()
            .iter()
            .filter_map(|frame| frame.get("status").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }

    /// Attend qu'au moins `count` trames portant `status` soient arrivées
    pub async fn wait_for_status(&self, status: &str, count: usize, timeout: Duration) -> bool {
        poll_until(timeout, || {
            self.received_statuses().iter().filter(|s| *s == status).count() >= count
        })
        .await
    }

    pub fn clear(&self) {
        self.state.received.lock().unwrap().clear();
    }

    /// Arrête les tâches du détecteur
    pub async fn stop(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.state.writer.lock().await.take();
    }
}

impl Drop for MockUpsDevice {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn poll_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

async fn run_responder(socket: UdpSocket, config: MockDeviceConfig, state: Arc<DeviceState>) {
    let mut buf = [0u8; 256];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                log::warn!("[MOCK UPS] UDP receive error: {}", e);
                continue;
            }
        };

        // Le firmware compare la charge utile exacte
        if &buf[..len] != config.probe_payload.as_bytes() {
            continue;
        }

        let n = state.probes.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= config.silent_probes {
            log::debug!("🤫 [MOCK UPS] ignoring probe #{} from {}", n, from);
            continue;
        }

        let target = SocketAddr::new(from.ip(), config.reply_port.unwrap_or(from.port()));
        if let Err(e) = socket.send_to(config.reply_payload.as_bytes(), target).await {
            log::warn!("[MOCK UPS] reply to {} failed: {}", target, e);
        } else {
            log::info!("📡 [MOCK UPS] answered probe #{} from {}", n, target);
        }
    }
}

async fn run_server(listener: TcpListener, state: Arc<DeviceState>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("[MOCK UPS] accept error: {}", e);
                continue;
            }
        };

        state.connections.fetch_add(1, Ordering::SeqCst);
        log::info!("🤝 [MOCK UPS] bridge connected from {}", peer);

        let (read_half, write_half) = stream.into_split();
        // Une seule session à la fois, comme le firmware
        *state.writer.lock().await = Some(write_half);

        let reader_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<Value>(line.trim()) {
                    Ok(frame) => {
                        log::debug!("📥 [MOCK UPS] received {}", frame);
                        reader_state.received.lock().unwrap().push(frame);
                    }
                    Err(e) => log::warn!("[MOCK UPS] bad frame '{}': {}", line, e),
                }
            }
        });
    }
}

/// Construit les messages au format du détecteur
pub struct UpsMessageBuilder;

impl UpsMessageBuilder {
    pub fn status(status: &str) -> Value {
        serde_json::json!({ "status": status })
    }

    /// Accusé de réception envoyé par le firmware
    pub fn message(text: &str) -> Value {
        serde_json::json!({ "message": text })
    }

    /// Encodage fil: JSON compact, sans retour à la ligne
    pub fn to_wire(value: &Value) -> Vec<u8> {
        value.to_string().into_bytes()
    }
}
