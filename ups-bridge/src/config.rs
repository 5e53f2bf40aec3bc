//! Configuration management with secure storage
//!
//! Handles:
//! - Cloud API endpoint and credentials (password kept out of the file)
//! - Discovery probe settings
//! - Session reconnect/keepalive tuning
//! - Notification and health report cadence

use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

const KEYRING_SERVICE: &str = "ups-bridge";
const KEYRING_USER: &str = "cloud-password";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub cloud: CloudConfig,
    pub discovery: DiscoveryConfig,
    pub session: SessionConfig,
    pub notify: NotifyConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub base_url: String,
    pub api_prefix: String,
    pub username: String,
    #[serde(skip_serializing)] // Never written back to disk
    pub password: Option<String>,
    pub use_keyring: bool,
    pub request_timeout_secs: u64,
    pub token_safety_margin_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Local UDP port the bridge binds; the detector answers to it
    pub listen_port: u16,
    /// UDP port the detector listens on for probes
    pub device_port: u16,
    pub broadcast_addr: Ipv4Addr,
    /// Also probe the directed broadcast address of every IPv4 interface
    pub interface_broadcasts: bool,
    pub probe_payload: String,
    pub reply_payload: String,
    pub interval_ms: u64,
    /// None keeps probing forever
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Fixed TCP port; None uses the source port of the discovery reply
    pub port: Option<u16>,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub keepalive_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub default_alert_minutes: u32,
    pub template_retry_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub report_interval_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: "https://myapi".to_string(),
            api_prefix: "/api/v1".to_string(),
            username: "admin".to_string(),
            password: None,
            use_keyring: false,
            request_timeout_secs: 10,
            token_safety_margin_secs: 30,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            listen_port: 7792,
            device_port: 7792,
            broadcast_addr: Ipv4Addr::BROADCAST,
            interface_broadcasts: true,
            probe_payload: "Where are you?".to_string(),
            reply_payload: "Here I am".to_string(),
            interval_ms: 1000,
            timeout_secs: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: None,
            reconnect_base_ms: 1000,
            reconnect_max_ms: 15000,
            keepalive_secs: 3,
            connect_timeout_secs: 5,
            max_frame_bytes: 4096,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            default_alert_minutes: 15,
            template_retry_secs: 30,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 300,
        }
    }
}

impl CloudConfig {
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}{}{}",
            self.base_url.trim_end_matches('/'),
            self.api_prefix.trim_end_matches('/'),
            path
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn password_or_default(&self) -> &str {
        self.password.as_deref().unwrap_or("admin")
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl SessionConfig {
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_base_ms))
    }
}

impl BridgeConfig {
    /// Load config from `$UPS_BRIDGE_CONFIG` or the OS-specific location,
    /// then apply environment overrides
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        let mut config = if config_path.exists() {
            Self::load_from(&config_path).await?
        } else {
            info!("No config at {}, writing defaults", config_path.display());
            let config = Self::default();
            if let Err(e) = config.save_to(&config_path).await {
                warn!("Could not write default config: {:#}", e);
            }
            config
        };

        config.apply_overrides(|key| std::env::var(key).ok());

        if config.cloud.password.is_none() && config.cloud.use_keyring {
            match Self::load_password() {
                Ok(password) => config.cloud.password = Some(password),
                Err(e) => warn!("Cloud password not found in keyring: {}", e),
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub async fn load_from(path: &std::path::Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Save config (without the password) and push the password to the keyring if enabled
    pub async fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;

        if self.cloud.use_keyring {
            if let Some(password) = &self.cloud.password {
                Self::save_password(password)?;
            }
        }

        Ok(())
    }

    /// Environment overrides, usually set through a `.env` file
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CLOUD_URL").filter(|v| !v.is_empty()) {
            self.cloud.base_url = url;
        }
        if let Some(username) = lookup("CLOUD_USERNAME").filter(|v| !v.is_empty()) {
            self.cloud.username = username;
        }
        if let Some(password) = lookup("CLOUD_PASSWORD") {
            self.cloud.password = Some(password);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.discovery.probe_payload.is_empty() || self.discovery.reply_payload.trim().is_empty() {
            return Err(crate::error::BridgeError::Config(
                "discovery probe and reply payloads must not be empty".to_string(),
            )
            .into());
        }
        if self.session.reconnect_base_ms == 0 {
            return Err(crate::error::BridgeError::Config(
                "session.reconnect_base_ms must be at least 1".to_string(),
            )
            .into());
        }
        if self.cloud.request_timeout_secs == 0 {
            return Err(crate::error::BridgeError::Config(
                "cloud.request_timeout_secs must be at least 1".to_string(),
            )
            .into());
        }
        if self.notify.default_alert_minutes == 0 {
            return Err(crate::error::BridgeError::Config(
                "notify.default_alert_minutes must be at least 1".to_string(),
            )
            .into());
        }
        Ok(())
    }

    /// Get config file path, `$UPS_BRIDGE_CONFIG` taking precedence
    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("UPS_BRIDGE_CONFIG") {
            return Ok(PathBuf::from(path));
        }

        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("ups-bridge");
        path.push("config.toml");
        Ok(path)
    }

    /// Load password from secure OS keyring
    fn load_password() -> Result<String> {
        let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)?;
        entry.get_password().map_err(Into::into)
    }

    /// Save password to secure OS keyring
    fn save_password(password: &str) -> Result<()> {
        let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)?;
        entry.set_password(password).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.discovery.listen_port, 7792);
        assert_eq!(config.discovery.probe_payload, "Where are you?");
        assert_eq!(config.discovery.reply_payload, "Here I am");
        assert_eq!(config.session.reconnect_base(), Duration::from_secs(1));
        assert_eq!(config.session.reconnect_max(), Duration::from_secs(15));
        assert_eq!(config.notify.default_alert_minutes, 15);
        assert!(config.discovery.timeout().is_none());
    }

    #[test]
    fn test_endpoint_joins_prefix() {
        let mut cloud = CloudConfig::default();
        cloud.base_url = "https://api.example.com/".to_string();
        assert_eq!(
            cloud.endpoint("/login"),
            "https://api.example.com/api/v1/login"
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: BridgeConfig = toml::from_str(
            r#"
            [cloud]
            base_url = "http://10.0.0.5:8000"

            [discovery]
            timeout_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.cloud.base_url, "http://10.0.0.5:8000");
        assert_eq!(config.cloud.username, "admin");
        assert_eq!(config.discovery.timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.session.keepalive_secs, 3);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CLOUD_URL", "https://cloud.local"),
            ("CLOUD_USERNAME", "ops"),
            ("CLOUD_PASSWORD", "s3cret"),
        ]
        .into_iter()
        .collect();

        let mut config = BridgeConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.cloud.base_url, "https://cloud.local");
        assert_eq!(config.cloud.username, "ops");
        assert_eq!(config.cloud.password_or_default(), "s3cret");
    }

    #[test]
    fn test_validate_rejects_empty_reply() {
        let mut config = BridgeConfig::default();
        config.discovery.reply_payload = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_request_timeout() {
        let mut config = BridgeConfig::default();
        config.cloud.request_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("request_timeout_secs"));
    }

    #[tokio::test]
    async fn test_save_never_writes_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = BridgeConfig::default();
        config.cloud.password = Some("hunter2".to_string());
        config.save_to(&path).await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("hunter2"));

        let reloaded = BridgeConfig::load_from(&path).await.unwrap();
        assert!(reloaded.cloud.password.is_none());
        assert_eq!(reloaded.discovery.interval(), Duration::from_millis(1000));
    }
}
