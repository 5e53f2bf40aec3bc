use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;

/// Detector address learned from the first discovery reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeerAddress {
    pub host: std::net::IpAddr,
    pub port: u16,
}

impl PeerAddress {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn with_port(self, port: Option<u16>) -> Self {
        Self {
            host: self.host,
            port: port.unwrap_or(self.port),
        }
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self { host: addr.ip(), port: addr.port() }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// One `{"status": ...}` document on the session stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFrame {
    pub status: String,
}

// ===== Cloud API payloads =====

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub expires_in: u64,
}

#[derive(Debug, Deserialize)]
pub struct TemplateEnvelope {
    pub data: TemplateData,
}

#[derive(Debug, Deserialize)]
pub struct TemplateData {
    #[serde(default)]
    pub alert_time: Option<i64>,
    #[serde(default)]
    pub rendered_template: Option<String>,
    #[serde(default)]
    pub receiver_users: Option<Vec<ReceiverUser>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverUser {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmsMessage {
    pub phone: String,
    pub sms: String,
    pub user_id: Value,
}

// ===== Notification template snapshot =====

#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
    pub id: Option<Value>,
    pub phone_number: Option<String>,
}

impl Recipient {
    /// Both fields present and non-empty; anything else is skipped by a pass
    pub fn deliverable(&self) -> Option<(&Value, &str)> {
        let id = self.id.as_ref().filter(|id| match id {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        })?;
        let phone = self
            .phone_number
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())?;
        Some((id, phone))
    }
}

/// Fetched once per power-loss event and never mutated afterwards
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationTemplate {
    pub alert_interval_minutes: u32,
    pub body: String,
    pub recipients: Vec<Recipient>,
}

impl NotificationTemplate {
    pub fn from_api(data: TemplateData, default_minutes: u32) -> Result<Self, String> {
        let body = data
            .rendered_template
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| "rendered_template is missing".to_string())?;

        let alert_interval_minutes = match data.alert_time {
            Some(minutes) if minutes >= 1 => u32::try_from(minutes).unwrap_or(u32::MAX),
            _ => default_minutes.max(1),
        };

        let recipients = data
            .receiver_users
            .unwrap_or_default()
            .into_iter()
            .map(|u| Recipient { id: u.id, phone_number: u.phone })
            .collect();

        Ok(Self { alert_interval_minutes, body, recipients })
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.alert_interval_minutes.max(1)) * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> TemplateData {
        serde_json::from_value::<TemplateEnvelope>(value).unwrap().data
    }

    #[test]
    fn test_template_defaults() {
        let data = parse(json!({"data": {"rendered_template": "Power cut at site A"}}));
        let tpl = NotificationTemplate::from_api(data, 15).unwrap();
        assert_eq!(tpl.alert_interval_minutes, 15);
        assert!(tpl.recipients.is_empty());
        assert_eq!(tpl.interval(), std::time::Duration::from_secs(900));
    }

    #[test]
    fn test_template_zero_alert_time_falls_back() {
        let data = parse(json!({"data": {"alert_time": 0, "rendered_template": "x"}}));
        assert_eq!(NotificationTemplate::from_api(data, 15).unwrap().alert_interval_minutes, 15);
    }

    #[test]
    fn test_template_requires_body() {
        let data = parse(json!({"data": {"alert_time": 5, "receiver_users": []}}));
        assert!(NotificationTemplate::from_api(data, 15).is_err());
    }

    #[test]
    fn test_recipient_deliverable() {
        let full = Recipient { id: Some(json!(7)), phone_number: Some("+84901234567".into()) };
        assert_eq!(full.deliverable(), Some((&json!(7), "+84901234567")));

        let no_phone = Recipient { id: Some(json!(7)), phone_number: Some("  ".into()) };
        assert!(no_phone.deliverable().is_none());

        let null_id = Recipient { id: Some(Value::Null), phone_number: Some("123".into()) };
        assert!(null_id.deliverable().is_none());
    }

    #[test]
    fn test_peer_address_port_override() {
        let peer = PeerAddress::from("192.168.1.40:7792".parse::<SocketAddr>().unwrap());
        assert_eq!(peer.with_port(None).port, 7792);
        assert_eq!(peer.with_port(Some(9000)).to_string(), "192.168.1.40:9000");
    }
}
