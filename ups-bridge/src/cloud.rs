//! Authenticated client for the notification cloud API
//!
//! Holds one bearer credential, refreshed when it gets close to expiry or
//! when the API answers 401. Every authenticated call is retried exactly once
//! after a forced refresh.

use crate::config::CloudConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::models::{LoginResponse, NotificationTemplate, SmsMessage, TemplateEnvelope};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const LOGIN_PATH: &str = "/login";
const TEMPLATE_PATH: &str = "/email-templates/power-cut-template";
const SMS_PATH: &str = "/sms-notifications";

/// What the notification workflow needs from the cloud
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn fetch_template(&self) -> BridgeResult<NotificationTemplate>;
    async fn send_sms(&self, message: &SmsMessage) -> BridgeResult<()>;
}

struct Credential {
    token: String,
    expires_at: Instant,
}

pub struct CloudAuthClient {
    config: CloudConfig,
    default_alert_minutes: u32,
    http: reqwest::Client,
    credential: Mutex<Option<Credential>>,
}

impl CloudAuthClient {
    pub fn new(config: CloudConfig, default_alert_minutes: u32) -> BridgeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            config,
            default_alert_minutes,
            http,
            credential: Mutex::new(None),
        })
    }

    /// Current bearer token, logging in first if none is held or it is about to expire
    pub async fn ensure_credential(&self) -> BridgeResult<String> {
        let mut held = self.credential.lock().await;
        if let Some(credential) = held.as_ref() {
            if Instant::now() < credential.expires_at {
                return Ok(credential.token.clone());
            }
            debug!("Cloud credential expired, logging in again");
        }

        let fresh = self.login().await?;
        let token = fresh.token.clone();
        *held = Some(fresh);
        Ok(token)
    }

    /// Drop the held credential and log in again
    pub async fn refresh_credential(&self) -> BridgeResult<String> {
        let mut held = self.credential.lock().await;
        *held = None;
        let fresh = self.login().await?;
        let token = fresh.token.clone();
        *held = Some(fresh);
        Ok(token)
    }

    async fn login(&self) -> BridgeResult<Credential> {
        let url = self.config.endpoint(LOGIN_PATH);
        let form = [
            ("username", self.config.username.as_str()),
            ("password", self.config.password_or_default()),
        ];

        let response = self.http.post(&url).form(&form).send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BridgeError::Auth(format!(
                "login as '{}' rejected with {}",
                self.config.username, status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Upstream {
                method: "POST",
                url,
                status: status.as_u16(),
                body,
            });
        }

        let login: LoginResponse = response.json().await?;
        let margin = Duration::from_secs(self.config.token_safety_margin_secs);
        let lifetime = Duration::from_secs(login.expires_in).saturating_sub(margin);

        info!("Logged in to cloud API as '{}' (token valid {:?})", self.config.username, lifetime);
        Ok(Credential {
            token: login.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }

    pub async fn get_json(&self, path: &str) -> BridgeResult<Value> {
        self.send_authorized("GET", path, None).await
    }

    pub async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> BridgeResult<Value> {
        let body = serde_json::to_value(body)
            .map_err(|e| BridgeError::Protocol(format!("unserializable request body: {}", e)))?;
        self.send_authorized("POST", path, Some(&body)).await
    }

    async fn send_authorized(
        &self,
        method: &'static str,
        path: &str,
        body: Option<&Value>,
    ) -> BridgeResult<Value> {
        let url = self.config.endpoint(path);

        let token = self.ensure_credential().await?;
        let mut response = self.request(method, &url, &token, body).send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("{} {} returned 401, refreshing credential", method, url);
            let token = self.refresh_credential().await?;
            response = self.request(method, &url, &token, body).send().await?;

            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(BridgeError::Auth(format!(
                    "{} {} still unauthorized after refresh",
                    method, url
                )));
            }
        }

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(BridgeError::Upstream {
                method,
                url,
                status: status.as_u16(),
                body: text,
            });
        }

        // Success bodies are not always JSON
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    fn request(
        &self,
        method: &'static str,
        url: &str,
        token: &str,
        body: Option<&Value>,
    ) -> reqwest::RequestBuilder {
        let builder = match method {
            "GET" => self.http.get(url),
            _ => self.http.post(url),
        };
        let builder = builder.bearer_auth(token);
        match body {
            Some(body) => builder.json(body),
            None => builder,
        }
    }
}

#[async_trait]
impl CloudApi for CloudAuthClient {
    async fn fetch_template(&self) -> BridgeResult<NotificationTemplate> {
        let value = self.get_json(TEMPLATE_PATH).await?;
        let envelope: TemplateEnvelope = serde_json::from_value(value)
            .map_err(|e| BridgeError::InvalidTemplate(e.to_string()))?;
        NotificationTemplate::from_api(envelope.data, self.default_alert_minutes)
            .map_err(BridgeError::InvalidTemplate)
    }

    async fn send_sms(&self, message: &SmsMessage) -> BridgeResult<()> {
        self.post_json(SMS_PATH, message).await?;
        Ok(())
    }
}
