//! In-process cloud double for scheduler and coordinator tests

use crate::cloud::CloudApi;
use crate::error::{BridgeError, BridgeResult};
use crate::models::{NotificationTemplate, Recipient, SmsMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Template with one recipient per phone, ids counting from 1
pub fn template(minutes: u32, phones: &[&str]) -> NotificationTemplate {
    NotificationTemplate {
        alert_interval_minutes: minutes,
        body: "Power cut detected".to_string(),
        recipients: phones
            .iter()
            .enumerate()
            .map(|(i, phone)| Recipient {
                id: Some(json!(i + 1)),
                phone_number: Some(phone.to_string()),
            })
            .collect(),
    }
}

#[derive(Default)]
pub struct MockCloud {
    template: Mutex<Option<NotificationTemplate>>,
    fetches: AtomicUsize,
    fetch_failures_left: AtomicUsize,
    fetch_delay: Mutex<Duration>,
    failing_phones: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<String>>,
    delivered: Mutex<Vec<SmsMessage>>,
}

impl MockCloud {
    pub fn with_template(template: NotificationTemplate) -> Arc<Self> {
        let cloud = Self::default();
        *cloud.template.lock() = Some(template);
        Arc::new(cloud)
    }

    pub fn fail_phone(&self, phone: &str) {
        self.failing_phones.lock().insert(phone.to_string());
    }

    pub fn fail_next_fetches(&self, n: usize) {
        self.fetch_failures_left.store(n, Ordering::SeqCst);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Phones in send order, failed sends included
    pub fn attempted(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }

    pub fn delivered(&self) -> Vec<SmsMessage> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl CloudApi for MockCloud {
    async fn fetch_template(&self) -> BridgeResult<NotificationTemplate> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let delay = *self.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .fetch_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BridgeError::Upstream {
                method: "GET",
                url: "mock://template".to_string(),
                status: 503,
                body: "unavailable".to_string(),
            });
        }

        self.template
            .lock()
            .clone()
            .ok_or_else(|| BridgeError::InvalidTemplate("no template configured".to_string()))
    }

    async fn send_sms(&self, message: &SmsMessage) -> BridgeResult<()> {
        self.attempts.lock().push(message.phone.clone());

        if self.failing_phones.lock().contains(&message.phone) {
            return Err(BridgeError::Upstream {
                method: "POST",
                url: "mock://sms".to_string(),
                status: 500,
                body: "rejected".to_string(),
            });
        }

        self.delivered.lock().push(message.clone());
        Ok(())
    }
}
