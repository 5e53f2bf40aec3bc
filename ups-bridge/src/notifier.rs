//! Recurring SMS notifications while power is off
//!
//! A cadence is bound to one template snapshot: one pass right away, then one
//! every `alert_interval_minutes` until stopped. At most one cadence runs at a
//! time and starting a new one always stops the previous one first.

use crate::cloud::CloudApi;
use crate::health::HealthTracker;
use crate::models::{NotificationTemplate, SmsMessage};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one pass over the recipient list
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

struct ActiveCadence {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct NotificationScheduler {
    api: Arc<dyn CloudApi>,
    health: HealthTracker,
    shutdown: CancellationToken,
    active: Option<ActiveCadence>,
}

impl NotificationScheduler {
    pub fn new(api: Arc<dyn CloudApi>, health: HealthTracker, shutdown: CancellationToken) -> Self {
        Self {
            api,
            health,
            shutdown,
            active: None,
        }
    }

    /// Replace any running cadence with one for `template`. Without a template the
    /// running cadence is still stopped and nothing new starts.
    pub fn start(&mut self, template: Option<NotificationTemplate>) -> bool {
        self.stop();

        let Some(template) = template else {
            debug!("No notification template, cadence not started");
            return false;
        };

        info!(
            "Starting notification cadence: every {} min to {} recipient(s)",
            template.alert_interval_minutes,
            template.recipients.len()
        );

        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(run_cadence(
            Arc::clone(&self.api),
            self.health.clone(),
            template,
            cancel.clone(),
        ));

        self.active = Some(ActiveCadence { cancel, task });
        self.health.set_cadence_active(true);
        true
    }

    /// Safe to call when nothing runs; returns whether a cadence was stopped
    pub fn stop(&mut self) -> bool {
        match self.active.take() {
            Some(active) => {
                active.cancel.cancel();
                active.task.abort();
                self.health.set_cadence_active(false);
                info!("Notification cadence stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .map(|active| !active.task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for NotificationScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_cadence(
    api: Arc<dyn CloudApi>,
    health: HealthTracker,
    template: NotificationTemplate,
    cancel: CancellationToken,
) {
    let mut ticker = interval(template.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pass_no: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        pass_no += 1;
        tokio::select! {
            _ = cancel.cancelled() => break,
            report = run_pass(api.as_ref(), &health, &template) => {
                if report.failed > 0 {
                    warn!(
                        "Notification pass #{}: {} sent, {} skipped, {} failed",
                        pass_no, report.sent, report.skipped, report.failed
                    );
                } else {
                    info!(
                        "Notification pass #{}: {} sent, {} skipped",
                        pass_no, report.sent, report.skipped
                    );
                }
            }
        }
    }

    debug!("Notification cadence task exiting after {} pass(es)", pass_no);
}

/// Send to every deliverable recipient in order. One failed send never stops the others.
pub async fn run_pass(
    api: &dyn CloudApi,
    health: &HealthTracker,
    template: &NotificationTemplate,
) -> PassReport {
    let mut report = PassReport::default();

    for (index, recipient) in template.recipients.iter().enumerate() {
        let Some((id, phone)) = recipient.deliverable() else {
            debug!("Skipping recipient #{}: missing id or phone", index);
            report.skipped += 1;
            continue;
        };

        let message = SmsMessage {
            phone: phone.to_string(),
            sms: template.body.clone(),
            user_id: id.clone(),
        };

        match api.send_sms(&message).await {
            Ok(()) => {
                debug!("SMS sent to {}", phone);
                health.record_sms(true);
                report.sent += 1;
            }
            Err(e) => {
                error!("SMS to {} failed: {}", phone, e);
                health.record_sms(false);
                report.failed += 1;
            }
        }
    }

    report
}
