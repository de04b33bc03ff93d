//! Outbound notification capability.
//!
//! Push and SMS transports live behind the [`Notifier`] trait so the core
//! never links against a vendor SDK. Both calls are fire-and-forget with
//! bounded retries; a failed leg logs and never fails the originating
//! request. The default implementation only records the attempt, which is
//! also what tests observe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

/// Retry attempts per notification.
const MAX_ATTEMPTS: u32 = 3;

/// Initial backoff; doubles per attempt.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Transport capability for push notifications and SMS.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Submit a push notification to one device token.
    async fn push(
        &self,
        device_token: &str,
        title: &str,
        body: &str,
        data: &serde_json::Value,
    ) -> anyhow::Result<()>;

    /// Submit an SMS to one phone number.
    async fn sms(&self, phone_number: &str, body: &str) -> anyhow::Result<()>;
}

/// Submit a push with bounded retries and exponential backoff. Returns
/// whether the transport ultimately accepted it.
pub async fn push_with_retries(
    notifier: &Arc<dyn Notifier>,
    device_token: &str,
    title: &str,
    body: &str,
    data: &serde_json::Value,
) -> bool {
    let mut backoff = BACKOFF_BASE;
    for attempt in 1..=MAX_ATTEMPTS {
        match notifier.push(device_token, title, body, data).await {
            Ok(()) => return true,
            Err(err) if attempt < MAX_ATTEMPTS => {
                warn!(attempt, error = %err, "push submit failed; retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(err) => {
                warn!(error = %err, "push submit failed after retries");
            }
        }
    }
    false
}

/// Submit an SMS with bounded retries and exponential backoff.
pub async fn sms_with_retries(notifier: &Arc<dyn Notifier>, phone_number: &str, body: &str) -> bool {
    let mut backoff = BACKOFF_BASE;
    for attempt in 1..=MAX_ATTEMPTS {
        match notifier.sms(phone_number, body).await {
            Ok(()) => return true,
            Err(err) if attempt < MAX_ATTEMPTS => {
                warn!(attempt, error = %err, "sms submit failed; retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(err) => {
                warn!(error = %err, "sms submit failed after retries");
            }
        }
    }
    false
}

/// Default transport: records submissions in the log and counts them.
/// Stands in until real push/SMS credentials are wired up at deployment.
#[derive(Default)]
pub struct LogNotifier {
    pushes: AtomicU64,
    smses: AtomicU64,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pushes_sent(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    pub fn smses_sent(&self) -> u64 {
        self.smses.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn push(
        &self,
        device_token: &str,
        title: &str,
        _body: &str,
        _data: &serde_json::Value,
    ) -> anyhow::Result<()> {
        self.pushes.fetch_add(1, Ordering::Relaxed);
        info!(device_token = %redact(device_token), title, "push submitted");
        Ok(())
    }

    async fn sms(&self, phone_number: &str, _body: &str) -> anyhow::Result<()> {
        self.smses.fetch_add(1, Ordering::Relaxed);
        info!(phone_number = %redact(phone_number), "sms submitted");
        Ok(())
    }
}

/// Keep the last four characters for correlation, hide the rest.
fn redact(value: &str) -> String {
    if value.len() <= 4 {
        return "****".to_string();
    }
    format!("****{}", &value[value.len() - 4..])
}
