//! Outbound webhook fan-out: signed JSON event delivery with retry.

use anyhow::Context as _;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Event envelope POSTed to subscriber endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    pub id: uuid::Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    /// RFC 3339.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: serde_json::Value,
}

impl WebhookEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: chrono::Utc::now(),
            payload,
        }
    }
}

/// Signs and delivers webhook events with capped exponential backoff.
pub struct WebhookSender {
    http: reqwest::Client,
    secret: String,
    header_prefix: String,
    max_attempts: u32,
}

impl WebhookSender {
    pub fn new(secret: impl Into<String>, header_prefix: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self {
            http,
            secret: secret.into(),
            header_prefix: header_prefix.into(),
            max_attempts: 3,
        })
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Deliver one event. Retries non-2xx responses and transport errors
    /// with `1s * 2^(attempt-1)` backoff.
    pub async fn deliver(&self, endpoint: &str, event: &WebhookEvent) -> anyhow::Result<()> {
        let body = serde_json::to_vec(event).context("failed to encode webhook event")?;
        let signature = self.sign(&body);

        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let response = self
                .http
                .post(endpoint)
                .header("content-type", "application/json")
                .header(
                    format!("x-{}-signature", self.header_prefix),
                    &signature,
                )
                .header(
                    format!("x-{}-event", self.header_prefix),
                    &event.event_type,
                )
                .header(
                    format!("x-{}-attempt", self.header_prefix),
                    attempt.to_string(),
                )
                .body(body.clone())
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(
                        endpoint,
                        event_type = %event.event_type,
                        attempt,
                        "webhook delivered"
                    );
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status();
                    tracing::warn!(endpoint, %status, attempt, "webhook rejected");
                    last_error = Some(anyhow::anyhow!("endpoint returned {status}"));
                }
                Err(error) => {
                    tracing::warn!(endpoint, %error, attempt, "webhook delivery failed");
                    last_error = Some(error.into());
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("webhook delivery failed"))
            .context(format!(
                "webhook to {endpoint} failed after {} attempts",
                self.max_attempts
            )))
    }

    /// `sha256=<hex hmac>` over the raw request body.
    fn sign(&self, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    // 1s, 2s, 4s, ... capped at 15s.
    let exp = attempt.saturating_sub(2).min(4);
    Duration::from_secs((1u64 << exp).min(15))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_and_prefixed() {
        let sender = WebhookSender::new("secret", "switchboard").unwrap();
        let sig_a = sender.sign(b"{\"a\":1}");
        let sig_b = sender.sign(b"{\"a\":1}");
        assert_eq!(sig_a, sig_b);
        assert!(sig_a.starts_with("sha256="));
        assert_ne!(sig_a, sender.sign(b"{\"a\":2}"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(2), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(4));
        assert_eq!(backoff_delay(7), Duration::from_secs(15));
    }

    #[test]
    fn event_envelope_serializes_with_type_tag() {
        let event = WebhookEvent::new("message.sent", serde_json::json!({"ok": true}));
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "message.sent");
        assert!(wire["timestamp"].as_str().unwrap().contains('T'));
        assert_eq!(wire["payload"]["ok"], true);
    }
}
