//! WhatsApp channel adapter over the Twilio Messaging REST API.
//!
//! Inbound messages arrive as signed webhooks relayed by the host HTTP
//! layer; the signature is HMAC-SHA1 over the full URL plus the
//! concatenated sorted form parameters, base64-encoded, compared in
//! constant time against `X-Twilio-Signature`. Outbound delivery is one
//! POST per message, with media sent as additional messages.

use crate::channels::adapter::{
    Adapter, AdapterEvent, AdapterStatus, EventStream, StatusCell,
};
use crate::config::WhatsAppConfig;
use crate::error::AdapterError;
use crate::identity::{derived_uuid, ChannelIdentity, IdentityStore};
use crate::text::truncate_with_ellipsis;
use crate::{
    Attachment, AttachmentKind, ChannelType, InboundMessage, MessageMetadata, OutboundMessage,
    Result, UserId,
};
use anyhow::Context as _;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use subtle::ConstantTimeEq as _;
use tokio::sync::RwLock;

type HmacSha1 = Hmac<Sha1>;

/// WhatsApp bodies over ~1600 chars get rejected; truncate with ellipsis.
const MAX_BODY_LEN: usize = 1600;

const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

pub struct WhatsAppChannel {
    config: WhatsAppConfig,
    http: reqwest::Client,
    status: StatusCell,
    events: StdMutex<Option<tokio::sync::mpsc::Sender<AdapterEvent>>>,
    /// Phone number (E.164, no `whatsapp:` prefix) per logical user.
    phones: RwLock<HashMap<UserId, String>>,
    identities: Option<Arc<IdentityStore>>,
}

impl WhatsAppChannel {
    pub fn new(config: WhatsAppConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build twilio HTTP client")?;
        Ok(Self {
            config,
            http,
            status: StatusCell::new(ChannelType::WhatsApp),
            events: StdMutex::new(None),
            phones: RwLock::new(HashMap::new()),
            identities: None,
        })
    }

    pub fn with_identities(mut self, identities: Arc<IdentityStore>) -> Self {
        self.identities = Some(identities);
        self
    }

    /// Handle one inbound Twilio webhook. The host passes the exact public
    /// URL Twilio signed, the form parameters, and the
    /// `X-Twilio-Signature` header. A bad signature is `unauthenticated`
    /// (the host answers 401) with no downstream effect.
    pub async fn handle_webhook(
        &self,
        url: &str,
        params: &BTreeMap<String, String>,
        signature: &str,
    ) -> Result<()> {
        if !verify_signature(&self.config.auth_token, url, params, signature) {
            tracing::warn!("twilio webhook signature mismatch");
            return Err(AdapterError::Unauthenticated.into());
        }

        let Some(from) = params.get("From") else {
            return Err(AdapterError::InvalidInput("webhook missing From".into()).into());
        };
        let phone = from.strip_prefix("whatsapp:").unwrap_or(from).to_string();
        let body = params.get("Body").cloned().unwrap_or_default();
        let attachments = extract_media(params);
        if body.is_empty() && attachments.is_empty() {
            return Ok(());
        }

        let user_id: UserId = derived_uuid(&format!("whatsapp-user:{phone}")).into();
        self.phones
            .write()
            .await
            .insert(user_id.clone(), phone.clone());

        if let Some(identities) = &self.identities {
            let mut identity =
                ChannelIdentity::new(user_id.clone(), ChannelType::WhatsApp, phone.clone());
            if let Some(name) = params.get("ProfileName") {
                identity = identity.with_display_name(name.clone());
            }
            if let Err(error) = identities.register_identity(identity).await {
                tracing::warn!(%error, "failed to register whatsapp identity");
            }
        }

        let mut extra = HashMap::new();
        if let Some(sid) = params.get("MessageSid") {
            extra.insert("message_sid".to_string(), serde_json::json!(sid));
        }

        let inbound = InboundMessage::new(
            ChannelType::WhatsApp,
            user_id,
            self.config.default_workspace_id.as_str(),
            body,
        )
        .with_conversation(format!("whatsapp-conv:{phone}"))
        .with_attachments(attachments)
        .with_metadata(MessageMetadata {
            channel_user_id: phone,
            channel_message_id: params.get("MessageSid").cloned(),
            timestamp: chrono::Utc::now(),
            extra,
        });

        self.emit(AdapterEvent::Message(inbound)).await;
        Ok(())
    }

    async fn emit(&self, event: AdapterEvent) {
        let sender = self.events.lock().expect("events lock").clone();
        if let Some(sender) = sender {
            if sender.send(event).await.is_err() {
                tracing::warn!("whatsapp event receiver dropped");
            }
        }
    }

    async fn post_message(
        &self,
        to_phone: &str,
        body: Option<&str>,
        media_url: Option<&str>,
    ) -> Result<()> {
        let endpoint = format!(
            "{TWILIO_API_BASE}/Accounts/{}/Messages.json",
            self.config.account_sid
        );

        let mut form: Vec<(&str, String)> = vec![
            ("From", format!("whatsapp:{}", self.config.from_number)),
            ("To", format!("whatsapp:{to_phone}")),
        ];
        if let Some(body) = body {
            form.push(("Body", body.to_string()));
        }
        if let Some(url) = media_url {
            form.push(("MediaUrl", url.to_string()));
        }

        let response = self
            .http
            .post(&endpoint)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&form)
            .send()
            .await
            .context("twilio message POST failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(AdapterError::SendFailed {
                channel: ChannelType::WhatsApp,
                reason: format!("twilio returned {status}: {detail}"),
            }
            .into());
        }
        Ok(())
    }
}

impl Adapter for WhatsAppChannel {
    fn channel(&self) -> ChannelType {
        ChannelType::WhatsApp
    }

    fn status(&self) -> AdapterStatus {
        self.status.status()
    }

    async fn connect(&self) -> Result<EventStream> {
        if !self.status.begin_connect()? {
            tracing::debug!("whatsapp already connected, connect is a no-op");
            return Ok(Box::pin(futures::stream::pending()));
        }

        let (events_tx, events_rx) = tokio::sync::mpsc::channel(256);
        self.status.attach(events_tx.clone());
        *self.events.lock().expect("events lock") = Some(events_tx);

        // Validate the credentials up front against the account endpoint.
        let endpoint = format!(
            "{TWILIO_API_BASE}/Accounts/{}.json",
            self.config.account_sid
        );
        let check = self
            .http
            .get(&endpoint)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .send()
            .await;
        match check {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                self.status.mark_disconnected();
                return Err(AdapterError::ConnectFailed {
                    channel: ChannelType::WhatsApp,
                    reason: format!("credential check returned {}", response.status()),
                }
                .into());
            }
            Err(error) => {
                self.status.mark_disconnected();
                return Err(AdapterError::ConnectFailed {
                    channel: ChannelType::WhatsApp,
                    reason: error.to_string(),
                }
                .into());
            }
        }

        self.status.mark_connected();
        tracing::info!("whatsapp adapter connected");
        let stream = tokio_stream::wrappers::ReceiverStream::new(events_rx);
        Ok(Box::pin(stream))
    }

    async fn disconnect(&self) -> Result<()> {
        *self.events.lock().expect("events lock") = None;
        self.phones.write().await.clear();
        self.status.mark_disconnected();
        tracing::info!("whatsapp adapter shut down");
        Ok(())
    }

    async fn send(&self, user_id: &UserId, message: OutboundMessage) -> Result<()> {
        let phone = self
            .phones
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownUser {
                channel: ChannelType::WhatsApp,
                user_id: user_id.to_string(),
            })?;

        if !message.content.is_empty() {
            self.post_message(&phone, Some(&message.content), None)
                .await?;
        }
        // Media rides on separate messages.
        for attachment in &message.attachments {
            self.post_message(&phone, None, Some(&attachment.url))
                .await?;
        }
        Ok(())
    }

    fn format_outgoing(&self, mut message: OutboundMessage) -> OutboundMessage {
        message.content = truncate_with_ellipsis(
            &to_whatsapp_text(&message.content),
            MAX_BODY_LEN,
        );
        message
    }
}

/// Compute the Twilio request signature: base64(HMAC-SHA1(url + sorted
/// key-value concatenation)).
fn compute_signature(auth_token: &str, url: &str, params: &BTreeMap<String, String>) -> String {
    let mut payload = String::from(url);
    for (key, value) in params {
        payload.push_str(key);
        payload.push_str(value);
    }
    let mut mac =
        HmacSha1::new_from_slice(auth_token.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Constant-time signature verification.
fn verify_signature(
    auth_token: &str,
    url: &str,
    params: &BTreeMap<String, String>,
    provided: &str,
) -> bool {
    let expected = compute_signature(auth_token, url, params);
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

fn extract_media(params: &BTreeMap<String, String>) -> Vec<Attachment> {
    let count: usize = params
        .get("NumMedia")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0);

    (0..count)
        .filter_map(|index| {
            let url = params.get(&format!("MediaUrl{index}"))?.clone();
            let mime = params.get(&format!("MediaContentType{index}")).cloned();
            Some(Attachment {
                kind: mime
                    .as_deref()
                    .map(AttachmentKind::from_mime)
                    .unwrap_or(AttachmentKind::File),
                url,
                mime_type: mime,
                size: None,
                filename: None,
            })
        })
        .collect()
}

/// Strip Markdown WhatsApp cannot render: headers lose their marker, link
/// syntax becomes `label (url)`.
fn to_whatsapp_text(text: &str) -> String {
    let mut lines = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim_start();
        let heading = trimmed
            .strip_prefix("###")
            .or_else(|| trimmed.strip_prefix("##"))
            .or_else(|| trimmed.strip_prefix('#'));
        match heading {
            Some(rest) if rest.starts_with(' ') || rest.is_empty() => {
                lines.push(rest.trim().to_string());
            }
            _ => lines.push(line.to_string()),
        }
    }
    strip_links(&lines.join("\n")).replace("**", "*")
}

fn strip_links(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('[') {
        let Some(label_end) = rest[start..].find("](") else {
            break;
        };
        let label_end = start + label_end;
        let Some(url_end) = rest[label_end..].find(')') else {
            break;
        };
        let url_end = label_end + url_end;

        output.push_str(&rest[..start]);
        let label = &rest[start + 1..label_end];
        let url = &rest[label_end + 2..url_end];
        output.push_str(label);
        if !url.is_empty() {
            output.push_str(" (");
            output.push_str(url);
            output.push(')');
        }
        rest = &rest[url_end + 1..];
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn signature_round_trips_and_rejects_tampering() {
        let url = "https://gateway.example.com/webhooks/whatsapp";
        let body = params(&[
            ("From", "whatsapp:+14155550100"),
            ("Body", "hello"),
            ("MessageSid", "SM123"),
        ]);

        let signature = compute_signature("token", url, &body);
        assert!(verify_signature("token", url, &body, &signature));

        let mut tampered = body.clone();
        tampered.insert("Body".to_string(), "goodbye".to_string());
        assert!(!verify_signature("token", url, &tampered, &signature));
        assert!(!verify_signature("other-token", url, &body, &signature));
    }

    #[test]
    fn signature_concatenates_sorted_params() {
        // Known-structure check: Body sorts before From, so swapping
        // insertion order must not change the signature.
        let url = "https://x.test/hook";
        let a = params(&[("From", "f"), ("Body", "b")]);
        let b = params(&[("Body", "b"), ("From", "f")]);
        assert_eq!(
            compute_signature("t", url, &a),
            compute_signature("t", url, &b)
        );
    }

    #[test]
    fn media_params_become_attachments() {
        let body = params(&[
            ("NumMedia", "2"),
            ("MediaUrl0", "https://api.twilio.com/media/0"),
            ("MediaContentType0", "image/jpeg"),
            ("MediaUrl1", "https://api.twilio.com/media/1"),
            ("MediaContentType1", "application/pdf"),
        ]);
        let attachments = extract_media(&body);
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].kind, AttachmentKind::Image);
        assert_eq!(attachments[1].kind, AttachmentKind::File);
    }

    #[test]
    fn formatting_strips_headers_and_links() {
        let input = "## Update\nSee [the docs](https://docs.example.com) for **details**.";
        assert_eq!(
            to_whatsapp_text(input),
            "Update\nSee the docs (https://docs.example.com) for *details*."
        );
    }

    #[test]
    fn long_bodies_get_the_soft_limit() {
        let config_text = "a".repeat(2000);
        let formatted = truncate_with_ellipsis(&config_text, MAX_BODY_LEN);
        assert!(formatted.len() <= MAX_BODY_LEN);
        assert!(formatted.ends_with('…'));
    }
}
