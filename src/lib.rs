//! Switchboard: an omnichannel messaging gateway.
//!
//! Chat surfaces (web sockets, Telegram, Discord, WhatsApp) are normalized
//! behind one adapter contract, routed through a channel registry to a
//! streaming upstream agent service ("Brain"), and the streaming response is
//! fanned back through the originating surface in its native format.

pub mod approvals;
pub mod brain;
pub mod channels;
pub mod config;
pub mod error;
pub mod identity;
pub mod router;
pub mod store;
pub mod text;
pub mod webhook;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Stable logical-user identifier type.
pub type UserId = Arc<str>;

/// Workspace identifier type.
pub type WorkspaceId = Arc<str>;

/// The closed set of chat surfaces the gateway understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Web,
    Telegram,
    Discord,
    WhatsApp,
    Mobile,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Web => "web",
            ChannelType::Telegram => "telegram",
            ChannelType::Discord => "discord",
            ChannelType::WhatsApp => "whatsapp",
            ChannelType::Mobile => "mobile",
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "web" => Ok(ChannelType::Web),
            "telegram" => Ok(ChannelType::Telegram),
            "discord" => Ok(ChannelType::Discord),
            "whatsapp" => Ok(ChannelType::WhatsApp),
            "mobile" => Ok(ChannelType::Mobile),
            other => Err(format!("unknown channel type: {other}")),
        }
    }
}

/// Inbound message from any surface, normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Locally generated message id, used as the correlation token.
    pub id: uuid::Uuid,
    pub channel: ChannelType,
    pub user_id: UserId,
    pub workspace_id: WorkspaceId,
    /// Deterministic surface key when the adapter can derive one, otherwise
    /// None and Brain allocates.
    pub conversation_id: Option<String>,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub metadata: MessageMetadata,
}

impl InboundMessage {
    pub fn new(
        channel: ChannelType,
        user_id: impl Into<UserId>,
        workspace_id: impl Into<WorkspaceId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            channel,
            user_id: user_id.into(),
            workspace_id: workspace_id.into(),
            conversation_id: None,
            content: content.into(),
            attachments: Vec::new(),
            metadata: MessageMetadata::default(),
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Surface-level message metadata carried alongside the normalized content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Platform-local sender id (phone number, Telegram uid, snowflake).
    pub channel_user_id: String,
    /// Platform-local message id, when the surface exposes one.
    pub channel_message_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Platform-specific fields (thread ids, guild ids, display names, ...).
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            channel_user_id: String::new(),
            channel_message_id: None,
            timestamp: chrono::Utc::now(),
            extra: HashMap::new(),
        }
    }
}

impl MessageMetadata {
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    pub fn extra_i64(&self, key: &str) -> Option<i64> {
        self.extra.get(key).and_then(|v| v.as_i64())
    }
}

/// Outbound message to a surface, in the common dialect. Adapters translate
/// via `format_outgoing` before hitting the platform API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub conversation_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub options: SendOptions,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_buttons(mut self, buttons: Vec<Button>) -> Self {
        self.options.buttons = buttons;
        self
    }
}

/// Delivery options attached to an outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendOptions {
    #[serde(default)]
    pub buttons: Vec<Button>,
    /// Content is common-dialect Markdown; adapters translate or strip.
    pub markdown: bool,
    #[serde(default)]
    pub mentions: Vec<String>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            buttons: Vec::new(),
            markdown: true,
            mentions: Vec::new(),
        }
    }
}

/// An interactive button. The adapter maps `action`/`value` to its
/// platform-native callback token (e.g. `approve:<id>` custom ids).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    pub action: String,
    pub value: Option<String>,
}

impl Button {
    pub fn new(label: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: action.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// The platform callback token: `action` or `action:value`.
    pub fn callback_token(&self) -> String {
        match &self.value {
            Some(value) => format!("{}:{}", self.action, value),
            None => self.action.clone(),
        }
    }
}

/// File attachment metadata. `url` may be an opaque platform handle (e.g.
/// `tg://<file_id>`) until the owning adapter resolves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub url: String,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub filename: Option<String>,
}

impl Attachment {
    pub fn new(kind: AttachmentKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            mime_type: None,
            size: None,
            filename: None,
        }
    }
}

/// Attachment classification derived from MIME types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Audio,
    Video,
    File,
}

impl AttachmentKind {
    /// Prefix-match MIME classification; anything unrecognized is a file.
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            AttachmentKind::Image
        } else if mime.starts_with("audio/") {
            AttachmentKind::Audio
        } else if mime.starts_with("video/") {
            AttachmentKind::Video
        } else {
            AttachmentKind::File
        }
    }
}

/// Agent-side processing status carried on metadata-only stream deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    ToolStart,
    ToolEnd,
    Thinking,
    WaitingApproval,
    WaitingForHuman,
    RoutingInfo,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::ToolStart => "tool_start",
            AgentStatus::ToolEnd => "tool_end",
            AgentStatus::Thinking => "thinking",
            AgentStatus::WaitingApproval => "waiting_approval",
            AgentStatus::WaitingForHuman => "waiting_for_human",
            AgentStatus::RoutingInfo => "routing_info",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tool_start" => Some(AgentStatus::ToolStart),
            "tool_end" => Some(AgentStatus::ToolEnd),
            "thinking" => Some(AgentStatus::Thinking),
            "waiting_approval" => Some(AgentStatus::WaitingApproval),
            "waiting_for_human" => Some(AgentStatus::WaitingForHuman),
            "routing_info" => Some(AgentStatus::RoutingInfo),
            _ => None,
        }
    }
}

/// Side-channel activity line shown while Brain works, distinct from the
/// streamed answer itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolActivity {
    pub status: AgentStatus,
    pub tool_name: Option<String>,
    pub tool_args: Option<String>,
    pub tool_result: Option<String>,
    pub thinking: Option<String>,
}

impl ToolActivity {
    /// Build from stream-chunk metadata. Returns None when the metadata
    /// carries no recognized `agent_status`.
    pub fn from_metadata(metadata: &HashMap<String, String>) -> Option<Self> {
        let status = AgentStatus::parse(metadata.get("agent_status")?)?;
        Some(Self {
            status,
            tool_name: metadata.get("tool_name").cloned(),
            tool_args: metadata.get("tool_args").cloned(),
            tool_result: metadata.get("tool_result").cloned(),
            thinking: metadata.get("thinking").cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_type_round_trips_through_strings() {
        for channel in [
            ChannelType::Web,
            ChannelType::Telegram,
            ChannelType::Discord,
            ChannelType::WhatsApp,
            ChannelType::Mobile,
        ] {
            assert_eq!(channel.as_str().parse::<ChannelType>().unwrap(), channel);
        }
        assert!("slack".parse::<ChannelType>().is_err());
    }

    #[test]
    fn attachment_kind_prefix_matches_mime() {
        assert_eq!(AttachmentKind::from_mime("image/png"), AttachmentKind::Image);
        assert_eq!(AttachmentKind::from_mime("audio/ogg"), AttachmentKind::Audio);
        assert_eq!(AttachmentKind::from_mime("video/mp4"), AttachmentKind::Video);
        assert_eq!(
            AttachmentKind::from_mime("application/pdf"),
            AttachmentKind::File
        );
    }

    #[test]
    fn button_callback_token_includes_value() {
        let button = Button::new("Approve", "approve").with_value("abc");
        assert_eq!(button.callback_token(), "approve:abc");
        assert_eq!(Button::new("Help", "help").callback_token(), "help");
    }

    #[test]
    fn tool_activity_requires_agent_status() {
        let mut metadata = HashMap::new();
        metadata.insert("tool_name".to_string(), "search".to_string());
        assert!(ToolActivity::from_metadata(&metadata).is_none());

        metadata.insert("agent_status".to_string(), "tool_start".to_string());
        let activity = ToolActivity::from_metadata(&metadata).unwrap();
        assert_eq!(activity.status, AgentStatus::ToolStart);
        assert_eq!(activity.tool_name.as_deref(), Some("search"));
    }
}
