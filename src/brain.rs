//! Upstream Brain streaming client.
//!
//! The gateway consumes a streaming chat RPC plus two approval calls. The
//! wire chunk discriminator is numeric, but a string-tagged form also occurs
//! while the upstream transport matures; `StreamChunk::from_wire` is the
//! single edge parser that normalizes both, so internal code only ever sees
//! the typed variant.

use crate::error::BrainError;
use crate::{UserId, WorkspaceId};
use async_trait::async_trait;
use futures::Stream;
use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

/// Message role on the chat request. Serialized as the numeric wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn code(&self) -> u8 {
        match self {
            Role::User => 0,
            Role::Assistant => 1,
            Role::System => 2,
        }
    }
}

impl Serialize for Role {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(Role::User),
            1 => Ok(Role::Assistant),
            2 => Ok(Role::System),
            other => Err(serde::de::Error::custom(format!("unknown role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// One streaming chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub workspace_id: String,
    /// Empty string lets Brain allocate.
    #[serde(default)]
    pub conversation_id: String,
    pub messages: Vec<ChatMessage>,
    /// Empty string selects the default provider.
    #[serde(default)]
    pub provider: String,
    /// Empty string selects the default model.
    #[serde(default)]
    pub model: String,
    /// Recognized keys: `channel`, `attachments` (JSON array).
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Normalized stream chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    ContentDelta {
        text: String,
        metadata: HashMap<String, String>,
    },
    ToolCall,
    Done {
        conversation_id: Option<String>,
    },
    Error {
        message: String,
    },
}

impl StreamChunk {
    /// Parse a wire chunk, accepting both the numeric discriminator
    /// (`{"type": 0}`) and the string tag (`{"type": "content_delta"}`,
    /// upper or lower case).
    pub fn from_wire(value: &serde_json::Value) -> Result<Self, BrainError> {
        let tag = value
            .get("type")
            .ok_or_else(|| BrainError::Protocol("chunk missing type".into()))?;

        let kind = match tag {
            serde_json::Value::Number(n) => match n.as_u64() {
                Some(0) => ChunkKind::ContentDelta,
                Some(1) => ChunkKind::ToolCall,
                Some(2) => ChunkKind::Done,
                Some(3) => ChunkKind::Error,
                _ => {
                    return Err(BrainError::Protocol(format!(
                        "unknown numeric chunk type: {n}"
                    )));
                }
            },
            serde_json::Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "content_delta" => ChunkKind::ContentDelta,
                "tool_call" => ChunkKind::ToolCall,
                "done" => ChunkKind::Done,
                "error" => ChunkKind::Error,
                other => {
                    return Err(BrainError::Protocol(format!(
                        "unknown chunk type: {other}"
                    )));
                }
            },
            other => {
                return Err(BrainError::Protocol(format!(
                    "chunk type is neither number nor string: {other}"
                )));
            }
        };

        let chunk = match kind {
            ChunkKind::ContentDelta => {
                let text = value
                    .get("content_delta")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let metadata = value
                    .get("metadata")
                    .and_then(|v| v.as_object())
                    .map(|map| {
                        map.iter()
                            .filter_map(|(k, v)| {
                                v.as_str().map(|s| (k.clone(), s.to_string()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                StreamChunk::ContentDelta { text, metadata }
            }
            ChunkKind::ToolCall => StreamChunk::ToolCall,
            ChunkKind::Done => StreamChunk::Done {
                conversation_id: value
                    .get("conversation_id")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            },
            ChunkKind::Error => StreamChunk::Error {
                message: value
                    .get("error_message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("upstream error")
                    .to_string(),
            },
        };

        Ok(chunk)
    }

    /// The `agent_status` metadata value, when present on a delta.
    pub fn agent_status(&self) -> Option<&str> {
        match self {
            StreamChunk::ContentDelta { metadata, .. } => {
                metadata.get("agent_status").map(String::as_str)
            }
            _ => None,
        }
    }
}

enum ChunkKind {
    ContentDelta,
    ToolCall,
    Done,
    Error,
}

/// Outcome of an approval callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl ApprovalOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Stream of normalized chunks. A mid-stream `Err` is an upstream abort.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, BrainError>> + Send>>;

/// Consumer-side Brain contract.
#[async_trait]
pub trait BrainClient: Send + Sync + 'static {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, BrainError>;

    async fn approve_action(
        &self,
        approval_id: &str,
        user_id: &UserId,
        approved: bool,
    ) -> Result<ApprovalOutcome, BrainError>;

    async fn list_pending_approvals(
        &self,
        user_id: &UserId,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<String>, BrainError>;
}

/// HTTP Brain client speaking newline-delimited JSON chunks.
pub struct HttpBrainClient {
    http: reqwest::Client,
    base_url: url::Url,
}

impl HttpBrainClient {
    pub fn new(base_url: url::Url) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<url::Url, BrainError> {
        self.base_url
            .join(path)
            .map_err(|e| BrainError::Request(format!("bad endpoint {path}: {e}")))
    }
}

#[async_trait]
impl BrainClient for HttpBrainClient {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, BrainError> {
        let endpoint = self.endpoint("v1/chat/stream")?;
        let response = self
            .http
            .post(endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| BrainError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| BrainError::Request(e.to_string()))?;

        let mut bytes = response.bytes_stream();

        // Buffer raw bytes and yield one parsed chunk per NDJSON line.
        let stream = async_stream::try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(frame) = bytes.next().await {
                let frame = frame.map_err(|e| BrainError::StreamAborted(e.to_string()))?;
                buffer.extend_from_slice(&frame);

                while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let value: serde_json::Value = serde_json::from_str(line)
                        .map_err(|e| BrainError::Protocol(e.to_string()))?;
                    yield StreamChunk::from_wire(&value)?;
                }
            }

            let tail = String::from_utf8_lossy(&buffer);
            let tail = tail.trim();
            if !tail.is_empty() {
                let value: serde_json::Value = serde_json::from_str(tail)
                    .map_err(|e| BrainError::Protocol(e.to_string()))?;
                yield StreamChunk::from_wire(&value)?;
            }
        };

        Ok(Box::pin(stream))
    }

    async fn approve_action(
        &self,
        approval_id: &str,
        user_id: &UserId,
        approved: bool,
    ) -> Result<ApprovalOutcome, BrainError> {
        let endpoint = self.endpoint(&format!("v1/approvals/{approval_id}"))?;
        let response = self
            .http
            .post(endpoint)
            .json(&serde_json::json!({
                "user_id": user_id.as_ref(),
                "approved": approved,
            }))
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| BrainError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| BrainError::Request(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| BrainError::Protocol(e.to_string()))
    }

    async fn list_pending_approvals(
        &self,
        user_id: &UserId,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<String>, BrainError> {
        #[derive(Deserialize)]
        struct Pending {
            approval_id: String,
        }

        let endpoint = self.endpoint("v1/approvals")?;
        let response = self
            .http
            .get(endpoint)
            .query(&[
                ("user_id", user_id.as_ref()),
                ("workspace_id", workspace_id.as_ref()),
            ])
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| BrainError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| BrainError::Request(e.to_string()))?;

        let pending: Vec<Pending> = response
            .json()
            .await
            .map_err(|e| BrainError::Protocol(e.to_string()))?;
        Ok(pending.into_iter().map(|p| p.approval_id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_discriminators_parse() {
        let delta = StreamChunk::from_wire(&json!({
            "type": 0,
            "content_delta": "Hello ",
            "metadata": {"provider": "default"},
        }))
        .unwrap();
        assert_eq!(
            delta,
            StreamChunk::ContentDelta {
                text: "Hello ".into(),
                metadata: HashMap::from([("provider".to_string(), "default".to_string())]),
            }
        );

        assert_eq!(
            StreamChunk::from_wire(&json!({"type": 1})).unwrap(),
            StreamChunk::ToolCall
        );
        assert_eq!(
            StreamChunk::from_wire(&json!({"type": 2, "conversation_id": "C1"})).unwrap(),
            StreamChunk::Done {
                conversation_id: Some("C1".into())
            }
        );
        assert_eq!(
            StreamChunk::from_wire(&json!({"type": 3, "error_message": "boom"})).unwrap(),
            StreamChunk::Error {
                message: "boom".into()
            }
        );
    }

    #[test]
    fn string_discriminators_parse_case_insensitively() {
        assert_eq!(
            StreamChunk::from_wire(&json!({"type": "CONTENT_DELTA", "content_delta": "x"}))
                .unwrap(),
            StreamChunk::ContentDelta {
                text: "x".into(),
                metadata: HashMap::new(),
            }
        );
        assert_eq!(
            StreamChunk::from_wire(&json!({"type": "done"})).unwrap(),
            StreamChunk::Done {
                conversation_id: None
            }
        );
    }

    #[test]
    fn empty_done_conversation_id_is_none() {
        assert_eq!(
            StreamChunk::from_wire(&json!({"type": 2, "conversation_id": ""})).unwrap(),
            StreamChunk::Done {
                conversation_id: None
            }
        );
    }

    #[test]
    fn unknown_tags_are_protocol_errors() {
        assert!(StreamChunk::from_wire(&json!({"type": 9})).is_err());
        assert!(StreamChunk::from_wire(&json!({"type": "chunk"})).is_err());
        assert!(StreamChunk::from_wire(&json!({"type": null})).is_err());
        assert!(StreamChunk::from_wire(&json!({})).is_err());
    }

    #[test]
    fn roles_serialize_as_numeric_codes() {
        let message = ChatMessage::user("hi");
        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(wire, json!({"role": 0, "content": "hi"}));

        let back: ChatMessage = serde_json::from_value(wire).unwrap();
        assert_eq!(back.role, Role::User);
    }

    #[test]
    fn agent_status_reads_delta_metadata() {
        let chunk = StreamChunk::from_wire(&json!({
            "type": 0,
            "metadata": {"agent_status": "routing_info", "provider": "fast"},
        }))
        .unwrap();
        assert_eq!(chunk.agent_status(), Some("routing_info"));
        assert_eq!(StreamChunk::ToolCall.agent_status(), None);
    }
}
