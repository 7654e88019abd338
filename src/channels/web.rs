//! Web channel adapter: the WebSocket surface for browser clients.
//!
//! Each connection gets a 5-second grace window to authenticate with a
//! token frame; afterwards `chat` frames run a direct Brain stream whose
//! chunks are forwarded as `token` / `tool_activity` / `routing_info`
//! frames (this surface never accumulates). Replies initiated by other
//! channels arrive through `send` as single `message` frames. Per-socket
//! writes are serialized through one writer task, and closing the socket
//! cancels any in-flight stream.

use crate::brain::{BrainClient, ChatMessage, ChatRequest, StreamChunk};
use crate::channels::adapter::{
    Adapter, AdapterEvent, AdapterStatus, EventStream, StatusCell,
};
use crate::config::WebConfig;
use crate::error::AdapterError;
use crate::identity::{ChannelIdentity, Deduplicator, IdentityStore};
use crate::{
    Attachment, ChannelType, OutboundMessage, Result, UserId,
};
use anyhow::Context as _;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use base64::Engine as _;
use futures::{SinkExt as _, StreamExt as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use subtle::ConstantTimeEq as _;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Clients must authenticate within this window.
const AUTH_GRACE: Duration = Duration::from_secs(5);

/// Heartbeat ping interval; a connection that misses a pong is terminated.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

const CLOSE_INVALID_TOKEN: u16 = 4001;
const CLOSE_FORBIDDEN: u16 = 4004;
const CLOSE_AUTH_TIMEOUT: u16 = 4008;
const CLOSE_SHUTDOWN: u16 = 1001;

/// Verifies bearer tokens presented on the auth handshake. Token issuance
/// lives upstream; the gateway only consumes verification.
#[async_trait::async_trait]
pub trait TokenVerifier: Send + Sync + 'static {
    async fn verify(&self, token: &str) -> Result<AuthClaims>;
}

#[derive(Debug, Clone)]
pub struct AuthClaims {
    pub user_id: UserId,
    pub workspace_id: Option<String>,
}

/// HS256 JWT verifier over the configured shared secret.
pub struct JwtVerifier {
    secret: String,
}

impl JwtVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[derive(Deserialize)]
struct JwtClaims {
    sub: String,
    exp: Option<i64>,
    workspace_id: Option<String>,
}

#[async_trait::async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<AuthClaims> {
        let mut parts = token.splitn(3, '.');
        let (Some(header), Some(payload), Some(signature)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(AdapterError::Unauthenticated.into());
        };

        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        let expected =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            return Err(AdapterError::Unauthenticated.into());
        }

        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AdapterError::Unauthenticated)?;
        let claims: JwtClaims =
            serde_json::from_slice(&decoded).map_err(|_| AdapterError::Unauthenticated)?;

        if let Some(exp) = claims.exp {
            if exp <= chrono::Utc::now().timestamp() {
                return Err(AdapterError::Unauthenticated.into());
            }
        }
        if claims.sub.is_empty() {
            return Err(AdapterError::Unauthenticated.into());
        }

        Ok(AuthClaims {
            user_id: claims.sub.into(),
            workspace_id: claims.workspace_id,
        })
    }
}

/// Frames sent to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum ServerFrame {
    Connected {
        session_id: String,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    Thinking {
        message_id: String,
    },
    Token {
        content: String,
        message_id: String,
    },
    ToolActivity {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_args: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        thinking: Option<String>,
        message_id: String,
    },
    RoutingInfo {
        #[serde(skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        was_escalated: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        complexity: Option<String>,
        message_id: String,
    },
    Done {
        message_id: String,
    },
    Message {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
    },
    Pong,
}

/// Frames received from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum ClientFrame {
    Auth {
        token: String,
    },
    Chat {
        content: String,
        conversation_id: Option<String>,
        workspace_id: Option<String>,
        provider: Option<String>,
        model: Option<String>,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
    SetWorkspace {
        workspace_id: String,
    },
    Ping,
}

struct SessionHandle {
    id: uuid::Uuid,
    writer: mpsc::Sender<WsMessage>,
}

struct Connection {
    cancel: CancellationToken,
    tasks: TaskTracker,
}

pub struct WebChannel {
    inner: Arc<Inner>,
}

struct Inner {
    config: WebConfig,
    brain: Arc<dyn BrainClient>,
    verifier: Arc<dyn TokenVerifier>,
    deduplicator: Option<Arc<Deduplicator>>,
    identities: Option<Arc<IdentityStore>>,
    status: StatusCell,
    events: StdMutex<Option<mpsc::Sender<AdapterEvent>>>,
    sessions: RwLock<HashMap<UserId, Vec<SessionHandle>>>,
    connection: Mutex<Option<Connection>>,
}

impl WebChannel {
    pub fn new(
        config: WebConfig,
        brain: Arc<dyn BrainClient>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                brain,
                verifier,
                deduplicator: None,
                identities: None,
                status: StatusCell::new(ChannelType::Web),
                events: StdMutex::new(None),
                sessions: RwLock::new(HashMap::new()),
                connection: Mutex::new(None),
            }),
        }
    }

    pub fn with_deduplicator(mut self, deduplicator: Arc<Deduplicator>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_deduplicator before sharing")
            .deduplicator = Some(deduplicator);
        self
    }

    pub fn with_identities(mut self, identities: Arc<IdentityStore>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_identities before sharing")
            .identities = Some(identities);
        self
    }
}

impl Adapter for WebChannel {
    fn channel(&self) -> ChannelType {
        ChannelType::Web
    }

    fn status(&self) -> AdapterStatus {
        self.inner.status.status()
    }

    async fn connect(&self) -> Result<EventStream> {
        if !self.inner.status.begin_connect()? {
            tracing::debug!("web already connected, connect is a no-op");
            return Ok(Box::pin(futures::stream::pending()));
        }

        let (events_tx, events_rx) = mpsc::channel(256);
        self.inner.status.attach(events_tx.clone());
        *self.inner.events.lock().expect("events lock") = Some(events_tx);

        let listener = match tokio::net::TcpListener::bind(self.inner.config.bind_addr).await {
            Ok(listener) => listener,
            Err(error) => {
                self.inner.status.mark_disconnected();
                return Err(AdapterError::ConnectFailed {
                    channel: ChannelType::Web,
                    reason: error.to_string(),
                }
                .into());
            }
        };
        tracing::info!(addr = %self.inner.config.bind_addr, "web socket server listening");

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();

        let router = Router::new()
            .route("/ws", get(ws_upgrade))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(self.inner.clone());

        let serve_cancel = cancel.clone();
        tasks.spawn(async move {
            let shutdown = async move { serve_cancel.cancelled().await };
            if let Err(error) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(%error, "web socket server error");
            }
        });

        *self.inner.connection.lock().await = Some(Connection { cancel, tasks });
        self.inner.status.mark_connected();

        let stream = tokio_stream::wrappers::ReceiverStream::new(events_rx);
        Ok(Box::pin(stream))
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(connection) = self.inner.connection.lock().await.take() {
            connection.cancel.cancel();
            connection.tasks.close();
            connection.tasks.wait().await;
        }
        self.inner.sessions.write().await.clear();
        *self.inner.events.lock().expect("events lock") = None;
        self.inner.status.mark_disconnected();
        tracing::info!("web adapter shut down");
        Ok(())
    }

    async fn send(&self, user_id: &UserId, message: OutboundMessage) -> Result<()> {
        let sessions = self.inner.sessions.read().await;
        let Some(handles) = sessions.get(user_id).filter(|h| !h.is_empty()) else {
            return Err(AdapterError::UnknownUser {
                channel: ChannelType::Web,
                user_id: user_id.to_string(),
            }
            .into());
        };

        let frame = encode_frame(&ServerFrame::Message {
            content: message.content,
            conversation_id: message.conversation_id,
        })?;
        for handle in handles {
            if handle.writer.send(frame.clone()).await.is_err() {
                tracing::debug!(session = %handle.id, "web session writer closed");
            }
        }
        Ok(())
    }
}

async fn ws_upgrade(
    State(inner): State<Arc<Inner>>,
    upgrade: WebSocketUpgrade,
) -> axum::response::Response {
    upgrade.on_upgrade(move |socket| async move {
        let cancel = {
            let connection = inner.connection.lock().await;
            match connection.as_ref() {
                Some(connection) => connection.cancel.child_token(),
                None => return,
            }
        };
        inner.run_session(socket, cancel).await;
    })
}

impl Inner {
    /// One task per socket; all writes go through the writer channel.
    async fn run_session(self: &Arc<Self>, socket: WebSocket, cancel: CancellationToken) {
        let (mut sink, mut source) = socket.split();

        let (writer_tx, mut writer_rx) = mpsc::channel::<WsMessage>(64);
        let writer = tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                let is_close = matches!(frame, WsMessage::Close(_));
                if sink.send(frame).await.is_err() {
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Authentication grace window: the first frame must be a token.
        let claims = match tokio::time::timeout(AUTH_GRACE, source.next()).await {
            Err(_) => {
                close(&writer_tx, CLOSE_AUTH_TIMEOUT, "auth timeout").await;
                writer.abort();
                return;
            }
            Ok(frame) => match parse_client_frame(frame) {
                Some(ClientFrame::Auth { token }) => {
                    match self.verifier.verify(&token).await {
                        Ok(claims) => claims,
                        Err(error) => {
                            let code = match &error {
                                crate::Error::Adapter(AdapterError::Forbidden) => CLOSE_FORBIDDEN,
                                _ => CLOSE_INVALID_TOKEN,
                            };
                            let _ = send_frame(
                                &writer_tx,
                                &ServerFrame::Error {
                                    error: "invalid token".into(),
                                    message_id: None,
                                },
                            )
                            .await;
                            close(&writer_tx, code, "unauthorized").await;
                            let _ = writer.await;
                            return;
                        }
                    }
                }
                _ => {
                    close(&writer_tx, CLOSE_INVALID_TOKEN, "expected auth frame").await;
                    let _ = writer.await;
                    return;
                }
            },
        };

        let session_id = uuid::Uuid::new_v4();
        let user_id = claims.user_id.clone();
        let workspace = Arc::new(RwLock::new(
            claims
                .workspace_id
                .clone()
                .unwrap_or_else(|| self.config.default_workspace_id.clone()),
        ));

        if send_frame(
            &writer_tx,
            &ServerFrame::Connected {
                session_id: session_id.to_string(),
            },
        )
        .await
        .is_err()
        {
            writer.abort();
            return;
        }

        self.register_session(&user_id, session_id, writer_tx.clone())
            .await;
        tracing::info!(%user_id, session = %session_id, "web session authenticated");

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // first tick fires immediately
        let mut pong_outstanding = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    close(&writer_tx, CLOSE_SHUTDOWN, "shutting down").await;
                    break;
                }
                _ = heartbeat.tick() => {
                    if pong_outstanding {
                        tracing::debug!(session = %session_id, "missed pong, terminating");
                        break;
                    }
                    pong_outstanding = true;
                    if writer_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                frame = source.next() => {
                    match frame {
                        Some(Ok(WsMessage::Pong(_))) => {
                            pong_outstanding = false;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(WsMessage::Text(raw))) => {
                            match serde_json::from_str::<ClientFrame>(raw.as_str()) {
                                Ok(ClientFrame::Ping) => {
                                    let _ = send_frame(&writer_tx, &ServerFrame::Pong).await;
                                }
                                Ok(ClientFrame::SetWorkspace { workspace_id }) => {
                                    *workspace.write().await = workspace_id;
                                }
                                Ok(ClientFrame::Chat {
                                    content,
                                    conversation_id,
                                    workspace_id,
                                    provider,
                                    model,
                                    attachments,
                                }) => {
                                    let request_workspace = match workspace_id {
                                        Some(ws) => ws,
                                        None => workspace.read().await.clone(),
                                    };
                                    let inner = self.clone();
                                    let writer_tx = writer_tx.clone();
                                    let user_id = user_id.clone();
                                    let stream_cancel = cancel.child_token();
                                    tokio::spawn(async move {
                                        inner
                                            .run_chat_stream(
                                                writer_tx,
                                                user_id,
                                                request_workspace,
                                                content,
                                                conversation_id,
                                                provider,
                                                model,
                                                attachments,
                                                stream_cancel,
                                            )
                                            .await;
                                    });
                                }
                                Ok(ClientFrame::Auth { .. }) => {
                                    // Already authenticated; ignore.
                                }
                                Err(error) => {
                                    tracing::debug!(%error, "unparseable web frame");
                                    let _ = send_frame(
                                        &writer_tx,
                                        &ServerFrame::Error {
                                            error: "invalid frame".into(),
                                            message_id: None,
                                        },
                                    )
                                    .await;
                                }
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            tracing::debug!(%error, session = %session_id, "web socket error");
                            break;
                        }
                    }
                }
            }
        }

        // Closing the socket cancels any in-flight chat streams.
        cancel.cancel();
        self.unregister_session(&user_id, session_id).await;
        drop(writer_tx);
        let _ = writer.await;
        tracing::info!(%user_id, session = %session_id, "web session closed");
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_chat_stream(
        self: Arc<Self>,
        writer: mpsc::Sender<WsMessage>,
        user_id: UserId,
        workspace_id: String,
        content: String,
        conversation_id: Option<String>,
        provider: Option<String>,
        model: Option<String>,
        attachments: Vec<Attachment>,
        cancel: CancellationToken,
    ) {
        let message_id = uuid::Uuid::new_v4().to_string();

        if let Some(deduplicator) = &self.deduplicator {
            match deduplicator
                .is_duplicate(&user_id, &content, ChannelType::Web)
                .await
            {
                Ok(true) => {
                    tracing::info!(%user_id, "duplicate web chat dropped");
                    return;
                }
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(%error, "web dedup check failed, continuing");
                }
            }
        }

        let _ = send_frame(
            &writer,
            &ServerFrame::Thinking {
                message_id: message_id.clone(),
            },
        )
        .await;

        let mut parameters = HashMap::new();
        parameters.insert("channel".to_string(), "web".to_string());
        if !attachments.is_empty() {
            if let Ok(json) = serde_json::to_string(&attachments) {
                parameters.insert("attachments".to_string(), json);
            }
        }

        let request = ChatRequest {
            user_id: user_id.to_string(),
            workspace_id,
            conversation_id: conversation_id.unwrap_or_default(),
            messages: vec![ChatMessage::user(content)],
            provider: provider.unwrap_or_default(),
            model: model.unwrap_or_default(),
            parameters,
        };

        let mut stream = match self.brain.stream_chat(request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(%error, "failed to open brain stream for web chat");
                let _ = send_frame(
                    &writer,
                    &ServerFrame::Error {
                        error: "upstream unavailable".into(),
                        message_id: Some(message_id),
                    },
                )
                .await;
                return;
            }
        };

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("web chat stream cancelled by socket close");
                    return;
                }
                chunk = stream.next() => chunk,
            };

            match chunk {
                Some(Ok(StreamChunk::ContentDelta { text, metadata })) => {
                    if text.is_empty() {
                        let frame = metadata_frame(&metadata, &message_id);
                        if let Some(frame) = frame {
                            let _ = send_frame(&writer, &frame).await;
                        }
                    } else {
                        let frame = ServerFrame::Token {
                            content: text,
                            message_id: message_id.clone(),
                        };
                        if send_frame(&writer, &frame).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(StreamChunk::ToolCall)) => {}
                Some(Ok(StreamChunk::Done { .. })) => {
                    let _ = send_frame(
                        &writer,
                        &ServerFrame::Done {
                            message_id: message_id.clone(),
                        },
                    )
                    .await;
                    return;
                }
                Some(Ok(StreamChunk::Error { message })) => {
                    tracing::error!(error = %message, "brain stream error on web chat");
                    let _ = send_frame(
                        &writer,
                        &ServerFrame::Error {
                            error: "something went wrong".into(),
                            message_id: Some(message_id),
                        },
                    )
                    .await;
                    return;
                }
                Some(Err(error)) => {
                    tracing::error!(%error, "brain stream aborted on web chat");
                    let _ = send_frame(
                        &writer,
                        &ServerFrame::Error {
                            error: "something went wrong".into(),
                            message_id: Some(message_id),
                        },
                    )
                    .await;
                    return;
                }
                None => {
                    // Upstream hung up without Done; the client sees neither
                    // done nor error and may retry.
                    return;
                }
            }
        }
    }

    async fn register_session(
        &self,
        user_id: &UserId,
        session_id: uuid::Uuid,
        writer: mpsc::Sender<WsMessage>,
    ) {
        self.sessions
            .write()
            .await
            .entry(user_id.clone())
            .or_default()
            .push(SessionHandle {
                id: session_id,
                writer,
            });

        if let Some(identities) = &self.identities {
            let identity = ChannelIdentity::new(
                user_id.clone(),
                ChannelType::Web,
                user_id.to_string(),
            );
            if let Err(error) = identities.register_identity(identity).await {
                tracing::warn!(%error, "failed to register web identity");
            }
        }
    }

    async fn unregister_session(&self, user_id: &UserId, session_id: uuid::Uuid) {
        let mut sessions = self.sessions.write().await;
        if let Some(handles) = sessions.get_mut(user_id) {
            handles.retain(|handle| handle.id != session_id);
            if handles.is_empty() {
                sessions.remove(user_id);
            }
        }
    }
}

fn parse_client_frame(
    frame: Option<std::result::Result<WsMessage, axum::Error>>,
) -> Option<ClientFrame> {
    match frame {
        Some(Ok(WsMessage::Text(raw))) => serde_json::from_str(raw.as_str()).ok(),
        _ => None,
    }
}

fn metadata_frame(metadata: &HashMap<String, String>, message_id: &str) -> Option<ServerFrame> {
    let status = metadata.get("agent_status")?;
    if status == "routing_info" {
        return Some(ServerFrame::RoutingInfo {
            provider: metadata.get("provider").cloned(),
            model: metadata.get("model").cloned(),
            was_escalated: metadata.get("was_escalated").cloned(),
            complexity: metadata.get("complexity").cloned(),
            message_id: message_id.to_string(),
        });
    }
    Some(ServerFrame::ToolActivity {
        status: status.clone(),
        tool_name: metadata.get("tool_name").cloned(),
        tool_args: metadata.get("tool_args").cloned(),
        tool_result: metadata.get("tool_result").cloned(),
        thinking: metadata.get("thinking").cloned(),
        message_id: message_id.to_string(),
    })
}

fn encode_frame(frame: &ServerFrame) -> Result<WsMessage> {
    let json = serde_json::to_string(frame).context("failed to encode server frame")?;
    Ok(WsMessage::Text(json.into()))
}

async fn send_frame(
    writer: &mpsc::Sender<WsMessage>,
    frame: &ServerFrame,
) -> std::result::Result<(), ()> {
    let Ok(encoded) = encode_frame(frame) else {
        return Err(());
    };
    writer.send(encoded).await.map_err(|_| ())
}

async fn close(writer: &mpsc::Sender<WsMessage>, code: u16, reason: &str) {
    let _ = writer
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_token(secret: &str, claims: &serde_json::Value) -> String {
        let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = engine.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = engine.encode(serde_json::to_vec(claims).unwrap());
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        let signature = engine.encode(mac.finalize().into_bytes());
        format!("{header}.{payload}.{signature}")
    }

    #[tokio::test]
    async fn valid_tokens_verify() {
        let verifier = JwtVerifier::new("super-secret-key!");
        let token = make_token(
            "super-secret-key!",
            &serde_json::json!({
                "sub": "user-1",
                "workspace_id": "ws-9",
                "exp": chrono::Utc::now().timestamp() + 3600,
            }),
        );
        let claims = verifier.verify(&token).await.unwrap();
        assert_eq!(claims.user_id.as_ref(), "user-1");
        assert_eq!(claims.workspace_id.as_deref(), Some("ws-9"));
    }

    #[tokio::test]
    async fn wrong_secret_and_expired_tokens_fail() {
        let verifier = JwtVerifier::new("super-secret-key!");

        let forged = make_token("other-secret", &serde_json::json!({"sub": "user-1"}));
        assert!(verifier.verify(&forged).await.is_err());

        let expired = make_token(
            "super-secret-key!",
            &serde_json::json!({
                "sub": "user-1",
                "exp": chrono::Utc::now().timestamp() - 10,
            }),
        );
        assert!(verifier.verify(&expired).await.is_err());

        assert!(verifier.verify("not-a-jwt").await.is_err());
    }

    #[test]
    fn server_frames_use_the_wire_naming() {
        let frame = ServerFrame::RoutingInfo {
            provider: Some("fast".into()),
            model: Some("small-1".into()),
            was_escalated: None,
            complexity: Some("low".into()),
            message_id: "m-1".into(),
        };
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["type"], "routing_info");
        assert_eq!(wire["messageId"], "m-1");
        assert_eq!(wire["provider"], "fast");
        assert!(wire.get("wasEscalated").is_none());

        let token = ServerFrame::Token {
            content: "hi".into(),
            message_id: "m-1".into(),
        };
        let wire = serde_json::to_value(&token).unwrap();
        assert_eq!(wire["type"], "token");
        assert_eq!(wire["content"], "hi");
    }

    #[test]
    fn client_frames_parse_the_documented_shapes() {
        let chat: ClientFrame = serde_json::from_str(
            r#"{"type":"chat","content":"hi","conversationId":"c-1","workspaceId":"ws"}"#,
        )
        .unwrap();
        match chat {
            ClientFrame::Chat {
                content,
                conversation_id,
                workspace_id,
                ..
            } => {
                assert_eq!(content, "hi");
                assert_eq!(conversation_id.as_deref(), Some("c-1"));
                assert_eq!(workspace_id.as_deref(), Some("ws"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        assert!(matches!(
            serde_json::from_str::<ClientFrame>(r#"{"type":"ping"}"#).unwrap(),
            ClientFrame::Ping
        ));
        assert!(matches!(
            serde_json::from_str::<ClientFrame>(
                r#"{"type":"set_workspace","workspaceId":"ws-2"}"#
            )
            .unwrap(),
            ClientFrame::SetWorkspace { .. }
        ));
        assert!(matches!(
            serde_json::from_str::<ClientFrame>(r#"{"type":"auth","token":"t"}"#).unwrap(),
            ClientFrame::Auth { .. }
        ));
    }

    #[test]
    fn metadata_frames_split_routing_info_from_tool_activity() {
        let mut metadata = HashMap::new();
        metadata.insert("agent_status".to_string(), "routing_info".to_string());
        metadata.insert("provider".to_string(), "fast".to_string());
        let frame = metadata_frame(&metadata, "m-1").unwrap();
        assert!(matches!(frame, ServerFrame::RoutingInfo { .. }));

        metadata.insert("agent_status".to_string(), "tool_start".to_string());
        metadata.insert("tool_name".to_string(), "search".to_string());
        let frame = metadata_frame(&metadata, "m-1").unwrap();
        match frame {
            ServerFrame::ToolActivity {
                status, tool_name, ..
            } => {
                assert_eq!(status, "tool_start");
                assert_eq!(tool_name.as_deref(), Some("search"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        assert!(metadata_frame(&HashMap::new(), "m-1").is_none());
    }
}
