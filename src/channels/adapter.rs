//! Adapter trait and dynamic dispatch companion.
//!
//! Adapters translate between a platform's native protocol and the
//! normalized message model. Each adapter owns its platform connection, its
//! per-user scratch state, and its timers; the registry owns the adapters.

use crate::error::AdapterError;
use crate::{
    Attachment, ChannelType, InboundMessage, OutboundMessage, Result, ToolActivity, UserId,
};
use futures::Stream;
use std::pin::Pin;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Adapter connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for AdapterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterStatus::Disconnected => f.write_str("disconnected"),
            AdapterStatus::Connecting => f.write_str("connecting"),
            AdapterStatus::Connected => f.write_str("connected"),
        }
    }
}

/// Typed event bus carried on one stream per adapter. The registry wires its
/// handlers before `connect`, so no event is ever observed unrouted.
#[derive(Debug)]
pub enum AdapterEvent {
    Message(InboundMessage),
    Error(AdapterError),
    Status(AdapterStatus),
}

/// Stream of adapter events.
pub type EventStream = Pin<Box<dyn Stream<Item = AdapterEvent> + Send>>;

/// Opaque handle identifying a live outbound message being edited during
/// streaming. `context` carries the channel-specific coordinates (chat id,
/// message id, thread id).
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub id: uuid::Uuid,
    pub context: serde_json::Value,
}

impl StreamHandle {
    pub fn new(context: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            context,
        }
    }

    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(|v| v.as_str())
    }

    pub fn context_i64(&self, key: &str) -> Option<i64> {
        self.context.get(key).and_then(|v| v.as_i64())
    }
}

/// Connection-status cell shared between an adapter and its background
/// tasks. Validates transitions and emits exactly one status event each.
pub struct StatusCell {
    channel: ChannelType,
    state: Mutex<AdapterStatus>,
    events: Mutex<Option<mpsc::Sender<AdapterEvent>>>,
}

impl StatusCell {
    pub fn new(channel: ChannelType) -> Self {
        Self {
            channel,
            state: Mutex::new(AdapterStatus::Disconnected),
            events: Mutex::new(None),
        }
    }

    /// Attach the event sender created by `connect`. Replaces any sender
    /// from a previous connection.
    pub fn attach(&self, sender: mpsc::Sender<AdapterEvent>) {
        *self.events.lock().expect("status events lock") = Some(sender);
    }

    pub fn status(&self) -> AdapterStatus {
        *self.state.lock().expect("status lock")
    }

    /// Begin a connect attempt. From `Connected` this is the idempotent
    /// no-op (returns false); from `Connecting` it is an error; from
    /// `Disconnected` it transitions and returns true.
    pub fn begin_connect(&self) -> std::result::Result<bool, AdapterError> {
        let mut state = self.state.lock().expect("status lock");
        match *state {
            AdapterStatus::Connected => Ok(false),
            AdapterStatus::Connecting => Err(AdapterError::AlreadyConnecting {
                channel: self.channel,
            }),
            AdapterStatus::Disconnected => {
                *state = AdapterStatus::Connecting;
                drop(state);
                self.emit(AdapterStatus::Connecting);
                Ok(true)
            }
        }
    }

    /// Mark the connection established. Legal only from `Connecting`.
    pub fn mark_connected(&self) {
        let mut state = self.state.lock().expect("status lock");
        if *state == AdapterStatus::Connecting {
            *state = AdapterStatus::Connected;
            drop(state);
            self.emit(AdapterStatus::Connected);
        }
    }

    /// Drive to `Disconnected` from any state. Emits only when the state
    /// actually changed.
    pub fn mark_disconnected(&self) {
        let mut state = self.state.lock().expect("status lock");
        if *state != AdapterStatus::Disconnected {
            *state = AdapterStatus::Disconnected;
            drop(state);
            self.emit(AdapterStatus::Disconnected);
        }
    }

    fn emit(&self, status: AdapterStatus) {
        let events = self.events.lock().expect("status events lock");
        if let Some(sender) = events.as_ref() {
            // Status events are observability; a full bus must not block a
            // transition.
            if sender.try_send(AdapterEvent::Status(status)).is_err() {
                tracing::debug!(channel = %self.channel, %status, "status event dropped");
            }
        }
    }
}

/// Static trait for channel adapters. Use this for type-safe
/// implementations.
pub trait Adapter: Send + Sync + 'static {
    /// The surface this adapter serves.
    fn channel(&self) -> ChannelType;

    /// Current connection status.
    fn status(&self) -> AdapterStatus;

    /// Whether the adapter can progressively edit a live outbound message.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Connect to the platform and return the adapter's event stream.
    /// Idempotent from `Connected`; an error from `Connecting`.
    fn connect(&self) -> impl std::future::Future<Output = Result<EventStream>> + Send;

    /// Disconnect, cancelling polling loops, sockets, and timers. Completes
    /// after all background work has drained.
    fn disconnect(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Deliver a message to a user on this surface. Fails with
    /// `unknown-user` when the adapter has no mapping for the user.
    fn send(
        &self,
        user_id: &UserId,
        message: OutboundMessage,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Resolve a platform-opaque attachment handle into a usable URL.
    fn handle_attachment(
        &self,
        attachment: Attachment,
    ) -> impl std::future::Future<Output = Result<Attachment>> + Send {
        async move { Ok(attachment) }
    }

    /// Pure translation from the common dialect to platform conventions.
    fn format_outgoing(&self, message: OutboundMessage) -> OutboundMessage {
        message
    }

    /// Send an editable placeholder and return its handle.
    fn stream_start(
        &self,
        _user_id: &UserId,
        _conversation_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<StreamHandle>> + Send {
        async move {
            Err(AdapterError::Unsupported {
                channel: self.channel(),
                operation: "stream_start",
            }
            .into())
        }
    }

    /// Best-effort edit of the placeholder with the accumulated content.
    fn stream_update(
        &self,
        _handle: &StreamHandle,
        _content: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async move {
            Err(AdapterError::Unsupported {
                channel: self.channel(),
                operation: "stream_update",
            }
            .into())
        }
    }

    /// Finalize the stream. Content over the platform limit replaces the
    /// placeholder with a chunked sequence.
    fn stream_end(
        &self,
        _handle: &StreamHandle,
        _content: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async move {
            Err(AdapterError::Unsupported {
                channel: self.channel(),
                operation: "stream_end",
            }
            .into())
        }
    }

    /// Post a lightweight status line distinct from the streamed answer.
    fn send_tool_activity(
        &self,
        _user_id: &UserId,
        _handle: Option<&StreamHandle>,
        _activity: ToolActivity,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async move { Ok(()) }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Dynamic trait for runtime polymorphism. Use this when you need
/// `Arc<dyn AdapterDyn>` for storing different adapters.
pub trait AdapterDyn: Send + Sync + 'static {
    fn channel(&self) -> ChannelType;

    fn status(&self) -> AdapterStatus;

    fn supports_streaming(&self) -> bool;

    fn connect<'a>(&'a self) -> BoxFuture<'a, Result<EventStream>>;

    fn disconnect<'a>(&'a self) -> BoxFuture<'a, Result<()>>;

    fn send<'a>(
        &'a self,
        user_id: &'a UserId,
        message: OutboundMessage,
    ) -> BoxFuture<'a, Result<()>>;

    fn handle_attachment<'a>(
        &'a self,
        attachment: Attachment,
    ) -> BoxFuture<'a, Result<Attachment>>;

    fn format_outgoing(&self, message: OutboundMessage) -> OutboundMessage;

    fn stream_start<'a>(
        &'a self,
        user_id: &'a UserId,
        conversation_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<StreamHandle>>;

    fn stream_update<'a>(
        &'a self,
        handle: &'a StreamHandle,
        content: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    fn stream_end<'a>(
        &'a self,
        handle: &'a StreamHandle,
        content: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    fn send_tool_activity<'a>(
        &'a self,
        user_id: &'a UserId,
        handle: Option<&'a StreamHandle>,
        activity: ToolActivity,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Blanket implementation: any type implementing Adapter automatically
/// implements AdapterDyn.
impl<T: Adapter> AdapterDyn for T {
    fn channel(&self) -> ChannelType {
        Adapter::channel(self)
    }

    fn status(&self) -> AdapterStatus {
        Adapter::status(self)
    }

    fn supports_streaming(&self) -> bool {
        Adapter::supports_streaming(self)
    }

    fn connect<'a>(&'a self) -> BoxFuture<'a, Result<EventStream>> {
        Box::pin(Adapter::connect(self))
    }

    fn disconnect<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        Box::pin(Adapter::disconnect(self))
    }

    fn send<'a>(
        &'a self,
        user_id: &'a UserId,
        message: OutboundMessage,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(Adapter::send(self, user_id, message))
    }

    fn handle_attachment<'a>(
        &'a self,
        attachment: Attachment,
    ) -> BoxFuture<'a, Result<Attachment>> {
        Box::pin(Adapter::handle_attachment(self, attachment))
    }

    fn format_outgoing(&self, message: OutboundMessage) -> OutboundMessage {
        Adapter::format_outgoing(self, message)
    }

    fn stream_start<'a>(
        &'a self,
        user_id: &'a UserId,
        conversation_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<StreamHandle>> {
        Box::pin(Adapter::stream_start(self, user_id, conversation_id))
    }

    fn stream_update<'a>(
        &'a self,
        handle: &'a StreamHandle,
        content: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(Adapter::stream_update(self, handle, content))
    }

    fn stream_end<'a>(
        &'a self,
        handle: &'a StreamHandle,
        content: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(Adapter::stream_end(self, handle, content))
    }

    fn send_tool_activity<'a>(
        &'a self,
        user_id: &'a UserId,
        handle: Option<&'a StreamHandle>,
        activity: ToolActivity,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(Adapter::send_tool_activity(self, user_id, handle, activity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt as _;

    #[tokio::test]
    async fn status_cell_walks_the_legal_path_and_emits_once_each() {
        let cell = StatusCell::new(ChannelType::Telegram);
        let (tx, rx) = mpsc::channel(8);
        cell.attach(tx);

        assert_eq!(cell.status(), AdapterStatus::Disconnected);
        assert!(cell.begin_connect().unwrap());
        assert_eq!(cell.status(), AdapterStatus::Connecting);
        cell.mark_connected();
        assert_eq!(cell.status(), AdapterStatus::Connected);
        cell.mark_disconnected();
        assert_eq!(cell.status(), AdapterStatus::Disconnected);
        // Disconnect when already disconnected emits nothing.
        cell.mark_disconnected();

        drop(cell);
        let events: Vec<_> = tokio_stream::wrappers::ReceiverStream::new(rx)
            .collect()
            .await;
        let statuses: Vec<_> = events
            .iter()
            .map(|event| match event {
                AdapterEvent::Status(status) => *status,
                other => panic!("unexpected event: {other:?}"),
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                AdapterStatus::Connecting,
                AdapterStatus::Connected,
                AdapterStatus::Disconnected,
            ]
        );
    }

    #[test]
    fn connect_from_connected_is_a_no_op() {
        let cell = StatusCell::new(ChannelType::Discord);
        assert!(cell.begin_connect().unwrap());
        cell.mark_connected();
        assert!(!cell.begin_connect().unwrap());
        assert_eq!(cell.status(), AdapterStatus::Connected);
    }

    #[test]
    fn connect_while_connecting_is_an_error() {
        let cell = StatusCell::new(ChannelType::Discord);
        assert!(cell.begin_connect().unwrap());
        assert!(matches!(
            cell.begin_connect(),
            Err(AdapterError::AlreadyConnecting { .. })
        ));
    }

    #[test]
    fn failed_connect_falls_back_to_disconnected() {
        let cell = StatusCell::new(ChannelType::WhatsApp);
        assert!(cell.begin_connect().unwrap());
        cell.mark_disconnected();
        assert_eq!(cell.status(), AdapterStatus::Disconnected);
        // The cell can connect again after the failure.
        assert!(cell.begin_connect().unwrap());
    }

    struct MinimalAdapter;

    impl Adapter for MinimalAdapter {
        fn channel(&self) -> ChannelType {
            ChannelType::Mobile
        }

        fn status(&self) -> AdapterStatus {
            AdapterStatus::Disconnected
        }

        async fn connect(&self) -> Result<EventStream> {
            Ok(Box::pin(futures::stream::pending()))
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }

        async fn send(&self, _user_id: &UserId, _message: OutboundMessage) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_streaming_methods_report_unsupported() {
        let adapter = MinimalAdapter;
        assert!(!Adapter::supports_streaming(&adapter));

        let user = UserId::from("user-1");
        let result = Adapter::stream_start(&adapter, &user, None).await;
        assert!(matches!(
            result,
            Err(crate::Error::Adapter(AdapterError::Unsupported { .. }))
        ));

        // Attachments pass through unchanged by default.
        let attachment = Attachment::new(crate::AttachmentKind::File, "https://x/file");
        let resolved = Adapter::handle_attachment(&adapter, attachment.clone())
            .await
            .unwrap();
        assert_eq!(resolved.url, attachment.url);
    }

    #[tokio::test]
    async fn blanket_dyn_impl_delegates() {
        let adapter: std::sync::Arc<dyn AdapterDyn> = std::sync::Arc::new(MinimalAdapter);
        assert_eq!(adapter.channel(), ChannelType::Mobile);
        let user = UserId::from("user-1");
        adapter
            .send(&user, OutboundMessage::text("hello"))
            .await
            .unwrap();
    }
}
