//! End-to-end registry flow against a mock adapter and a scripted Brain:
//! dedup suppression, conversation-id reconciliation, streaming and
//! accumulate dispatch, error fallbacks, and lifecycle semantics.

use async_trait::async_trait;
use futures::StreamExt as _;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use switchboard::brain::{ApprovalOutcome, BrainClient, ChatRequest, ChunkStream, StreamChunk};
use switchboard::channels::adapter::{
    Adapter, AdapterEvent, AdapterStatus, EventStream, StatusCell, StreamHandle,
};
use switchboard::channels::ChannelRegistry;
use switchboard::error::BrainError;
use switchboard::identity::Deduplicator;
use switchboard::store::MemoryStore;
use switchboard::{
    ChannelType, InboundMessage, OutboundMessage, Result, ToolActivity, UserId, WorkspaceId,
};
use tokio::sync::mpsc;

// -- Scripted Brain --

struct MockBrain {
    scripts: StdMutex<VecDeque<Vec<StreamChunk>>>,
    requests: Arc<StdMutex<Vec<ChatRequest>>>,
    chunk_delay: Duration,
}

impl MockBrain {
    fn new(chunk_delay: Duration) -> Self {
        Self {
            scripts: StdMutex::new(VecDeque::new()),
            requests: Arc::default(),
            chunk_delay,
        }
    }

    fn script(&self, chunks: Vec<StreamChunk>) {
        self.scripts.lock().unwrap().push_back(chunks);
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, index: usize) -> ChatRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl BrainClient for MockBrain {
    async fn stream_chat(&self, request: ChatRequest) -> std::result::Result<ChunkStream, BrainError> {
        self.requests.lock().unwrap().push(request);
        let chunks = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                vec![StreamChunk::Done {
                    conversation_id: None,
                }]
            });
        let delay = self.chunk_delay;
        let stream = futures::stream::iter(chunks.into_iter().map(Ok)).then(move |chunk| {
            async move {
                tokio::time::sleep(delay).await;
                chunk
            }
        });
        Ok(Box::pin(stream))
    }

    async fn approve_action(
        &self,
        _approval_id: &str,
        _user_id: &UserId,
        _approved: bool,
    ) -> std::result::Result<ApprovalOutcome, BrainError> {
        Ok(ApprovalOutcome::ok())
    }

    async fn list_pending_approvals(
        &self,
        _user_id: &UserId,
        _workspace_id: &WorkspaceId,
    ) -> std::result::Result<Vec<String>, BrainError> {
        Ok(Vec::new())
    }
}

// -- Recording adapter --

#[derive(Debug, Clone, PartialEq)]
enum Call {
    StreamStart,
    StreamUpdate(String),
    StreamEnd(String),
    Send(String),
    Activity(String),
    Disconnect,
}

struct MockAdapter {
    channel: ChannelType,
    streaming: bool,
    status: StatusCell,
    calls: Arc<StdMutex<Vec<Call>>>,
    inject: Arc<StdMutex<Option<mpsc::Sender<AdapterEvent>>>>,
    fail_sends: AtomicBool,
}

impl MockAdapter {
    fn new(channel: ChannelType, streaming: bool) -> Self {
        Self {
            channel,
            streaming,
            status: StatusCell::new(channel),
            calls: Arc::default(),
            inject: Arc::default(),
            fail_sends: AtomicBool::new(false),
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    async fn inject(&self, message: InboundMessage) {
        let sender = self.inject.lock().unwrap().clone().expect("connected");
        sender
            .send(AdapterEvent::Message(message))
            .await
            .expect("registry listening");
    }
}

impl Adapter for MockAdapter {
    fn channel(&self) -> ChannelType {
        self.channel
    }

    fn status(&self) -> AdapterStatus {
        self.status.status()
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn connect(&self) -> Result<EventStream> {
        self.status.begin_connect()?;
        let (tx, rx) = mpsc::channel(16);
        self.status.attach(tx.clone());
        *self.inject.lock().unwrap() = Some(tx);
        self.status.mark_connected();
        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn disconnect(&self) -> Result<()> {
        self.record(Call::Disconnect);
        self.status.mark_disconnected();
        Ok(())
    }

    async fn send(&self, _user_id: &UserId, message: OutboundMessage) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(switchboard::error::AdapterError::SendFailed {
                channel: self.channel,
                reason: "configured to fail".into(),
            }
            .into());
        }
        self.record(Call::Send(message.content));
        Ok(())
    }

    async fn stream_start(
        &self,
        _user_id: &UserId,
        _conversation_id: Option<&str>,
    ) -> Result<StreamHandle> {
        self.record(Call::StreamStart);
        Ok(StreamHandle::new(serde_json::json!({})))
    }

    async fn stream_update(&self, _handle: &StreamHandle, content: &str) -> Result<()> {
        self.record(Call::StreamUpdate(content.to_string()));
        Ok(())
    }

    async fn stream_end(&self, _handle: &StreamHandle, content: &str) -> Result<()> {
        self.record(Call::StreamEnd(content.to_string()));
        Ok(())
    }

    async fn send_tool_activity(
        &self,
        _user_id: &UserId,
        _handle: Option<&StreamHandle>,
        activity: ToolActivity,
    ) -> Result<()> {
        self.record(Call::Activity(activity.status.as_str().to_string()));
        Ok(())
    }
}

// -- Helpers --

fn delta(text: &str) -> StreamChunk {
    StreamChunk::ContentDelta {
        text: text.to_string(),
        metadata: Default::default(),
    }
}

fn status_delta(status: &str) -> StreamChunk {
    let mut metadata = std::collections::HashMap::new();
    metadata.insert("agent_status".to_string(), status.to_string());
    StreamChunk::ContentDelta {
        text: String::new(),
        metadata,
    }
}

fn inbound(content: &str) -> InboundMessage {
    InboundMessage::new(ChannelType::Telegram, "user-7", "ws-1", content)
        .with_conversation("telegram-conv:100")
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not met in time");
}

// -- Tests --

#[tokio::test(start_paused = true)]
async fn duplicate_messages_never_reach_brain() {
    let brain = Arc::new(MockBrain::new(Duration::ZERO));
    let dedup = Arc::new(Deduplicator::new(Arc::new(MemoryStore::new())));
    let registry = Arc::new(ChannelRegistry::new(brain.clone()).with_deduplicator(dedup));

    let adapter = Arc::new(MockAdapter::new(ChannelType::Telegram, true));
    registry.register(adapter.clone()).await.unwrap();

    brain.script(vec![delta("pong"), StreamChunk::Done { conversation_id: None }]);

    adapter.inject(inbound("Are you there?")).await;
    adapter.inject(inbound("Are you there?")).await;

    let brain_probe = brain.clone();
    wait_for(move || brain_probe.request_count() >= 1).await;
    // Give the second (suppressed) message time to have misbehaved.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(brain.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn streaming_path_updates_then_finalizes_and_caches_conversation() {
    // Chunks arrive slower than the flush interval so at least one
    // intermediate edit lands.
    let brain = Arc::new(MockBrain::new(Duration::from_millis(1600)));
    let registry = Arc::new(ChannelRegistry::new(brain.clone()));

    let adapter = Arc::new(MockAdapter::new(ChannelType::Telegram, true));
    registry.register(adapter.clone()).await.unwrap();

    brain.script(vec![
        delta("Hello "),
        delta("world"),
        StreamChunk::Done {
            conversation_id: Some("C1".to_string()),
        },
    ]);

    adapter.inject(inbound("Hi")).await;

    let probe = adapter.clone();
    wait_for(move || {
        probe
            .calls()
            .iter()
            .any(|call| matches!(call, Call::StreamEnd(_)))
    })
    .await;

    let calls = adapter.calls();
    assert_eq!(calls.first(), Some(&Call::StreamStart));
    let updates: Vec<&String> = calls
        .iter()
        .filter_map(|call| match call {
            Call::StreamUpdate(content) => Some(content),
            _ => None,
        })
        .collect();
    assert!(!updates.is_empty(), "expected at least one throttled edit");
    for update in &updates {
        assert!("Hello world".starts_with(update.as_str()));
    }
    assert!(calls.contains(&Call::StreamEnd("Hello world".to_string())));

    // The authoritative id from Done wins for the next message on the
    // same (channel, user, conversation) tuple.
    assert_eq!(brain.request(0).conversation_id, "telegram-conv:100");

    brain.script(vec![StreamChunk::Done { conversation_id: None }]);
    adapter.inject(inbound("And again")).await;
    let brain_probe = brain.clone();
    wait_for(move || brain_probe.request_count() >= 2).await;
    assert_eq!(brain.request(1).conversation_id, "C1");
}

#[tokio::test(start_paused = true)]
async fn accumulate_path_sends_exactly_once() {
    let brain = Arc::new(MockBrain::new(Duration::ZERO));
    let registry = Arc::new(ChannelRegistry::new(brain.clone()));

    let adapter = Arc::new(MockAdapter::new(ChannelType::WhatsApp, false));
    registry.register(adapter.clone()).await.unwrap();

    brain.script(vec![
        delta("part one, "),
        delta("part two"),
        StreamChunk::Done { conversation_id: None },
    ]);

    adapter
        .inject(InboundMessage::new(
            ChannelType::WhatsApp,
            "user-9",
            "ws-1",
            "hello",
        ))
        .await;

    let probe = adapter.clone();
    wait_for(move || !probe.calls().is_empty()).await;

    let calls = adapter.calls();
    assert_eq!(calls, vec![Call::Send("part one, part two".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn upstream_error_produces_one_canned_message() {
    let brain = Arc::new(MockBrain::new(Duration::ZERO));
    let registry = Arc::new(ChannelRegistry::new(brain.clone()));

    let adapter = Arc::new(MockAdapter::new(ChannelType::Telegram, true));
    registry.register(adapter.clone()).await.unwrap();

    brain.script(vec![
        delta("partial"),
        StreamChunk::Error {
            message: "boom".to_string(),
        },
    ]);

    adapter.inject(inbound("Hi")).await;

    let probe = adapter.clone();
    wait_for(move || {
        probe
            .calls()
            .iter()
            .any(|call| matches!(call, Call::Send(_)))
    })
    .await;

    let calls = adapter.calls();
    let sends: Vec<&String> = calls
        .iter()
        .filter_map(|call| match call {
            Call::Send(content) => Some(content),
            _ => None,
        })
        .collect();
    assert_eq!(sends.len(), 1);
    assert!(sends[0].contains("went wrong"));
    assert!(!calls.iter().any(|call| matches!(call, Call::StreamEnd(_))));
}

#[tokio::test(start_paused = true)]
async fn routing_info_is_suppressed_but_tool_activity_forwards() {
    let brain = Arc::new(MockBrain::new(Duration::ZERO));
    let registry = Arc::new(ChannelRegistry::new(brain.clone()));

    let adapter = Arc::new(MockAdapter::new(ChannelType::Telegram, true));
    registry.register(adapter.clone()).await.unwrap();

    brain.script(vec![
        status_delta("routing_info"),
        status_delta("tool_start"),
        delta("answer"),
        StreamChunk::Done { conversation_id: None },
    ]);

    adapter.inject(inbound("Hi")).await;

    let probe = adapter.clone();
    wait_for(move || {
        probe
            .calls()
            .iter()
            .any(|call| matches!(call, Call::StreamEnd(_)))
    })
    .await;

    let activities: Vec<Call> = adapter
        .calls()
        .into_iter()
        .filter(|call| matches!(call, Call::Activity(_)))
        .collect();
    assert_eq!(activities, vec![Call::Activity("tool_start".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn broadcast_is_all_settled_across_channels() {
    let brain = Arc::new(MockBrain::new(Duration::ZERO));
    let registry = Arc::new(ChannelRegistry::new(brain.clone()));

    let telegram = Arc::new(MockAdapter::new(ChannelType::Telegram, true));
    let whatsapp = Arc::new(MockAdapter::new(ChannelType::WhatsApp, false));
    registry.register(telegram.clone()).await.unwrap();
    registry.register(whatsapp.clone()).await.unwrap();

    let user: UserId = UserId::from("user-7");
    registry.track_user_channel(&user, ChannelType::Telegram).await;
    registry.track_user_channel(&user, ChannelType::WhatsApp).await;

    telegram.fail_sends.store(true, Ordering::SeqCst);
    registry
        .broadcast_to_user(&user, OutboundMessage::text("ping"), None)
        .await;

    // The failing channel does not cancel its peer.
    assert_eq!(whatsapp.calls(), vec![Call::Send("ping".to_string())]);

    // Excluded channels are skipped.
    whatsapp.calls.lock().unwrap().clear();
    registry
        .broadcast_to_user(
            &user,
            OutboundMessage::text("again"),
            Some(ChannelType::WhatsApp),
        )
        .await;
    assert!(whatsapp.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn register_replaces_and_unregister_is_idempotent() {
    let brain = Arc::new(MockBrain::new(Duration::ZERO));
    let registry = Arc::new(ChannelRegistry::new(brain.clone()));

    let first = Arc::new(MockAdapter::new(ChannelType::Telegram, true));
    let second = Arc::new(MockAdapter::new(ChannelType::Telegram, true));

    registry.register(first.clone()).await.unwrap();
    registry.register(second.clone()).await.unwrap();

    // Replace semantics: the first adapter was disconnected.
    assert!(first.calls().contains(&Call::Disconnect));
    assert_eq!(
        registry.adapter_status(ChannelType::Telegram).await,
        Some(AdapterStatus::Connected)
    );

    registry.unregister(ChannelType::Telegram).await;
    registry.unregister(ChannelType::Telegram).await; // no-op
    assert_eq!(registry.adapter_status(ChannelType::Telegram).await, None);
    assert!(second.calls().contains(&Call::Disconnect));
}

#[tokio::test(start_paused = true)]
async fn shutdown_disconnects_every_adapter() {
    let brain = Arc::new(MockBrain::new(Duration::ZERO));
    let registry = Arc::new(ChannelRegistry::new(brain.clone()));

    let telegram = Arc::new(MockAdapter::new(ChannelType::Telegram, true));
    let whatsapp = Arc::new(MockAdapter::new(ChannelType::WhatsApp, false));
    registry.register(telegram.clone()).await.unwrap();
    registry.register(whatsapp.clone()).await.unwrap();

    registry.shutdown().await;

    assert!(telegram.calls().contains(&Call::Disconnect));
    assert!(whatsapp.calls().contains(&Call::Disconnect));
    assert_eq!(registry.adapter_status(ChannelType::Telegram).await, None);
    assert_eq!(registry.adapter_status(ChannelType::WhatsApp).await, None);
}

#[tokio::test(start_paused = true)]
async fn send_to_missing_channel_is_a_warned_no_op() {
    let brain = Arc::new(MockBrain::new(Duration::ZERO));
    let registry = Arc::new(ChannelRegistry::new(brain.clone()));

    let user: UserId = UserId::from("user-7");
    registry
        .send_to_channel(ChannelType::Discord, &user, OutboundMessage::text("x"))
        .await
        .unwrap();
}
