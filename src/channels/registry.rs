//! Channel registry: owns adapter instances, routes inbound events to Brain,
//! and orchestrates streaming or accumulating outbound delivery.

use crate::approvals::ApprovalBroker;
use crate::brain::{BrainClient, ChatMessage, ChatRequest, StreamChunk};
use crate::channels::adapter::{AdapterDyn, AdapterEvent, AdapterStatus, StreamHandle};
use crate::identity::Deduplicator;
use crate::{
    Attachment, ChannelType, InboundMessage, OutboundMessage, Result, ToolActivity, UserId,
};
use futures::StreamExt as _;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Interval between progressive edits of a streaming reply. Platforms with
/// edit rate limits (Telegram, Discord) tolerate this comfortably.
const STREAM_EDIT_INTERVAL: Duration = Duration::from_millis(1500);

/// Canned user-facing failure message. Internal details stay in the logs.
const UPSTREAM_ERROR_TEXT: &str =
    "⚠️ Something went wrong while processing your message. Please try again.";

/// Key of the conversation-id reconciliation cache.
type ConvKey = (ChannelType, UserId, String);

struct Registration {
    adapter: Arc<dyn AdapterDyn>,
    events_task: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

/// Owns adapters, routes their inbound messages into Brain streams, and fans
/// replies back through the originating surface.
pub struct ChannelRegistry {
    brain: Arc<dyn BrainClient>,
    deduplicator: Option<Arc<Deduplicator>>,
    approvals: Option<Arc<ApprovalBroker>>,
    adapters: RwLock<HashMap<ChannelType, Registration>>,
    /// Channels each user has been seen on, updated per inbound message.
    user_channels: RwLock<HashMap<UserId, HashSet<ChannelType>>>,
    /// `(channel, user, incoming conversation id)` → effective id. The
    /// per-key mutex also serializes overlapping requests from the same
    /// tuple (tokio's mutex queue is fair, so arrival order is preserved).
    conversations: Mutex<HashMap<ConvKey, Arc<Mutex<Option<String>>>>>,
    shutdown: CancellationToken,
}

impl ChannelRegistry {
    pub fn new(brain: Arc<dyn BrainClient>) -> Self {
        Self {
            brain,
            deduplicator: None,
            approvals: None,
            adapters: RwLock::new(HashMap::new()),
            user_channels: RwLock::new(HashMap::new()),
            conversations: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_deduplicator(mut self, deduplicator: Arc<Deduplicator>) -> Self {
        self.deduplicator = Some(deduplicator);
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<ApprovalBroker>) -> Self {
        self.approvals = Some(approvals);
        self
    }

    /// Register and connect an adapter. An existing adapter of the same
    /// channel type is disconnected first (replace semantics). On connect
    /// failure the adapter is not retained and the error propagates.
    pub async fn register(self: &Arc<Self>, adapter: Arc<dyn AdapterDyn>) -> Result<()> {
        let channel = adapter.channel();

        if let Some(previous) = self.adapters.write().await.remove(&channel) {
            tracing::info!(%channel, "replacing registered adapter");
            previous.cancel.cancel();
            if let Err(error) = previous.adapter.disconnect().await {
                tracing::warn!(%channel, %error, "error disconnecting replaced adapter");
            }
            previous.events_task.abort();
        }

        let events = adapter.connect().await?;

        let cancel = self.shutdown.child_token();
        let events_task = tokio::spawn(Self::consume_events(
            Arc::downgrade(self),
            adapter.clone(),
            events,
            cancel.clone(),
        ));

        self.adapters.write().await.insert(
            channel,
            Registration {
                adapter,
                events_task,
                cancel,
            },
        );
        tracing::info!(%channel, "adapter registered");
        Ok(())
    }

    /// Unregister an adapter. Idempotent; disconnect errors are logged and
    /// swallowed.
    pub async fn unregister(&self, channel: ChannelType) {
        let Some(registration) = self.adapters.write().await.remove(&channel) else {
            return;
        };
        registration.cancel.cancel();
        if let Err(error) = registration.adapter.disconnect().await {
            tracing::warn!(%channel, %error, "error during adapter disconnect");
        }
        registration.events_task.abort();
        tracing::info!(%channel, "adapter unregistered");
    }

    /// Disconnect everything, all-settled: one adapter failing to shut down
    /// never blocks the others.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let channels: Vec<ChannelType> = self.adapters.read().await.keys().copied().collect();
        futures::future::join_all(
            channels
                .into_iter()
                .map(|channel| self.unregister(channel)),
        )
        .await;
    }

    /// Current status of a registered adapter.
    pub async fn adapter_status(&self, channel: ChannelType) -> Option<AdapterStatus> {
        self.adapters
            .read()
            .await
            .get(&channel)
            .map(|registration| registration.adapter.status())
    }

    /// Send to one channel; a missing channel is a warned no-op.
    pub async fn send_to_channel(
        &self,
        channel: ChannelType,
        user_id: &UserId,
        message: OutboundMessage,
    ) -> Result<()> {
        let adapter = {
            let adapters = self.adapters.read().await;
            match adapters.get(&channel) {
                Some(registration) => registration.adapter.clone(),
                None => {
                    tracing::warn!(%channel, %user_id, "send to unregistered channel dropped");
                    return Ok(());
                }
            }
        };
        let message = adapter.format_outgoing(message);
        adapter.send(user_id, message).await
    }

    /// Fan out to every channel the user has been seen on. All-settled:
    /// individual failures are logged and do not cancel peers.
    pub async fn broadcast_to_user(
        &self,
        user_id: &UserId,
        message: OutboundMessage,
        exclude: Option<ChannelType>,
    ) {
        let channels: Vec<ChannelType> = {
            let tracked = self.user_channels.read().await;
            tracked
                .get(user_id)
                .map(|set| {
                    set.iter()
                        .copied()
                        .filter(|channel| Some(*channel) != exclude)
                        .collect()
                })
                .unwrap_or_default()
        };

        let sends = channels.into_iter().map(|channel| {
            let message = message.clone();
            async move {
                if let Err(error) = self.send_to_channel(channel, user_id, message).await {
                    tracing::warn!(%channel, %user_id, %error, "broadcast send failed");
                }
            }
        });
        futures::future::join_all(sends).await;
    }

    /// Channels this user has been seen on.
    pub async fn channels_for_user(&self, user_id: &UserId) -> Vec<ChannelType> {
        self.user_channels
            .read()
            .await
            .get(user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn track_user_channel(&self, user_id: &UserId, channel: ChannelType) {
        self.user_channels
            .write()
            .await
            .entry(user_id.clone())
            .or_default()
            .insert(channel);
    }

    pub async fn untrack_user_channel(&self, user_id: &UserId, channel: ChannelType) {
        let mut tracked = self.user_channels.write().await;
        if let Some(set) = tracked.get_mut(user_id) {
            set.remove(&channel);
            if set.is_empty() {
                tracked.remove(user_id);
            }
        }
    }

    async fn consume_events(
        registry: std::sync::Weak<Self>,
        adapter: Arc<dyn AdapterDyn>,
        mut events: crate::channels::adapter::EventStream,
        cancel: CancellationToken,
    ) {
        let channel = adapter.channel();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                AdapterEvent::Message(message) => {
                    let Some(registry) = registry.upgrade() else {
                        break;
                    };
                    registry
                        .track_user_channel(&message.user_id, channel)
                        .await;
                    let adapter = adapter.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        registry.route_message(adapter, message, cancel).await;
                    });
                }
                AdapterEvent::Error(error) => {
                    tracing::warn!(%channel, %error, "adapter error");
                }
                AdapterEvent::Status(status) => {
                    tracing::info!(%channel, %status, "adapter status changed");
                }
            }
        }
        tracing::debug!(%channel, "adapter event loop ended");
    }

    /// Route one inbound message: dedup, attachment resolution,
    /// conversation-id reconciliation, then the Brain stream dispatched to
    /// the streaming or accumulate path.
    pub async fn route_message(
        &self,
        adapter: Arc<dyn AdapterDyn>,
        message: InboundMessage,
        cancel: CancellationToken,
    ) {
        let channel = message.channel;

        if let Some(deduplicator) = &self.deduplicator {
            match deduplicator
                .is_duplicate(&message.user_id, &message.content, channel)
                .await
            {
                Ok(true) => {
                    tracing::info!(
                        %channel,
                        user_id = %message.user_id,
                        "duplicate message dropped"
                    );
                    return;
                }
                Ok(false) => {}
                Err(error) => {
                    // Dedup is advisory; a store hiccup must not drop mail.
                    tracing::warn!(%channel, %error, "dedup check failed, continuing");
                }
            }
        }

        let attachments = self.resolve_attachments(&adapter, &message).await;

        let conv_entry = self
            .conversation_entry(
                channel,
                &message.user_id,
                message.conversation_id.as_deref(),
            )
            .await;
        // Holding the entry lock serializes overlapping requests from the
        // same (channel, user, conversation) tuple.
        let mut effective = conv_entry.lock().await;
        let conversation_id = effective
            .clone()
            .or_else(|| message.conversation_id.clone())
            .unwrap_or_default();

        let mut parameters = HashMap::new();
        parameters.insert("channel".to_string(), channel.as_str().to_string());
        if !attachments.is_empty() {
            match serde_json::to_string(&attachments) {
                Ok(json) => {
                    parameters.insert("attachments".to_string(), json);
                }
                Err(error) => {
                    tracing::warn!(%error, "failed to encode attachments, omitting");
                }
            }
        }

        let request = ChatRequest {
            user_id: message.user_id.to_string(),
            workspace_id: message.workspace_id.to_string(),
            conversation_id,
            messages: vec![ChatMessage::user(&message.content)],
            provider: String::new(),
            model: String::new(),
            parameters,
        };

        let stream = match self.brain.stream_chat(request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(%channel, %error, "failed to open brain stream");
                self.send_canned_error(&adapter, &message).await;
                return;
            }
        };

        let authoritative = if adapter.supports_streaming() {
            self.run_streaming(&adapter, &message, stream, &cancel).await
        } else {
            self.run_accumulate(&adapter, &message, stream, &cancel).await
        };

        // Cache update is monotonic: an authoritative id is never replaced
        // by nothing.
        if let Some(conversation_id) = authoritative {
            *effective = Some(conversation_id);
        }
    }

    async fn resolve_attachments(
        &self,
        adapter: &Arc<dyn AdapterDyn>,
        message: &InboundMessage,
    ) -> Vec<Attachment> {
        let resolutions = message.attachments.iter().map(|attachment| {
            let adapter = adapter.clone();
            let attachment = attachment.clone();
            async move {
                let url = attachment.url.clone();
                match adapter.handle_attachment(attachment.clone()).await {
                    Ok(resolved) => resolved,
                    Err(error) => {
                        tracing::warn!(%url, %error, "attachment resolution failed");
                        attachment
                    }
                }
            }
        });
        futures::future::join_all(resolutions).await
    }

    async fn conversation_entry(
        &self,
        channel: ChannelType,
        user_id: &UserId,
        incoming: Option<&str>,
    ) -> Arc<Mutex<Option<String>>> {
        let key = (
            channel,
            user_id.clone(),
            incoming.unwrap_or_default().to_string(),
        );
        self.conversations
            .lock()
            .await
            .entry(key)
            .or_default()
            .clone()
    }

    /// Streaming path: placeholder, throttled serial edits, final edit.
    /// Returns the authoritative conversation id from `Done`, if any.
    async fn run_streaming(
        &self,
        adapter: &Arc<dyn AdapterDyn>,
        message: &InboundMessage,
        mut stream: crate::brain::ChunkStream,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let channel = message.channel;
        let handle = match adapter
            .stream_start(&message.user_id, message.conversation_id.as_deref())
            .await
        {
            Ok(handle) => handle,
            Err(error) => {
                tracing::warn!(%channel, %error, "stream_start failed, accumulating instead");
                return self.run_accumulate(adapter, message, stream, cancel).await;
            }
        };

        let mut full_content = String::new();
        let mut authoritative = None;
        let mut flush_at: Option<Instant> = None;
        let mut outcome = StreamOutcome::Eof;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    outcome = StreamOutcome::Cancelled;
                    break;
                }
                // The edit is awaited inside this arm, so at most one
                // stream_update is ever in flight per handle.
                _ = sleep_until_opt(flush_at) => {
                    flush_at = None;
                    if let Err(error) = adapter.stream_update(&handle, &full_content).await {
                        tracing::warn!(%channel, %error, "stream update failed");
                    }
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(StreamChunk::ContentDelta { text, metadata })) => {
                        if text.is_empty() {
                            self.forward_activity(adapter, message, &handle, &metadata).await;
                        } else {
                            full_content.push_str(&text);
                            if flush_at.is_none() {
                                flush_at = Some(Instant::now() + STREAM_EDIT_INTERVAL);
                            }
                        }
                    }
                    Some(Ok(StreamChunk::ToolCall)) => {}
                    Some(Ok(StreamChunk::Done { conversation_id })) => {
                        authoritative = conversation_id;
                        outcome = StreamOutcome::Done;
                        break;
                    }
                    Some(Ok(StreamChunk::Error { message: error })) => {
                        tracing::error!(%channel, %error, "brain stream reported error");
                        outcome = StreamOutcome::Errored;
                        break;
                    }
                    Some(Err(error)) => {
                        tracing::error!(%channel, %error, "brain stream aborted");
                        outcome = StreamOutcome::Errored;
                        break;
                    }
                    None => break,
                }
            }
        }

        // Every terminal state cleans up: the pending flush timer dies with
        // the loop, and the placeholder is finalized or superseded.
        match outcome {
            StreamOutcome::Done => {
                if let Err(error) = adapter.stream_end(&handle, &full_content).await {
                    tracing::warn!(%channel, %error, "stream_end failed, sending as message");
                    let fallback = adapter
                        .format_outgoing(OutboundMessage::text(full_content.clone()));
                    if let Err(error) = adapter.send(&message.user_id, fallback).await {
                        tracing::error!(%channel, %error, "fallback send failed");
                    }
                }
            }
            StreamOutcome::Errored => {
                self.send_canned_error(adapter, message).await;
            }
            StreamOutcome::Eof => {
                // Upstream hung up without Done: finalize what we have.
                if !full_content.is_empty() {
                    if let Err(error) = adapter.stream_end(&handle, &full_content).await {
                        tracing::warn!(%channel, %error, "stream_end after eof failed");
                    }
                }
            }
            StreamOutcome::Cancelled => {}
        }

        authoritative
    }

    /// Accumulate path: concatenate all deltas and send once on `Done`.
    async fn run_accumulate(
        &self,
        adapter: &Arc<dyn AdapterDyn>,
        message: &InboundMessage,
        mut stream: crate::brain::ChunkStream,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let channel = message.channel;
        let mut full_content = String::new();
        let mut authoritative = None;
        let mut outcome = StreamOutcome::Eof;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    outcome = StreamOutcome::Cancelled;
                    break;
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(StreamChunk::ContentDelta { text, metadata })) => {
                        if text.is_empty() {
                            self.note_approval_request(message, &metadata).await;
                        } else {
                            full_content.push_str(&text);
                        }
                    }
                    Some(Ok(StreamChunk::ToolCall)) => {}
                    Some(Ok(StreamChunk::Done { conversation_id })) => {
                        authoritative = conversation_id;
                        outcome = StreamOutcome::Done;
                        break;
                    }
                    Some(Ok(StreamChunk::Error { message: error })) => {
                        tracing::error!(%channel, %error, "brain stream reported error");
                        outcome = StreamOutcome::Errored;
                        break;
                    }
                    Some(Err(error)) => {
                        tracing::error!(%channel, %error, "brain stream aborted");
                        outcome = StreamOutcome::Errored;
                        break;
                    }
                    None => break,
                }
            }
        }

        match outcome {
            StreamOutcome::Done | StreamOutcome::Eof => {
                if !full_content.is_empty() {
                    let outbound = adapter.format_outgoing(
                        OutboundMessage::text(full_content)
                            .in_conversation(authoritative.clone().unwrap_or_default()),
                    );
                    if let Err(error) = adapter.send(&message.user_id, outbound).await {
                        tracing::error!(%channel, %error, "send of accumulated reply failed");
                    }
                }
            }
            StreamOutcome::Errored => {
                self.send_canned_error(adapter, message).await;
            }
            StreamOutcome::Cancelled => {}
        }

        authoritative
    }

    /// Forward a metadata-only delta as tool activity, suppressing
    /// `routing_info` (noise on chat surfaces) and registering approval
    /// requests with the broker.
    async fn forward_activity(
        &self,
        adapter: &Arc<dyn AdapterDyn>,
        message: &InboundMessage,
        handle: &StreamHandle,
        metadata: &HashMap<String, String>,
    ) {
        self.note_approval_request(message, metadata).await;

        let Some(activity) = ToolActivity::from_metadata(metadata) else {
            return;
        };
        if activity.status == crate::AgentStatus::RoutingInfo {
            return;
        }
        if let Err(error) = adapter
            .send_tool_activity(&message.user_id, Some(handle), activity)
            .await
        {
            tracing::debug!(channel = %message.channel, %error, "tool activity dropped");
        }
    }

    async fn note_approval_request(
        &self,
        message: &InboundMessage,
        metadata: &HashMap<String, String>,
    ) {
        let Some(approvals) = &self.approvals else {
            return;
        };
        if metadata.get("agent_status").map(String::as_str) != Some("waiting_approval") {
            return;
        }
        let Some(approval_id) = metadata.get("approval_id") else {
            return;
        };
        let description = metadata
            .get("tool_args")
            .cloned()
            .unwrap_or_else(|| "Approval required".to_string());
        let task_id = metadata.get("task_id").cloned().unwrap_or_default();

        if let Err(error) = approvals
            .send_approval_request_for_user(
                &message.user_id,
                approval_id,
                &description,
                &task_id,
                serde_json::json!({ "channel": message.channel.as_str() }),
            )
            .await
        {
            tracing::warn!(%approval_id, %error, "failed to surface approval request");
        }
    }

    async fn send_canned_error(
        &self,
        adapter: &Arc<dyn AdapterDyn>,
        message: &InboundMessage,
    ) {
        let outbound = adapter.format_outgoing(OutboundMessage::text(UPSTREAM_ERROR_TEXT));
        if let Err(error) = adapter.send(&message.user_id, outbound).await {
            tracing::warn!(
                channel = %message.channel,
                %error,
                "failed to deliver error notice"
            );
        }
    }
}

enum StreamOutcome {
    Done,
    Errored,
    Eof,
    Cancelled,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
