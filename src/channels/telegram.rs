//! Telegram channel adapter using teloxide.
//!
//! ## Features
//!
//! **Inbound**
//! - Long polling (30 s server timeout, offset advance, 5 s error backoff)
//!   or webhook mode, converging on one update processor
//! - Commands (`/start`, `/help`), task-mode prefix (`!goal`)
//! - Callback queries for approval keyboards, plus free-text
//!   approve/deny keywords while an approval is pending for the chat
//! - Forum topics: `message_thread_id` is threaded through every outbound
//! - `allowed_user_ids` filtering
//!
//! **Outbound**
//! - Markdown with plain-text retry when Telegram rejects the entity parse
//! - Smart chunking to the 4000-char message limit
//! - Streaming via `editMessageText` with a trailing cursor
//! - Typing indicator refreshed under the platform expiry

use crate::approvals::ApprovalBroker;
use crate::channels::adapter::{
    Adapter, AdapterEvent, AdapterStatus, EventStream, StatusCell, StreamHandle,
};
use crate::config::{TelegramConfig, TelegramMode};
use crate::error::AdapterError;
use crate::identity::{ChannelIdentity, IdentityStore};
use crate::text::chunk_text;
use crate::{
    Attachment, AttachmentKind, ChannelType, InboundMessage, MessageMetadata, OutboundMessage,
    Result, ToolActivity, UserId,
};
use anyhow::Context as _;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use teloxide::payloads::setters::*;
use teloxide::requests::{Request as _, Requester};
use teloxide::types::{
    ChatAction, ChatId, FileId, InlineKeyboardButton, InlineKeyboardMarkup, Me, MessageId,
    ParseMode, ThreadId, Update, UpdateKind,
};
use teloxide::ApiError;
use teloxide::Bot;
use teloxide::RequestError;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Telegram rejects messages beyond 4096 chars; stay under with margin for
/// the streaming cursor.
const MAX_MESSAGE_LEN: usize = 4000;

/// Long-poll server-side timeout in seconds.
const POLL_TIMEOUT_SECS: u32 = 30;

/// Backoff after a failed getUpdates round.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Telegram's typing indicator expires after ~5 s; refresh under that.
const TYPING_REFRESH: Duration = Duration::from_secs(4);

const STREAM_CURSOR: &str = "▌";
const PLACEHOLDER_TEXT: &str = "🤔 Thinking…";

const APPROVE_KEYWORDS: &[&str] = &["approve", "yes", "go ahead", "confirm", "do it", "ok"];
const DENY_KEYWORDS: &[&str] = &["deny", "no", "reject", "cancel", "stop"];

/// Where a user's messages land: chat plus optional forum topic.
#[derive(Debug, Clone, Copy)]
struct ChatTarget {
    chat_id: i64,
    thread_id: Option<i32>,
}

struct Connection {
    cancel: CancellationToken,
    tasks: TaskTracker,
}

pub struct TelegramChannel {
    inner: Arc<Inner>,
}

struct Inner {
    bot: Bot,
    config: TelegramConfig,
    /// Snapshot-swapped so the allowlist can be updated without a restart.
    allowed_user_ids: arc_swap::ArcSwap<Option<Vec<u64>>>,
    status: StatusCell,
    events: StdMutex<Option<tokio::sync::mpsc::Sender<AdapterEvent>>>,
    /// Last known chat target per logical user.
    chats: RwLock<HashMap<UserId, ChatTarget>>,
    /// Typing refresh tasks keyed by chat id.
    typing: Mutex<HashMap<i64, JoinHandle<()>>>,
    /// Approval ids with a visible keyboard, per chat, newest last.
    pending_approvals: RwLock<HashMap<i64, Vec<String>>>,
    identities: Option<Arc<IdentityStore>>,
    approvals: Option<Arc<ApprovalBroker>>,
    connection: Mutex<Option<Connection>>,
    me: RwLock<Option<Me>>,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig) -> Self {
        let bot = Bot::new(&config.bot_token);
        let allowed_user_ids = arc_swap::ArcSwap::from_pointee(config.allowed_user_ids.clone());
        Self {
            inner: Arc::new(Inner {
                bot,
                config,
                allowed_user_ids,
                status: StatusCell::new(ChannelType::Telegram),
                events: StdMutex::new(None),
                chats: RwLock::new(HashMap::new()),
                typing: Mutex::new(HashMap::new()),
                pending_approvals: RwLock::new(HashMap::new()),
                identities: None,
                approvals: None,
                connection: Mutex::new(None),
                me: RwLock::new(None),
            }),
        }
    }

    /// Swap in a new user allowlist; the next update sees it.
    pub fn set_allowed_user_ids(&self, allowed: Option<Vec<u64>>) {
        self.inner.allowed_user_ids.store(Arc::new(allowed));
    }

    pub fn with_identities(mut self, identities: Arc<IdentityStore>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_identities before sharing")
            .identities = Some(identities);
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<ApprovalBroker>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_approvals before sharing")
            .approvals = Some(approvals);
        self
    }

    /// Entry point for webhook mode: the host HTTP layer feeds raw updates
    /// here, converging with the polling path.
    pub async fn process_webhook_update(&self, update: Update) {
        self.inner.process_update(update).await;
    }
}

impl Adapter for TelegramChannel {
    fn channel(&self) -> ChannelType {
        ChannelType::Telegram
    }

    fn status(&self) -> AdapterStatus {
        self.inner.status.status()
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<EventStream> {
        if !self.inner.status.begin_connect()? {
            tracing::debug!("telegram already connected, connect is a no-op");
            return Ok(Box::pin(futures::stream::pending()));
        }

        let (events_tx, events_rx) = tokio::sync::mpsc::channel(256);
        self.inner.status.attach(events_tx.clone());
        *self.inner.events.lock().expect("events lock") = Some(events_tx);

        // Capture the bot identity up front; a bad token fails here.
        let me = match self.inner.bot.get_me().await {
            Ok(me) => me,
            Err(error) => {
                self.inner.status.mark_disconnected();
                return Err(AdapterError::ConnectFailed {
                    channel: ChannelType::Telegram,
                    reason: error.to_string(),
                }
                .into());
            }
        };
        tracing::info!(bot = %me.username(), "telegram bot identified");
        *self.inner.me.write().await = Some(me);

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();

        match self.inner.config.mode {
            TelegramMode::Polling => {
                let inner = self.inner.clone();
                let token = cancel.clone();
                tasks.spawn(async move {
                    inner.poll_loop(token).await;
                });
            }
            TelegramMode::Webhook => {
                let url = self
                    .inner
                    .config
                    .webhook_url
                    .clone()
                    .ok_or_else(|| AdapterError::ConnectFailed {
                        channel: ChannelType::Telegram,
                        reason: "webhook mode without webhook_url".into(),
                    })?;
                if let Err(error) = self.inner.bot.set_webhook(url).await {
                    self.inner.status.mark_disconnected();
                    return Err(AdapterError::ConnectFailed {
                        channel: ChannelType::Telegram,
                        reason: error.to_string(),
                    }
                    .into());
                }
            }
        }

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

        if self.inner.config.mode == TelegramMode::Webhook {
            if let Err(error) = self.inner.bot.delete_webhook().await {
                tracing::warn!(%error, "failed to clear telegram webhook");
            }
        }

        for (_, handle) in self.inner.typing.lock().await.drain() {
            handle.abort();
        }
        self.inner.pending_approvals.write().await.clear();
        *self.inner.events.lock().expect("events lock") = None;
        self.inner.status.mark_disconnected();
        tracing::info!("telegram adapter shut down");
        Ok(())
    }

    async fn send(&self, user_id: &UserId, message: OutboundMessage) -> Result<()> {
        let target = self.inner.target_for(user_id).await?;
        self.inner.stop_typing(target.chat_id).await;
        self.inner.deliver(target, message).await
    }

    async fn handle_attachment(&self, attachment: Attachment) -> Result<Attachment> {
        let Some(file_id) = attachment.url.strip_prefix("tg://") else {
            return Ok(attachment);
        };
        let file = self
            .inner
            .bot
            .get_file(FileId(file_id.to_string()))
            .await
            .context("telegram getFile failed")?;
        let mut resolved = attachment;
        resolved.url = format!(
            "https://api.telegram.org/file/bot{}/{}",
            self.inner.config.bot_token, file.path
        );
        Ok(resolved)
    }

    fn format_outgoing(&self, mut message: OutboundMessage) -> OutboundMessage {
        if message.options.markdown {
            message.content = to_telegram_markdown(&message.content);
        }
        message
    }

    async fn stream_start(
        &self,
        user_id: &UserId,
        _conversation_id: Option<&str>,
    ) -> Result<StreamHandle> {
        let target = self.inner.target_for(user_id).await?;
        self.inner.start_typing(target).await;

        let mut request = self
            .inner
            .bot
            .send_message(ChatId(target.chat_id), PLACEHOLDER_TEXT);
        if let Some(thread) = target.thread_id {
            request = request.message_thread_id(ThreadId(MessageId(thread)));
        }
        let placeholder = request
            .await
            .context("failed to send telegram placeholder")?;

        Ok(StreamHandle::new(serde_json::json!({
            "chat_id": target.chat_id,
            "message_id": placeholder.id.0,
            "thread_id": target.thread_id,
        })))
    }

    async fn stream_update(&self, handle: &StreamHandle, content: &str) -> Result<()> {
        let (chat_id, message_id) = handle_target(handle)?;
        if content.is_empty() {
            return Ok(());
        }

        // Clamp so the edit itself can never exceed the platform limit.
        let shown = if content.len() > MAX_MESSAGE_LEN - STREAM_CURSOR.len() {
            let cut = content.floor_char_boundary(MAX_MESSAGE_LEN - STREAM_CURSOR.len());
            &content[..cut]
        } else {
            content
        };

        let result = self
            .inner
            .bot
            .edit_message_text(
                ChatId(chat_id),
                MessageId(message_id),
                format!("{shown}{STREAM_CURSOR}"),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // The throttled editor can race the platform into "not
            // modified"; that is fine.
            Err(RequestError::Api(ApiError::MessageNotModified)) => Ok(()),
            Err(error) => Err(anyhow::Error::from(error)
                .context("telegram stream edit failed")
                .into()),
        }
    }

    async fn stream_end(&self, handle: &StreamHandle, content: &str) -> Result<()> {
        let (chat_id, message_id) = handle_target(handle)?;
        let thread_id = handle
            .context_i64("thread_id")
            .and_then(|v| i32::try_from(v).ok());
        self.inner.stop_typing(chat_id).await;

        if content.is_empty() {
            // Nothing streamed; drop the placeholder quietly.
            let _ = self
                .inner
                .bot
                .delete_message(ChatId(chat_id), MessageId(message_id))
                .await;
            return Ok(());
        }

        if content.len() <= MAX_MESSAGE_LEN {
            return self
                .inner
                .edit_final(chat_id, message_id, content)
                .await;
        }

        // Over the single-message limit: replace the placeholder with a
        // chunked sequence.
        self.inner
            .bot
            .delete_message(ChatId(chat_id), MessageId(message_id))
            .await
            .context("failed to delete streaming placeholder")?;

        let target = ChatTarget { chat_id, thread_id };
        for chunk in chunk_text(content, MAX_MESSAGE_LEN) {
            self.inner
                .send_text(target, &chunk, true, None)
                .await?;
        }
        Ok(())
    }

    async fn send_tool_activity(
        &self,
        user_id: &UserId,
        _handle: Option<&StreamHandle>,
        activity: ToolActivity,
    ) -> Result<()> {
        let Some(line) = activity_line(&activity) else {
            return Ok(());
        };
        let target = self.inner.target_for(user_id).await?;
        self.inner.send_text(target, &line, false, None).await
    }
}

impl Inner {
    async fn poll_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut offset: i32 = 0;
        loop {
            let updates = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self
                    .bot
                    .get_updates()
                    .offset(offset)
                    .timeout(POLL_TIMEOUT_SECS)
                    .send() => result,
            };

            match updates {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.id.0 as i32 + 1);
                        self.process_update(update).await;
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "telegram poll failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        tracing::debug!("telegram poll loop ended");
    }

    async fn process_update(&self, update: Update) {
        match update.kind {
            UpdateKind::Message(message) => self.handle_message(message).await,
            UpdateKind::CallbackQuery(query) => self.handle_callback(query).await,
            _ => {}
        }
    }

    async fn handle_message(&self, message: teloxide::types::Message) {
        let Some(from) = message.from.clone() else {
            return;
        };
        if from.is_bot {
            return;
        }
        if let Some(me) = self.me.read().await.as_ref() {
            if from.id == me.user.id {
                return;
            }
        }
        let allowed = self.allowed_user_ids.load();
        if let Some(allowed) = allowed.as_ref() {
            if !allowed.contains(&from.id.0) {
                tracing::debug!(user = from.id.0, "telegram user not in allowlist, ignored");
                return;
            }
        }

        let chat_id = message.chat.id.0;
        let thread_id = message.thread_id.map(|thread| thread.0 .0);
        let target = ChatTarget { chat_id, thread_id };
        let user_id: UserId = telegram_user_uuid(from.id.0).into();

        let text = message
            .text()
            .or_else(|| message.caption())
            .unwrap_or_default()
            .to_string();

        // Commands are handled at the surface and never routed upstream.
        if let Some(command) = text.strip_prefix('/') {
            self.handle_command(target, command).await;
            return;
        }

        // While an approval keyboard is visible in this chat, bare
        // approve/deny keywords resolve it without a button press.
        if let Some(approved) = keyword_decision(&text) {
            if self.resolve_keyword_approval(target, &user_id, approved).await {
                return;
            }
        }

        self.chats.write().await.insert(user_id.clone(), target);
        self.register_identity(&user_id, &from).await;

        let (content, task_mode) = match text.strip_prefix("!goal ") {
            Some(goal) => (goal.to_string(), true),
            None => (text, false),
        };
        if content.is_empty() && message.photo().is_none() && message.document().is_none() {
            return;
        }

        let mut extra = HashMap::new();
        extra.insert("chat_id".to_string(), serde_json::json!(chat_id));
        if let Some(thread) = thread_id {
            extra.insert("thread_id".to_string(), serde_json::json!(thread));
        }
        if task_mode {
            extra.insert("task_mode".to_string(), serde_json::json!(true));
        }
        if let Some(name) = &from.username {
            extra.insert("username".to_string(), serde_json::json!(name));
        }

        let inbound = InboundMessage::new(
            ChannelType::Telegram,
            user_id,
            self.config.default_workspace_id.as_str(),
            content,
        )
        .with_conversation(conversation_seed(chat_id, thread_id))
        .with_attachments(extract_attachments(&message))
        .with_metadata(MessageMetadata {
            channel_user_id: from.id.0.to_string(),
            channel_message_id: Some(message.id.0.to_string()),
            timestamp: chrono::Utc::now(),
            extra,
        });

        self.emit(AdapterEvent::Message(inbound)).await;
    }

    async fn handle_command(&self, target: ChatTarget, command: &str) {
        let reply = match command.split_whitespace().next().unwrap_or_default() {
            "start" => "👋 Connected. Send a message to talk to your assistant, or `!goal ...` to start a task.",
            "help" => "Commands:\n/start - connect\n/help - this message\n\nPrefix a message with `!goal` to run it as an autonomous task.",
            _ => "Unknown command. Try /help.",
        };
        if let Err(error) = self.send_text(target, reply, true, None).await {
            tracing::warn!(%error, "failed to answer telegram command");
        }
    }

    async fn handle_callback(&self, query: teloxide::types::CallbackQuery) {
        // Acknowledge immediately so the button stops spinning.
        if let Err(error) = self.bot.answer_callback_query(query.id.clone()).await {
            tracing::debug!(%error, "failed to answer callback query");
        }

        let Some(data) = query.data.as_deref() else {
            return;
        };
        let Some((action, approval_id)) = data.split_once(':') else {
            return;
        };
        let approved = match action {
            "approve" => true,
            "reject" => false,
            _ => return,
        };

        let chat_id = query.message.as_ref().map(|m| m.chat().id.0);
        let actor: UserId = telegram_user_uuid(query.from.id.0).into();
        let target = ChatTarget {
            chat_id: chat_id.unwrap_or_default(),
            thread_id: None,
        };

        let Some(broker) = &self.approvals else {
            tracing::warn!("callback approval received but no broker wired");
            return;
        };

        match broker.resolve_pending(approval_id, approved, Some(&actor)).await {
            Ok(outcome) if outcome.success => {
                if let Some(chat_id) = chat_id {
                    self.forget_pending(chat_id, approval_id).await;
                }
                let note = if approved { "✅ Approved" } else { "❌ Rejected" };
                let _ = self.send_text(target, note, false, None).await;
            }
            Ok(_) => {
                let _ = self
                    .send_text(target, "This request was already processed.", false, None)
                    .await;
            }
            Err(error) => {
                tracing::warn!(%approval_id, %error, "telegram approval resolution failed");
                let _ = self
                    .send_text(target, "Could not process that approval.", false, None)
                    .await;
            }
        }
    }

    /// Resolve the newest pending approval for a chat from a bare keyword.
    /// Returns false when nothing was pending (the text routes as chat).
    async fn resolve_keyword_approval(
        &self,
        target: ChatTarget,
        actor: &UserId,
        approved: bool,
    ) -> bool {
        let Some(broker) = &self.approvals else {
            return false;
        };
        let approval_id = {
            let pending = self.pending_approvals.read().await;
            match pending.get(&target.chat_id).and_then(|ids| ids.last()) {
                Some(id) => id.clone(),
                None => return false,
            }
        };

        match broker.resolve_pending(&approval_id, approved, Some(actor)).await {
            Ok(outcome) if outcome.success => {
                self.forget_pending(target.chat_id, &approval_id).await;
                let note = if approved { "✅ Approved" } else { "❌ Rejected" };
                let _ = self.send_text(target, note, false, None).await;
            }
            Ok(_) => {
                let _ = self
                    .send_text(target, "This request was already processed.", false, None)
                    .await;
            }
            Err(error) => {
                tracing::warn!(%approval_id, %error, "keyword approval resolution failed");
            }
        }
        true
    }

    async fn forget_pending(&self, chat_id: i64, approval_id: &str) {
        let mut pending = self.pending_approvals.write().await;
        if let Some(ids) = pending.get_mut(&chat_id) {
            ids.retain(|id| id != approval_id);
            if ids.is_empty() {
                pending.remove(&chat_id);
            }
        }
    }

    async fn register_identity(&self, user_id: &UserId, from: &teloxide::types::User) {
        let Some(identities) = &self.identities else {
            return;
        };
        let identity = ChannelIdentity::new(
            user_id.clone(),
            ChannelType::Telegram,
            from.id.0.to_string(),
        )
        .with_display_name(from.full_name());
        if let Err(error) = identities.register_identity(identity).await {
            tracing::warn!(%error, "failed to register telegram identity");
        }
    }

    async fn target_for(&self, user_id: &UserId) -> Result<ChatTarget> {
        self.chats
            .read()
            .await
            .get(user_id)
            .copied()
            .ok_or_else(|| {
                AdapterError::UnknownUser {
                    channel: ChannelType::Telegram,
                    user_id: user_id.to_string(),
                }
                .into()
            })
    }

    /// Chunk, format, and deliver one outbound message. The last chunk
    /// carries the inline keyboard, and approval buttons are remembered for
    /// keyword resolution.
    async fn deliver(&self, target: ChatTarget, message: OutboundMessage) -> Result<()> {
        let keyboard = build_keyboard(&message);

        for button in &message.options.buttons {
            if button.action == "approve" {
                if let Some(approval_id) = &button.value {
                    self.pending_approvals
                        .write()
                        .await
                        .entry(target.chat_id)
                        .or_default()
                        .push(approval_id.clone());
                }
            }
        }

        let chunks = chunk_text(&message.content, MAX_MESSAGE_LEN);
        if chunks.is_empty() {
            return Ok(());
        }
        let last = chunks.len() - 1;
        for (index, chunk) in chunks.iter().enumerate() {
            let markup = if index == last { keyboard.clone() } else { None };
            self.send_text(target, chunk, message.options.markdown, markup)
                .await?;
        }
        Ok(())
    }

    /// Send one message, retrying without Markdown when the entity parse
    /// fails.
    async fn send_text(
        &self,
        target: ChatTarget,
        text: &str,
        markdown: bool,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<()> {
        let build = |parse: bool| {
            let mut request = self.bot.send_message(ChatId(target.chat_id), text);
            if parse {
                request = request.parse_mode(ParseMode::Markdown);
            }
            if let Some(thread) = target.thread_id {
                request = request.message_thread_id(ThreadId(MessageId(thread)));
            }
            if let Some(markup) = keyboard.clone() {
                request = request.reply_markup(markup);
            }
            request
        };

        match build(markdown).await {
            Ok(_) => Ok(()),
            Err(RequestError::Api(_)) if markdown => {
                tracing::debug!("telegram markdown rejected, retrying plain");
                build(false)
                    .await
                    .context("telegram plain-text retry failed")?;
                Ok(())
            }
            Err(error) => Err(anyhow::Error::from(error)
                .context("telegram sendMessage failed")
                .into()),
        }
    }

    async fn edit_final(&self, chat_id: i64, message_id: i32, content: &str) -> Result<()> {
        let formatted = to_telegram_markdown(content);
        let result = self
            .bot
            .edit_message_text(ChatId(chat_id), MessageId(message_id), formatted)
            .parse_mode(ParseMode::Markdown)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(RequestError::Api(ApiError::MessageNotModified)) => Ok(()),
            Err(RequestError::Api(_)) => {
                // Markdown parse failure: finalize as plain text.
                self.bot
                    .edit_message_text(ChatId(chat_id), MessageId(message_id), content)
                    .await
                    .context("telegram plain final edit failed")?;
                Ok(())
            }
            Err(error) => Err(anyhow::Error::from(error)
                .context("telegram final edit failed")
                .into()),
        }
    }

    async fn start_typing(&self, target: ChatTarget) {
        let mut typing = self.typing.lock().await;
        if typing.contains_key(&target.chat_id) {
            return;
        }
        let bot = self.bot.clone();
        let handle = tokio::spawn(async move {
            loop {
                let mut request = bot.send_chat_action(ChatId(target.chat_id), ChatAction::Typing);
                if let Some(thread) = target.thread_id {
                    request = request.message_thread_id(ThreadId(MessageId(thread)));
                }
                if request.await.is_err() {
                    break;
                }
                tokio::time::sleep(TYPING_REFRESH).await;
            }
        });
        typing.insert(target.chat_id, handle);
    }

    async fn stop_typing(&self, chat_id: i64) {
        if let Some(handle) = self.typing.lock().await.remove(&chat_id) {
            handle.abort();
        }
    }

    async fn emit(&self, event: AdapterEvent) {
        let sender = self.events.lock().expect("events lock").clone();
        if let Some(sender) = sender {
            if sender.send(event).await.is_err() {
                tracing::warn!("telegram event receiver dropped");
            }
        }
    }
}

fn handle_target(handle: &StreamHandle) -> Result<(i64, i32)> {
    let chat_id = handle
        .context_i64("chat_id")
        .ok_or_else(|| AdapterError::InvalidInput("stream handle missing chat_id".into()))?;
    let message_id = handle
        .context_i64("message_id")
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| AdapterError::InvalidInput("stream handle missing message_id".into()))?;
    Ok((chat_id, message_id))
}

/// Deterministic user id: SHA-256 of `telegram-user:<uid>` folded into a
/// v4-shaped UUID, stable across restarts.
pub fn telegram_user_uuid(telegram_uid: u64) -> String {
    crate::identity::derived_uuid(&format!("telegram-user:{telegram_uid}"))
}

/// Deterministic conversation key for a chat (and forum topic).
pub fn conversation_seed(chat_id: i64, thread_id: Option<i32>) -> String {
    match thread_id {
        Some(thread) => format!("telegram-conv:{chat_id}:t{thread}"),
        None => format!("telegram-conv:{chat_id}"),
    }
}

fn keyword_decision(text: &str) -> Option<bool> {
    let normalized = text.trim().to_lowercase();
    if APPROVE_KEYWORDS.contains(&normalized.as_str()) {
        Some(true)
    } else if DENY_KEYWORDS.contains(&normalized.as_str()) {
        Some(false)
    } else {
        None
    }
}

fn build_keyboard(message: &OutboundMessage) -> Option<InlineKeyboardMarkup> {
    if message.options.buttons.is_empty() {
        return None;
    }
    let row: Vec<InlineKeyboardButton> = message
        .options
        .buttons
        .iter()
        .map(|button| {
            InlineKeyboardButton::callback(button.label.clone(), button.callback_token())
        })
        .collect();
    Some(InlineKeyboardMarkup::new(vec![row]))
}

fn extract_attachments(message: &teloxide::types::Message) -> Vec<Attachment> {
    let mut attachments = Vec::new();

    if let Some(photos) = message.photo() {
        // Telegram sends every thumbnail size; the last entry is largest.
        if let Some(photo) = photos.last() {
            attachments.push(Attachment {
                kind: AttachmentKind::Image,
                url: format!("tg://{}", photo.file.id.0),
                mime_type: Some("image/jpeg".to_string()),
                size: Some(photo.file.size as u64),
                filename: None,
            });
        }
    }
    if let Some(document) = message.document() {
        let mime = document.mime_type.as_ref().map(|m| m.to_string());
        attachments.push(Attachment {
            kind: mime
                .as_deref()
                .map(AttachmentKind::from_mime)
                .unwrap_or(AttachmentKind::File),
            url: format!("tg://{}", document.file.id.0),
            mime_type: mime,
            size: Some(document.file.size as u64),
            filename: document.file_name.clone(),
        });
    }
    if let Some(voice) = message.voice() {
        attachments.push(Attachment {
            kind: AttachmentKind::Audio,
            url: format!("tg://{}", voice.file.id.0),
            mime_type: Some("audio/ogg".to_string()),
            size: Some(voice.file.size as u64),
            filename: None,
        });
    }
    if let Some(video) = message.video() {
        attachments.push(Attachment {
            kind: AttachmentKind::Video,
            url: format!("tg://{}", video.file.id.0),
            mime_type: Some("video/mp4".to_string()),
            size: Some(video.file.size as u64),
            filename: None,
        });
    }

    attachments
}

/// Translate common-dialect Markdown to Telegram's legacy dialect:
/// `**bold**` becomes `*bold*`, headers become emphasized lines.
fn to_telegram_markdown(text: &str) -> String {
    let mut lines = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim_start();
        let heading = trimmed
            .strip_prefix("###")
            .or_else(|| trimmed.strip_prefix("##"))
            .or_else(|| trimmed.strip_prefix('#'));
        match heading {
            Some(rest) if rest.starts_with(' ') || rest.is_empty() => {
                lines.push(format!("*{}*", rest.trim()));
            }
            _ => lines.push(line.to_string()),
        }
    }
    lines.join("\n").replace("**", "*")
}

fn activity_line(activity: &ToolActivity) -> Option<String> {
    use crate::AgentStatus;
    match activity.status {
        AgentStatus::ToolStart => Some(format!(
            "🔧 {}",
            activity.tool_name.as_deref().unwrap_or("working")
        )),
        AgentStatus::ToolEnd => None,
        AgentStatus::Thinking => activity
            .thinking
            .as_deref()
            .map(|thought| format!("💭 {thought}")),
        AgentStatus::WaitingApproval => Some("⏳ Waiting for your approval".to_string()),
        AgentStatus::WaitingForHuman => Some("🙋 Your input is needed".to_string()),
        AgentStatus::RoutingInfo => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_uuid_is_deterministic_and_v4_shaped() {
        let a = telegram_user_uuid(7);
        let b = telegram_user_uuid(7);
        assert_eq!(a, b);
        assert_ne!(a, telegram_user_uuid(8));

        let parsed = uuid::Uuid::parse_str(&a).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn conversation_seed_includes_forum_topic() {
        assert_eq!(conversation_seed(100, None), "telegram-conv:100");
        assert_eq!(conversation_seed(100, Some(7)), "telegram-conv:100:t7");
    }

    #[test]
    fn keyword_decisions_match_case_insensitively() {
        assert_eq!(keyword_decision("Approve"), Some(true));
        assert_eq!(keyword_decision("  go ahead "), Some(true));
        assert_eq!(keyword_decision("DENY"), Some(false));
        assert_eq!(keyword_decision("maybe later"), None);
    }

    #[test]
    fn markdown_translation_handles_bold_and_headers() {
        let input = "## Status\nAll **good** here.";
        assert_eq!(to_telegram_markdown(input), "*Status*\nAll *good* here.");
    }

    #[test]
    fn keyboard_maps_buttons_to_callback_tokens() {
        let message = OutboundMessage::text("Approve?").with_buttons(vec![
            crate::Button::new("Yes", "approve").with_value("abc"),
            crate::Button::new("No", "reject").with_value("abc"),
        ]);
        let keyboard = build_keyboard(&message).unwrap();
        let row = &keyboard.inline_keyboard[0];
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn activity_lines_skip_noise() {
        let line = activity_line(&ToolActivity {
            status: crate::AgentStatus::ToolStart,
            tool_name: Some("search".into()),
            tool_args: None,
            tool_result: None,
            thinking: None,
        });
        assert_eq!(line.as_deref(), Some("🔧 search"));

        let none = activity_line(&ToolActivity {
            status: crate::AgentStatus::RoutingInfo,
            tool_name: None,
            tool_args: None,
            tool_result: None,
            thinking: None,
        });
        assert!(none.is_none());
    }
}
