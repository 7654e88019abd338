//! Discord channel adapter using serenity.
//!
//! Slash commands are registered at connect (guild-scoped when a guild id is
//! configured, application-global otherwise). Task mode creates a public
//! thread for progress. Long replies are emitted as embeds (2000 chars plain,
//! 4000 per embed) with interactive components attached to the last one.
//! Approvals arrive as button components with `approve:<id>` /
//! `reject:<id>` custom ids.

use crate::approvals::ApprovalBroker;
use crate::channels::adapter::{
    Adapter, AdapterEvent, AdapterStatus, EventStream, StatusCell, StreamHandle,
};
use crate::config::DiscordConfig;
use crate::error::AdapterError;
use crate::identity::{ChannelIdentity, IdentityStore};
use crate::text::chunk_text;
use crate::{
    Attachment, AttachmentKind, ChannelType, InboundMessage, MessageMetadata, OutboundMessage,
    Result, ToolActivity, UserId,
};
use anyhow::Context as _;
use async_trait::async_trait;
use serenity::all::{
    ButtonStyle, ChannelId, ChannelType as DiscordChannelType, Command, CommandOptionType,
    Context, CreateActionRow, CreateButton, CreateCommand, CreateCommandOption, CreateEmbed,
    CreateInteractionResponse, CreateInteractionResponseMessage, CreateMessage, CreateThread,
    EditMessage, EventHandler, GatewayIntents, GuildId, Http, Interaction, Message, MessageId,
    Ready, ResolvedValue, ShardManager, User,
};
use serenity::all::UserId as DiscordUserId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::task::TaskTracker;

/// Discord caps plain message content at 2000 chars.
const MAX_PLAIN_LEN: usize = 2000;

/// Embed descriptions allow more room; stay at 4000.
const MAX_EMBED_LEN: usize = 4000;

/// Wait this long for the gateway READY before declaring connect failed.
const READY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub struct DiscordChannel {
    inner: Arc<Inner>,
}

struct Inner {
    config: DiscordConfig,
    /// Snapshot-swapped so the role allowlist can be updated without a
    /// restart.
    allowed_role_ids: arc_swap::ArcSwap<Option<Vec<u64>>>,
    status: StatusCell,
    events: StdMutex<Option<tokio::sync::mpsc::Sender<AdapterEvent>>>,
    http: RwLock<Option<Arc<Http>>>,
    bot_user_id: RwLock<Option<DiscordUserId>>,
    /// Last known channel per logical user.
    chats: RwLock<HashMap<UserId, u64>>,
    /// Typing handles per channel. Typing stops when the handle is dropped.
    typing: RwLock<HashMap<u64, serenity::http::Typing>>,
    shard_manager: RwLock<Option<Arc<ShardManager>>>,
    ready_tx: Mutex<Option<oneshot::Sender<()>>>,
    tasks: Mutex<Option<TaskTracker>>,
    identities: Option<Arc<IdentityStore>>,
    approvals: Option<Arc<ApprovalBroker>>,
}

impl DiscordChannel {
    pub fn new(config: DiscordConfig) -> Self {
        let allowed_role_ids = arc_swap::ArcSwap::from_pointee(config.allowed_role_ids.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                allowed_role_ids,
                status: StatusCell::new(ChannelType::Discord),
                events: StdMutex::new(None),
                http: RwLock::new(None),
                bot_user_id: RwLock::new(None),
                chats: RwLock::new(HashMap::new()),
                typing: RwLock::new(HashMap::new()),
                shard_manager: RwLock::new(None),
                ready_tx: Mutex::new(None),
                tasks: Mutex::new(None),
                identities: None,
                approvals: None,
            }),
        }
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

    /// Swap in a new role allowlist; the next message sees it.
    pub fn set_allowed_role_ids(&self, allowed: Option<Vec<u64>>) {
        self.inner.allowed_role_ids.store(Arc::new(allowed));
    }
}

impl Adapter for DiscordChannel {
    fn channel(&self) -> ChannelType {
        ChannelType::Discord
    }

    fn status(&self) -> AdapterStatus {
        self.inner.status.status()
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<EventStream> {
        if !self.inner.status.begin_connect()? {
            tracing::debug!("discord already connected, connect is a no-op");
            return Ok(Box::pin(futures::stream::pending()));
        }

        let (events_tx, events_rx) = tokio::sync::mpsc::channel(256);
        self.inner.status.attach(events_tx.clone());
        *self.inner.events.lock().expect("events lock") = Some(events_tx);

        let (ready_tx, ready_rx) = oneshot::channel();
        *self.inner.ready_tx.lock().await = Some(ready_tx);

        let handler = Handler {
            inner: self.inner.clone(),
        };

        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
            | GatewayIntents::GUILD_MESSAGE_REACTIONS;

        let mut client = match serenity::Client::builder(&self.inner.config.bot_token, intents)
            .event_handler(handler)
            .await
        {
            Ok(client) => client,
            Err(error) => {
                self.inner.status.mark_disconnected();
                return Err(AdapterError::ConnectFailed {
                    channel: ChannelType::Discord,
                    reason: error.to_string(),
                }
                .into());
            }
        };

        *self.inner.http.write().await = Some(client.http.clone());
        *self.inner.shard_manager.write().await = Some(client.shard_manager.clone());

        let tasks = TaskTracker::new();
        tasks.spawn(async move {
            if let Err(error) = client.start().await {
                tracing::error!(%error, "discord gateway error");
            }
        });
        *self.inner.tasks.lock().await = Some(tasks);

        // connect() completes when the gateway is READY or fails.
        match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
            Ok(Ok(())) => {}
            _ => {
                self.shutdown_shards().await;
                self.inner.status.mark_disconnected();
                return Err(AdapterError::ConnectFailed {
                    channel: ChannelType::Discord,
                    reason: "gateway ready timeout".into(),
                }
                .into());
            }
        }

        self.inner.status.mark_connected();
        let stream = tokio_stream::wrappers::ReceiverStream::new(events_rx);
        Ok(Box::pin(stream))
    }

    async fn disconnect(&self) -> Result<()> {
        self.shutdown_shards().await;
        if let Some(tasks) = self.inner.tasks.lock().await.take() {
            tasks.close();
            tasks.wait().await;
        }
        self.inner.typing.write().await.clear();
        *self.inner.events.lock().expect("events lock") = None;
        self.inner.status.mark_disconnected();
        tracing::info!("discord adapter shut down");
        Ok(())
    }

    async fn send(&self, user_id: &UserId, message: OutboundMessage) -> Result<()> {
        let channel_id = self.inner.channel_for(user_id).await?;
        self.inner.stop_typing(channel_id).await;
        self.inner
            .deliver(ChannelId::new(channel_id), message)
            .await
    }

    fn format_outgoing(&self, message: OutboundMessage) -> OutboundMessage {
        // Discord renders the common Markdown dialect natively.
        message
    }

    async fn stream_start(
        &self,
        user_id: &UserId,
        _conversation_id: Option<&str>,
    ) -> Result<StreamHandle> {
        let channel_id = self.inner.channel_for(user_id).await?;
        let http = self.inner.http().await?;

        self.inner.start_typing(channel_id).await;

        let placeholder = ChannelId::new(channel_id)
            .say(&*http, "💭 Thinking…")
            .await
            .context("failed to send discord placeholder")?;

        Ok(StreamHandle::new(serde_json::json!({
            "channel_id": channel_id,
            "message_id": placeholder.id.get(),
        })))
    }

    async fn stream_update(&self, handle: &StreamHandle, content: &str) -> Result<()> {
        let (channel_id, message_id) = handle_target(handle)?;
        if content.is_empty() {
            return Ok(());
        }
        let http = self.inner.http().await?;

        let shown = if content.len() > MAX_PLAIN_LEN {
            let cut = content.floor_char_boundary(MAX_PLAIN_LEN - 1);
            format!("{}…", &content[..cut])
        } else {
            content.to_string()
        };

        let builder = EditMessage::new().content(shown);
        if let Err(error) = ChannelId::new(channel_id)
            .edit_message(&*http, MessageId::new(message_id), builder)
            .await
        {
            tracing::warn!(%error, "failed to edit discord streaming message");
        }
        Ok(())
    }

    async fn stream_end(&self, handle: &StreamHandle, content: &str) -> Result<()> {
        let (channel_id, message_id) = handle_target(handle)?;
        let http = self.inner.http().await?;
        self.inner.stop_typing(channel_id).await;
        let channel = ChannelId::new(channel_id);

        if content.is_empty() {
            let _ = channel.delete_message(&*http, MessageId::new(message_id)).await;
            return Ok(());
        }

        if content.len() <= MAX_PLAIN_LEN {
            channel
                .edit_message(
                    &*http,
                    MessageId::new(message_id),
                    EditMessage::new().content(content),
                )
                .await
                .context("failed to finalize discord message")?;
            return Ok(());
        }

        // Long content: replace the placeholder with embeds.
        channel
            .delete_message(&*http, MessageId::new(message_id))
            .await
            .context("failed to delete discord placeholder")?;
        self.inner
            .deliver(channel, OutboundMessage::text(content))
            .await
    }

    async fn send_tool_activity(
        &self,
        user_id: &UserId,
        _handle: Option<&StreamHandle>,
        activity: ToolActivity,
    ) -> Result<()> {
        // Typing is Discord's native "working" signal; only surface the
        // states typing cannot express.
        let note = match activity.status {
            crate::AgentStatus::WaitingApproval => "⏳ Waiting for your approval",
            crate::AgentStatus::WaitingForHuman => "🙋 Your input is needed",
            _ => return Ok(()),
        };
        let channel_id = self.inner.channel_for(user_id).await?;
        let http = self.inner.http().await?;
        ChannelId::new(channel_id)
            .say(&*http, note)
            .await
            .context("failed to send discord activity note")?;
        Ok(())
    }
}

impl DiscordChannel {
    async fn shutdown_shards(&self) {
        if let Some(shard_manager) = self.inner.shard_manager.read().await.as_ref() {
            shard_manager.shutdown_all().await;
        }
    }
}

impl Inner {
    async fn http(&self) -> Result<Arc<Http>> {
        self.http
            .read()
            .await
            .clone()
            .ok_or_else(|| {
                AdapterError::NotConnected {
                    channel: ChannelType::Discord,
                }
                .into()
            })
    }

    async fn channel_for(&self, user_id: &UserId) -> Result<u64> {
        self.chats.read().await.get(user_id).copied().ok_or_else(|| {
            AdapterError::UnknownUser {
                channel: ChannelType::Discord,
                user_id: user_id.to_string(),
            }
            .into()
        })
    }

    /// Deliver one message: short content goes plain-chunked, long content
    /// becomes embeds. Buttons ride on the final send.
    async fn deliver(&self, channel: ChannelId, message: OutboundMessage) -> Result<()> {
        let http = self.http().await?;
        let components = build_components(&message);

        if message.content.len() <= MAX_PLAIN_LEN && components.is_empty() {
            channel
                .say(&*http, &message.content)
                .await
                .context("failed to send discord message")?;
            return Ok(());
        }

        if message.content.len() <= MAX_PLAIN_LEN {
            let builder = CreateMessage::new()
                .content(&message.content)
                .components(components);
            channel
                .send_message(&*http, builder)
                .await
                .context("failed to send discord message")?;
            return Ok(());
        }

        // Long content as embeds, up to 10 per message.
        let chunks = chunk_text(&message.content, MAX_EMBED_LEN);
        let groups: Vec<&[String]> = chunks.chunks(10).collect();
        let last_group = groups.len().saturating_sub(1);
        for (index, group) in groups.iter().enumerate() {
            let embeds: Vec<CreateEmbed> = group
                .iter()
                .map(|chunk| CreateEmbed::new().description(chunk))
                .collect();
            let mut builder = CreateMessage::new().embeds(embeds);
            if index == last_group && !components.is_empty() {
                builder = builder.components(components.clone());
            }
            channel
                .send_message(&*http, builder)
                .await
                .context("failed to send discord embeds")?;
        }
        Ok(())
    }

    async fn start_typing(&self, channel_id: u64) {
        let Ok(http) = self.http().await else {
            return;
        };
        let mut typing = self.typing.write().await;
        typing
            .entry(channel_id)
            .or_insert_with(|| ChannelId::new(channel_id).start_typing(&http));
    }

    async fn stop_typing(&self, channel_id: u64) {
        self.typing.write().await.remove(&channel_id);
    }

    async fn emit(&self, event: AdapterEvent) {
        let sender = self.events.lock().expect("events lock").clone();
        if let Some(sender) = sender {
            if sender.send(event).await.is_err() {
                tracing::warn!("discord event receiver dropped");
            }
        }
    }

    /// Role allowlist check. DMs carry no roles, so an allowlist denies them.
    fn author_allowed(&self, message: &Message) -> bool {
        let allowed = self.allowed_role_ids.load();
        let Some(allowed) = allowed.as_ref() else {
            return true;
        };
        let Some(member) = &message.member else {
            return false;
        };
        member
            .roles
            .iter()
            .any(|role| allowed.contains(&role.get()))
    }

    async fn register_identity(&self, user_id: &UserId, author: &User) {
        let Some(identities) = &self.identities else {
            return;
        };
        let display = author
            .global_name
            .clone()
            .unwrap_or_else(|| author.name.clone());
        let identity = ChannelIdentity::new(
            user_id.clone(),
            ChannelType::Discord,
            author.id.get().to_string(),
        )
        .with_display_name(display);
        if let Err(error) = identities.register_identity(identity).await {
            tracing::warn!(%error, "failed to register discord identity");
        }
    }

    async fn emit_inbound(
        &self,
        author: &User,
        channel_id: u64,
        guild_id: Option<u64>,
        message_id: Option<u64>,
        content: String,
        attachments: Vec<Attachment>,
        task_mode: bool,
    ) {
        let user_id: UserId = discord_user_uuid(author.id.get()).into();
        self.chats.write().await.insert(user_id.clone(), channel_id);
        self.register_identity(&user_id, author).await;

        let mut extra = HashMap::new();
        extra.insert("channel_id".to_string(), serde_json::json!(channel_id));
        if let Some(guild) = guild_id {
            extra.insert("guild_id".to_string(), serde_json::json!(guild));
        }
        if task_mode {
            extra.insert("task_mode".to_string(), serde_json::json!(true));
        }

        let conversation = match guild_id {
            Some(guild) => format!("discord-conv:{guild}:{channel_id}"),
            None => format!("discord-conv:dm:{}", author.id.get()),
        };

        let inbound = InboundMessage::new(
            ChannelType::Discord,
            user_id,
            self.config.default_workspace_id.as_str(),
            content,
        )
        .with_conversation(conversation)
        .with_attachments(attachments)
        .with_metadata(MessageMetadata {
            channel_user_id: author.id.get().to_string(),
            channel_message_id: message_id.map(|id| id.to_string()),
            timestamp: chrono::Utc::now(),
            extra,
        });

        self.emit(AdapterEvent::Message(inbound)).await;
    }
}

// -- Serenity EventHandler --

struct Handler {
    inner: Arc<Inner>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!(bot_name = %ready.user.name, "discord connected");
        *self.inner.http.write().await = Some(ctx.http.clone());
        *self.inner.bot_user_id.write().await = Some(ready.user.id);

        let commands = vec![
            CreateCommand::new("task")
                .description("Run a goal as an autonomous task")
                .add_option(
                    CreateCommandOption::new(
                        CommandOptionType::String,
                        "goal",
                        "What the task should accomplish",
                    )
                    .required(true),
                ),
            CreateCommand::new("help").description("How to talk to the assistant"),
        ];

        let registration = match self.inner.config.guild_id {
            Some(guild) => {
                GuildId::new(guild)
                    .set_commands(&ctx.http, commands)
                    .await
            }
            None => Command::set_global_commands(&ctx.http, commands).await,
        };
        if let Err(error) = registration {
            tracing::warn!(%error, "failed to register discord slash commands");
        }

        if let Some(ready_tx) = self.inner.ready_tx.lock().await.take() {
            let _ = ready_tx.send(());
        }
    }

    async fn message(&self, _ctx: Context, message: Message) {
        // Never respond to ourselves or other bots.
        let bot_user_id = self.inner.bot_user_id.read().await;
        if bot_user_id.is_some_and(|id| message.author.id == id) {
            return;
        }
        drop(bot_user_id);
        if message.author.bot {
            return;
        }
        if !self.inner.author_allowed(&message) {
            tracing::debug!(
                user = message.author.id.get(),
                "discord author lacks an allowed role, ignored"
            );
            return;
        }

        let content = resolve_mentions(&message.content, &message.mentions);
        let (content, task_mode) = match content.strip_prefix("!goal ") {
            Some(goal) => (goal.to_string(), true),
            None => (content, false),
        };

        let attachments: Vec<Attachment> = message
            .attachments
            .iter()
            .map(|attachment| {
                let mime = attachment.content_type.clone();
                Attachment {
                    kind: mime
                        .as_deref()
                        .map(AttachmentKind::from_mime)
                        .unwrap_or(AttachmentKind::File),
                    url: attachment.url.clone(),
                    mime_type: mime,
                    size: Some(attachment.size as u64),
                    filename: Some(attachment.filename.clone()),
                }
            })
            .collect();

        if content.is_empty() && attachments.is_empty() {
            return;
        }

        self.inner
            .emit_inbound(
                &message.author,
                message.channel_id.get(),
                message.guild_id.map(|id| id.get()),
                Some(message.id.get()),
                content,
                attachments,
                task_mode,
            )
            .await;
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        match interaction {
            Interaction::Component(component) => {
                let Some((action, approval_id)) =
                    component.data.custom_id.split_once(':')
                else {
                    return;
                };
                let approved = match action {
                    "approve" => true,
                    "reject" => false,
                    _ => return,
                };

                let actor: UserId = discord_user_uuid(component.user.id.get()).into();
                let Some(broker) = &self.inner.approvals else {
                    tracing::warn!("discord approval received but no broker wired");
                    return;
                };

                let response = match broker
                    .resolve_pending(approval_id, approved, Some(&actor))
                    .await
                {
                    Ok(outcome) if outcome.success => {
                        let text = if approved { "✅ Approved" } else { "❌ Rejected" };
                        CreateInteractionResponseMessage::new()
                            .embed(CreateEmbed::new().description(text))
                    }
                    Ok(_) => CreateInteractionResponseMessage::new()
                        .content("This request was already processed.")
                        .ephemeral(true),
                    Err(error) => {
                        tracing::warn!(%approval_id, %error, "discord approval resolution failed");
                        CreateInteractionResponseMessage::new()
                            .content("Could not process that approval.")
                            .ephemeral(true)
                    }
                };

                if let Err(error) = component
                    .create_response(&ctx.http, CreateInteractionResponse::Message(response))
                    .await
                {
                    tracing::warn!(%error, "failed to respond to discord interaction");
                }
            }
            Interaction::Command(command) => match command.data.name.as_str() {
                "task" => {
                    let goal = command
                        .data
                        .options()
                        .into_iter()
                        .find_map(|option| match option.value {
                            ResolvedValue::String(value) => Some(value.to_string()),
                            _ => None,
                        })
                        .unwrap_or_default();

                    let ack = CreateInteractionResponseMessage::new()
                        .content(format!("🚀 Task started: {goal}"));
                    if let Err(error) = command
                        .create_response(&ctx.http, CreateInteractionResponse::Message(ack))
                        .await
                    {
                        tracing::warn!(%error, "failed to acknowledge task command");
                    }

                    // A thread keeps task progress out of the main channel.
                    let mut thread_name: String = goal.chars().take(90).collect();
                    if thread_name.is_empty() {
                        thread_name = "task".to_string();
                    }
                    let thread = command
                        .channel_id
                        .create_thread(
                            &ctx.http,
                            CreateThread::new(thread_name)
                                .kind(DiscordChannelType::PublicThread),
                        )
                        .await;

                    let target_channel = match thread {
                        Ok(thread) => thread.id.get(),
                        Err(error) => {
                            tracing::warn!(%error, "thread creation failed, using channel");
                            command.channel_id.get()
                        }
                    };

                    self.inner
                        .emit_inbound(
                            &command.user,
                            target_channel,
                            command.guild_id.map(|id| id.get()),
                            None,
                            goal,
                            Vec::new(),
                            true,
                        )
                        .await;
                }
                "help" => {
                    let help = CreateInteractionResponseMessage::new()
                        .content(
                            "Mention or message me to chat. Use `/task` or prefix a message \
                             with `!goal` to run an autonomous task.",
                        )
                        .ephemeral(true);
                    if let Err(error) = command
                        .create_response(&ctx.http, CreateInteractionResponse::Message(help))
                        .await
                    {
                        tracing::warn!(%error, "failed to answer help command");
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }
}

// -- Helper functions --

fn handle_target(handle: &StreamHandle) -> Result<(u64, u64)> {
    let channel_id = handle
        .context_i64("channel_id")
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| AdapterError::InvalidInput("stream handle missing channel_id".into()))?;
    let message_id = handle
        .context_i64("message_id")
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| AdapterError::InvalidInput("stream handle missing message_id".into()))?;
    Ok((channel_id, message_id))
}

/// Deterministic logical-user id for a Discord snowflake.
pub fn discord_user_uuid(snowflake: u64) -> String {
    crate::identity::derived_uuid(&format!("discord-user:{snowflake}"))
}

/// Replace raw Discord mention syntax (`<@ID>` and `<@!ID>`) with readable
/// display names.
fn resolve_mentions(content: &str, mentions: &[User]) -> String {
    let mut resolved = content.to_string();
    for user in mentions {
        let display_name = user.global_name.as_deref().unwrap_or(&user.name);
        resolved = replace_mention(&resolved, user.id.get(), display_name);
    }
    resolved
}

fn replace_mention(content: &str, snowflake: u64, display_name: &str) -> String {
    content
        .replace(&format!("<@{snowflake}>"), &format!("@{display_name}"))
        .replace(&format!("<@!{snowflake}>"), &format!("@{display_name}"))
}

fn build_components(message: &OutboundMessage) -> Vec<CreateActionRow> {
    if message.options.buttons.is_empty() {
        return Vec::new();
    }
    let buttons: Vec<CreateButton> = message
        .options
        .buttons
        .iter()
        .take(5) // Discord limit: max 5 buttons per action row
        .map(|button| {
            let token = button.callback_token();
            let custom_id = &token[..token.floor_char_boundary(100)];
            let style = match button.action.as_str() {
                "approve" => ButtonStyle::Success,
                "reject" => ButtonStyle::Danger,
                _ => ButtonStyle::Primary,
            };
            CreateButton::new(custom_id)
                .label(&button.label)
                .style(style)
        })
        .collect();
    vec![CreateActionRow::Buttons(buttons)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_uuid_is_deterministic() {
        assert_eq!(discord_user_uuid(555), discord_user_uuid(555));
        assert_ne!(discord_user_uuid(555), discord_user_uuid(556));
        let parsed = uuid::Uuid::parse_str(&discord_user_uuid(555)).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn mentions_resolve_to_display_names() {
        let resolved = replace_mention("hey <@42>, look at <@!42>", 42, "alice");
        assert_eq!(resolved, "hey @alice, look at @alice");
    }

    #[test]
    fn components_cap_at_five_buttons() {
        let buttons = (0..8)
            .map(|i| crate::Button::new(format!("Btn {i}"), "action").with_value(i.to_string()))
            .collect();
        let message = OutboundMessage::text("pick").with_buttons(buttons);
        let rows = build_components(&message);
        assert_eq!(rows.len(), 1);
        match &rows[0] {
            CreateActionRow::Buttons(buttons) => assert_eq!(buttons.len(), 5),
            _ => panic!("expected buttons row"),
        }
    }
}
