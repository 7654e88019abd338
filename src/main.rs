//! Switchboard gateway entry point.

use anyhow::Context as _;
use clap::Parser;
use std::collections::BTreeMap;
use std::sync::Arc;
use switchboard::approvals::ApprovalBroker;
use switchboard::brain::HttpBrainClient;
use switchboard::channels::adapter::AdapterDyn;
use switchboard::channels::discord::DiscordChannel;
use switchboard::channels::telegram::TelegramChannel;
use switchboard::channels::web::{JwtVerifier, WebChannel};
use switchboard::channels::whatsapp::WhatsAppChannel;
use switchboard::channels::ChannelRegistry;
use switchboard::config::{Config, TelegramMode};
use switchboard::identity::{Deduplicator, IdentityStore};
use switchboard::router::MessageRouter;
use switchboard::store::{MemoryStore, SessionStore};

#[derive(Parser)]
#[command(name = "switchboard", version)]
#[command(about = "Omnichannel messaging gateway bridging chat surfaces to a streaming brain")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "switchboard=debug,info"
    } else {
        "switchboard=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let config = Config::load()?;

    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    let identities = Arc::new(IdentityStore::new(store.clone()));
    let deduplicator = Arc::new(Deduplicator::new(store.clone()));

    let brain = Arc::new(
        HttpBrainClient::new(config.brain.base_url.clone())
            .context("failed to build brain client")?,
    );
    let approvals = Arc::new(ApprovalBroker::new(brain.clone()));

    let registry = Arc::new(
        ChannelRegistry::new(brain.clone())
            .with_deduplicator(deduplicator.clone())
            .with_approvals(approvals.clone()),
    );
    let router = Arc::new(MessageRouter::new(registry.clone(), store.clone()));

    // Approval prompts route through the user's preferred surface; the
    // handler is registered before any adapter connects.
    {
        let router = router.clone();
        let registry = registry.clone();
        approvals
            .set_delivery(Arc::new(move |user_id, message, origin| {
                let router = router.clone();
                let registry = registry.clone();
                Box::pin(async move {
                    match origin {
                        Some(origin) => router.route(&user_id, message, origin).await,
                        None => {
                            registry.broadcast_to_user(&user_id, message, None).await;
                            Ok(())
                        }
                    }
                })
            }))
            .await;
    }

    // Adapters for webhook-driven surfaces are kept for the HTTP layer.
    let mut telegram_webhook: Option<Arc<TelegramChannel>> = None;
    let mut whatsapp_webhook: Option<Arc<WhatsAppChannel>> = None;

    if let Some(telegram_config) = config.telegram.clone() {
        let webhook_mode = telegram_config.mode == TelegramMode::Webhook;
        let adapter = Arc::new(
            TelegramChannel::new(telegram_config)
                .with_identities(identities.clone())
                .with_approvals(approvals.clone()),
        );
        if webhook_mode {
            telegram_webhook = Some(adapter.clone());
        }
        register(&registry, adapter).await;
    }

    if let Some(discord_config) = config.discord.clone() {
        let adapter = Arc::new(
            DiscordChannel::new(discord_config)
                .with_identities(identities.clone())
                .with_approvals(approvals.clone()),
        );
        register(&registry, adapter).await;
    }

    if let Some(whatsapp_config) = config.whatsapp.clone() {
        let adapter = Arc::new(
            WhatsAppChannel::new(whatsapp_config)
                .context("failed to build whatsapp adapter")?
                .with_identities(identities.clone()),
        );
        whatsapp_webhook = Some(adapter.clone());
        register(&registry, adapter).await;
    }

    if let Some(web_config) = config.web.clone() {
        let verifier = Arc::new(JwtVerifier::new(web_config.jwt_secret.clone()));
        let adapter = Arc::new(
            WebChannel::new(web_config, brain.clone(), verifier)
                .with_deduplicator(deduplicator.clone())
                .with_identities(identities.clone()),
        );
        register(&registry, adapter).await;
    }

    let webhook_server = serve_platform_webhooks(telegram_webhook, whatsapp_webhook).await?;

    // Subscriber endpoints get signed lifecycle notifications.
    let webhook_fanout = match &config.webhook {
        Some(webhook_config) => Some((
            switchboard::webhook::WebhookSender::new(
                webhook_config.secret.clone(),
                webhook_config.header_prefix.clone(),
            )
            .context("failed to build webhook sender")?,
            webhook_config.endpoints.clone(),
        )),
        None => None,
    };
    if let Some((sender, endpoints)) = &webhook_fanout {
        notify_endpoints(sender, endpoints, "gateway.started").await;
    }

    tracing::info!("switchboard running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutting down");
    if let Some(handle) = webhook_server {
        handle.abort();
    }
    registry.shutdown().await;
    if let Some((sender, endpoints)) = &webhook_fanout {
        notify_endpoints(sender, endpoints, "gateway.stopped").await;
    }
    Ok(())
}

async fn notify_endpoints(
    sender: &switchboard::webhook::WebhookSender,
    endpoints: &[String],
    event_type: &str,
) {
    let event = switchboard::webhook::WebhookEvent::new(
        event_type,
        serde_json::json!({ "service": "switchboard" }),
    );
    for endpoint in endpoints {
        if let Err(error) = sender.deliver(endpoint, &event).await {
            tracing::warn!(endpoint, %error, "lifecycle webhook failed");
        }
    }
}

async fn register(registry: &Arc<ChannelRegistry>, adapter: Arc<dyn AdapterDyn>) {
    let channel = adapter.channel();
    if let Err(error) = registry.register(adapter).await {
        // Keep serving the surfaces that did come up.
        tracing::error!(%channel, %error, "failed to register adapter");
    }
}

/// HTTP listener for platform webhooks (Telegram webhook mode, Twilio).
/// Returns None when no webhook-driven surface is configured.
async fn serve_platform_webhooks(
    telegram: Option<Arc<TelegramChannel>>,
    whatsapp: Option<Arc<WhatsAppChannel>>,
) -> anyhow::Result<Option<tokio::task::JoinHandle<()>>> {
    if telegram.is_none() && whatsapp.is_none() {
        return Ok(None);
    }

    let bind: std::net::SocketAddr = std::env::var("SWITCHBOARD_PLATFORM_WEBHOOK_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8081".to_string())
        .parse()
        .context("invalid SWITCHBOARD_PLATFORM_WEBHOOK_BIND")?;
    let public_base = std::env::var("SWITCHBOARD_PUBLIC_URL").unwrap_or_default();

    let mut app = axum::Router::new();

    if let Some(telegram) = telegram {
        app = app.route(
            "/webhooks/telegram",
            axum::routing::post(move |axum::Json(update): axum::Json<teloxide::types::Update>| {
                let telegram = telegram.clone();
                async move {
                    telegram.process_webhook_update(update).await;
                    axum::http::StatusCode::OK
                }
            }),
        );
    }

    if let Some(whatsapp) = whatsapp {
        let signed_url = format!("{public_base}/webhooks/whatsapp");
        app = app.route(
            "/webhooks/whatsapp",
            axum::routing::post(
                move |headers: axum::http::HeaderMap,
                      axum::Form(params): axum::Form<BTreeMap<String, String>>| {
                    let whatsapp = whatsapp.clone();
                    let signed_url = signed_url.clone();
                    async move {
                        let signature = headers
                            .get("x-twilio-signature")
                            .and_then(|value| value.to_str().ok())
                            .unwrap_or_default();
                        match whatsapp.handle_webhook(&signed_url, &params, signature).await {
                            Ok(()) => axum::http::StatusCode::OK,
                            Err(switchboard::Error::Adapter(
                                switchboard::error::AdapterError::Unauthenticated,
                            )) => axum::http::StatusCode::UNAUTHORIZED,
                            Err(error) => {
                                tracing::warn!(%error, "whatsapp webhook rejected");
                                axum::http::StatusCode::BAD_REQUEST
                            }
                        }
                    }
                },
            ),
        );
    }

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind platform webhook listener on {bind}"))?;
    tracing::info!(addr = %bind, "platform webhook listener up");

    let handle = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            tracing::error!(%error, "platform webhook server error");
        }
    });
    Ok(Some(handle))
}
