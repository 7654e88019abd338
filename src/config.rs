//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use std::net::SocketAddr;

/// Switchboard configuration. Adapters are optional; the gateway runs with
/// whichever surfaces are configured.
#[derive(Debug, Clone)]
pub struct Config {
    pub brain: BrainConfig,
    pub telegram: Option<TelegramConfig>,
    pub discord: Option<DiscordConfig>,
    pub whatsapp: Option<WhatsAppConfig>,
    pub web: Option<WebConfig>,
    pub webhook: Option<WebhookConfig>,
}

/// Upstream Brain endpoint.
#[derive(Debug, Clone)]
pub struct BrainConfig {
    pub base_url: url::Url,
}

/// Telegram update delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelegramMode {
    Polling,
    Webhook,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub mode: TelegramMode,
    pub webhook_url: Option<url::Url>,
    pub default_workspace_id: String,
    /// When set, updates from other users are ignored.
    pub allowed_user_ids: Option<Vec<u64>>,
}

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub bot_token: String,
    pub client_id: u64,
    /// Guild-scoped slash command registration when set, global otherwise.
    pub guild_id: Option<u64>,
    pub default_workspace_id: String,
    pub allowed_role_ids: Option<Vec<u64>>,
}

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub default_workspace_id: String,
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    pub default_workspace_id: String,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub secret: String,
    pub header_prefix: String,
    pub endpoints: Vec<String>,
}

impl Config {
    /// Load configuration from the environment. Adapter sections appear only
    /// when their required credentials are present.
    pub fn load() -> Result<Self> {
        let brain_url = require_env("SWITCHBOARD_BRAIN_URL")?;
        let brain = BrainConfig {
            base_url: brain_url
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("SWITCHBOARD_BRAIN_URL: {e}")))?,
        };

        let telegram = match std::env::var("TELEGRAM_BOT_TOKEN") {
            Ok(bot_token) => Some(load_telegram(bot_token)?),
            Err(_) => None,
        };

        let discord = match std::env::var("DISCORD_BOT_TOKEN") {
            Ok(bot_token) => Some(load_discord(bot_token)?),
            Err(_) => None,
        };

        let whatsapp = match std::env::var("TWILIO_ACCOUNT_SID") {
            Ok(account_sid) => Some(WhatsAppConfig {
                account_sid,
                auth_token: require_env("TWILIO_AUTH_TOKEN")?,
                from_number: require_env("TWILIO_FROM_NUMBER")?,
                default_workspace_id: default_workspace()?,
            }),
            Err(_) => None,
        };

        let web = match std::env::var("SWITCHBOARD_JWT_SECRET") {
            Ok(jwt_secret) => {
                let bind = std::env::var("SWITCHBOARD_WEB_BIND")
                    .unwrap_or_else(|_| "127.0.0.1:8080".to_string());
                Some(WebConfig {
                    bind_addr: bind.parse().map_err(|e| {
                        ConfigError::Invalid(format!("SWITCHBOARD_WEB_BIND: {e}"))
                    })?,
                    jwt_secret,
                    default_workspace_id: default_workspace()?,
                })
            }
            Err(_) => None,
        };

        let webhook = match std::env::var("SWITCHBOARD_WEBHOOK_SECRET") {
            Ok(secret) => Some(WebhookConfig {
                secret,
                header_prefix: std::env::var("SWITCHBOARD_WEBHOOK_PREFIX")
                    .unwrap_or_else(|_| "switchboard".to_string()),
                endpoints: std::env::var("SWITCHBOARD_WEBHOOK_ENDPOINTS")
                    .map(|raw| {
                        raw.split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            }),
            Err(_) => None,
        };

        let config = Self {
            brain,
            telegram,
            discord,
            whatsapp,
            web,
            webhook,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(telegram) = &self.telegram {
            if telegram.bot_token.is_empty() {
                return Err(ConfigError::MissingKey("TELEGRAM_BOT_TOKEN".into()).into());
            }
            if telegram.mode == TelegramMode::Webhook && telegram.webhook_url.is_none() {
                return Err(ConfigError::Invalid(
                    "telegram webhook mode requires TELEGRAM_WEBHOOK_URL".into(),
                )
                .into());
            }
        }
        if let Some(whatsapp) = &self.whatsapp {
            if !whatsapp.from_number.starts_with('+') {
                return Err(ConfigError::Invalid(
                    "TWILIO_FROM_NUMBER must be E.164 (start with +)".into(),
                )
                .into());
            }
        }
        if let Some(web) = &self.web {
            if web.jwt_secret.len() < 16 {
                return Err(ConfigError::Invalid(
                    "SWITCHBOARD_JWT_SECRET must be at least 16 bytes".into(),
                )
                .into());
            }
        }
        Ok(())
    }
}

fn load_telegram(bot_token: String) -> Result<TelegramConfig> {
    let mode = match std::env::var("TELEGRAM_MODE").as_deref() {
        Ok("webhook") => TelegramMode::Webhook,
        Ok("polling") | Err(_) => TelegramMode::Polling,
        Ok(other) => {
            return Err(
                ConfigError::Invalid(format!("TELEGRAM_MODE must be polling|webhook, got {other}"))
                    .into(),
            );
        }
    };
    let webhook_url = match std::env::var("TELEGRAM_WEBHOOK_URL") {
        Ok(raw) => Some(
            raw.parse()
                .map_err(|e| ConfigError::Invalid(format!("TELEGRAM_WEBHOOK_URL: {e}")))?,
        ),
        Err(_) => None,
    };
    Ok(TelegramConfig {
        bot_token,
        mode,
        webhook_url,
        default_workspace_id: default_workspace()?,
        allowed_user_ids: parse_id_list("TELEGRAM_ALLOWED_USER_IDS")?,
    })
}

fn load_discord(bot_token: String) -> Result<DiscordConfig> {
    Ok(DiscordConfig {
        bot_token,
        client_id: require_env("DISCORD_CLIENT_ID")?
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("DISCORD_CLIENT_ID: {e}")))?,
        guild_id: match std::env::var("DISCORD_GUILD_ID") {
            Ok(raw) => Some(
                raw.parse()
                    .map_err(|e| ConfigError::Invalid(format!("DISCORD_GUILD_ID: {e}")))?,
            ),
            Err(_) => None,
        },
        default_workspace_id: default_workspace()?,
        allowed_role_ids: parse_id_list("DISCORD_ALLOWED_ROLE_IDS")?,
    })
}

fn default_workspace() -> Result<String> {
    require_env("SWITCHBOARD_DEFAULT_WORKSPACE")
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| ConfigError::MissingKey(key.to_string()).into())
}

fn parse_id_list(key: &str) -> Result<Option<Vec<u64>>> {
    match std::env::var(key) {
        Ok(raw) => {
            let ids = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<u64>()
                        .map_err(|e| ConfigError::Invalid(format!("{key}: {e}")))
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(Some(ids))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            brain: BrainConfig {
                base_url: "http://localhost:9000/".parse().unwrap(),
            },
            telegram: None,
            discord: None,
            whatsapp: None,
            web: None,
            webhook: None,
        }
    }

    #[test]
    fn webhook_mode_without_url_is_rejected() {
        let mut config = base_config();
        config.telegram = Some(TelegramConfig {
            bot_token: "token".into(),
            mode: TelegramMode::Webhook,
            webhook_url: None,
            default_workspace_id: "ws".into(),
            allowed_user_ids: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_number_must_be_e164() {
        let mut config = base_config();
        config.whatsapp = Some(WhatsAppConfig {
            account_sid: "AC123".into(),
            auth_token: "secret".into(),
            from_number: "whatsapp:14155550100".into(),
            default_workspace_id: "ws".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn short_jwt_secrets_are_rejected() {
        let mut config = base_config();
        config.web = Some(WebConfig {
            bind_addr: "127.0.0.1:8080".parse().unwrap(),
            jwt_secret: "short".into(),
            default_workspace_id: "ws".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn minimal_config_validates() {
        assert!(base_config().validate().is_ok());
    }
}
