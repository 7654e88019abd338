//! Per-user outbound routing: same-channel, all-channels, or prefer-web
//! delivery based on stored notification preferences.

use crate::channels::adapter::AdapterStatus;
use crate::channels::ChannelRegistry;
use crate::identity::{self, NotificationPrefs, RouteStrategy};
use crate::store::SessionStore;
use crate::{ChannelType, OutboundMessage, Result, UserId};
use std::sync::Arc;
use std::time::Duration;

/// Preferences change rarely; cache at least a session length and let
/// explicit invalidation handle the rest.
const PREFS_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

pub struct MessageRouter {
    registry: Arc<ChannelRegistry>,
    store: Arc<dyn SessionStore>,
    prefs_cache: moka::sync::Cache<UserId, NotificationPrefs>,
}

impl MessageRouter {
    pub fn new(registry: Arc<ChannelRegistry>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            registry,
            store,
            prefs_cache: moka::sync::Cache::builder()
                .time_to_live(PREFS_CACHE_TTL)
                .build(),
        }
    }

    /// Route an outbound message for a user according to their preferences.
    pub async fn route(
        &self,
        user_id: &UserId,
        message: OutboundMessage,
        origin_channel: ChannelType,
    ) -> Result<()> {
        let prefs = self.prefs(user_id).await?;

        if prefs.muted_now() {
            tracing::debug!(%user_id, "user muted, dropping outbound message");
            return Ok(());
        }

        match prefs.strategy {
            RouteStrategy::SameChannel => {
                self.registry
                    .send_to_channel(origin_channel, user_id, message)
                    .await
            }
            RouteStrategy::AllChannels => {
                // All-settled fan-out to the other enabled channels first,
                // then the origin.
                let others = prefs
                    .enabled_channels
                    .iter()
                    .copied()
                    .filter(|channel| *channel != origin_channel);
                let sends = others.map(|channel| {
                    let message = message.clone();
                    async move {
                        if let Err(error) = self
                            .registry
                            .send_to_channel(channel, user_id, message)
                            .await
                        {
                            tracing::warn!(%channel, %user_id, %error, "fan-out send failed");
                        }
                    }
                });
                futures::future::join_all(sends).await;

                self.registry
                    .send_to_channel(origin_channel, user_id, message)
                    .await
            }
            RouteStrategy::PreferWeb => {
                let web_connected = self
                    .registry
                    .adapter_status(ChannelType::Web)
                    .await
                    .is_some_and(|status| status == AdapterStatus::Connected);

                if web_connected {
                    if let Err(error) = self
                        .registry
                        .send_to_channel(ChannelType::Web, user_id, message.clone())
                        .await
                    {
                        tracing::warn!(%user_id, %error, "web send failed");
                    }
                    if origin_channel != ChannelType::Web {
                        self.registry
                            .send_to_channel(origin_channel, user_id, message)
                            .await
                    } else {
                        Ok(())
                    }
                } else {
                    self.registry
                        .send_to_channel(origin_channel, user_id, message)
                        .await
                }
            }
        }
    }

    /// Drop the cached preferences for a user after they change settings.
    pub fn invalidate_prefs(&self, user_id: &UserId) {
        self.prefs_cache.invalidate(user_id);
    }

    async fn prefs(&self, user_id: &UserId) -> Result<NotificationPrefs> {
        if let Some(prefs) = self.prefs_cache.get(user_id) {
            return Ok(prefs);
        }
        let prefs = identity::load_prefs(self.store.as_ref(), user_id).await?;
        self.prefs_cache.insert(user_id.clone(), prefs.clone());
        Ok(prefs)
    }
}
