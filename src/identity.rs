//! Cross-channel identity mapping, the short-window message deduplicator,
//! and per-user notification preferences.
//!
//! Key layout over the session store:
//! - `id:<channel>:<channel_user_id>` → identity row (forward index)
//! - `id:user:<user_id>` → set of `<channel>:<channel_user_id>` (reverse index)
//! - `dedup:<user_id>:<fingerprint>` → dedup window entry (TTL-bound)
//! - `prefs:<user_id>` → notification preferences

use crate::error::{IdentityError, StoreError};
use crate::store::SessionStore;
use crate::text::content_fingerprint;
use crate::{ChannelType, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Default dedup window. Long enough to absorb webhook retries and
/// cross-channel crossfires, short enough to let users repeat themselves.
pub const DEDUP_TTL: Duration = Duration::from_secs(5);

/// One `(channel, channel_user_id) → user_id` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelIdentity {
    pub user_id: UserId,
    pub channel: ChannelType,
    pub channel_user_id: String,
    pub display_name: Option<String>,
    /// True once this identity was explicitly linked to another account.
    pub linked: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl ChannelIdentity {
    pub fn new(
        user_id: impl Into<UserId>,
        channel: ChannelType,
        channel_user_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            channel,
            channel_user_id: channel_user_id.into(),
            display_name: None,
            linked: false,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

fn forward_key(channel: ChannelType, channel_user_id: &str) -> String {
    format!("id:{}:{}", channel, channel_user_id)
}

fn reverse_key(user_id: &str) -> String {
    format!("id:user:{user_id}")
}

fn reverse_member(channel: ChannelType, channel_user_id: &str) -> String {
    format!("{}:{}", channel, channel_user_id)
}

/// Identity store over the session KV backend. The (forward, reverse) pair is
/// written in order; readers tolerate a stale reverse row whose forward row
/// was relinked and skip it on lookup.
pub struct IdentityStore {
    store: Arc<dyn SessionStore>,
}

impl IdentityStore {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Upsert the forward index and insert the reverse-set membership.
    pub async fn register_identity(
        &self,
        identity: ChannelIdentity,
    ) -> Result<(), IdentityError> {
        let key = forward_key(identity.channel, &identity.channel_user_id);
        let row = serde_json::to_string(&identity).map_err(|e| StoreError::Codec {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        self.store.set(&key, &row, None).await?;
        self.store
            .set_add(
                &reverse_key(&identity.user_id),
                &reverse_member(identity.channel, &identity.channel_user_id),
            )
            .await?;

        tracing::debug!(
            user_id = %identity.user_id,
            channel = %identity.channel,
            channel_user_id = %identity.channel_user_id,
            "identity registered"
        );
        Ok(())
    }

    pub async fn resolve_user_id(
        &self,
        channel: ChannelType,
        channel_user_id: &str,
    ) -> Result<Option<UserId>, IdentityError> {
        Ok(self
            .load_identity(channel, channel_user_id)
            .await?
            .map(|identity| identity.user_id))
    }

    /// Rewrite the secondary identity to point at `primary_user_id` and move
    /// its reverse-index membership. Missing secondary is logged and skipped.
    pub async fn link_identities(
        &self,
        primary_user_id: &UserId,
        secondary_channel: ChannelType,
        secondary_channel_user_id: &str,
    ) -> Result<(), IdentityError> {
        let Some(mut identity) = self
            .load_identity(secondary_channel, secondary_channel_user_id)
            .await?
        else {
            tracing::warn!(
                channel = %secondary_channel,
                channel_user_id = %secondary_channel_user_id,
                "link requested for unknown identity, skipping"
            );
            return Ok(());
        };

        let previous_user_id = identity.user_id.clone();
        identity.user_id = primary_user_id.clone();
        identity.linked = true;

        let key = forward_key(secondary_channel, secondary_channel_user_id);
        let row = serde_json::to_string(&identity).map_err(|e| StoreError::Codec {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set(&key, &row, None).await?;

        let member = reverse_member(secondary_channel, secondary_channel_user_id);
        self.store
            .set_remove(&reverse_key(&previous_user_id), &member)
            .await?;
        self.store
            .set_add(&reverse_key(primary_user_id), &member)
            .await?;

        tracing::info!(
            from = %previous_user_id,
            to = %primary_user_id,
            channel = %secondary_channel,
            channel_user_id = %secondary_channel_user_id,
            "identities linked"
        );
        Ok(())
    }

    /// All identities currently owned by `user_id`. Stale reverse rows
    /// (relinked elsewhere since) are skipped.
    pub async fn user_identities(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<ChannelIdentity>, IdentityError> {
        let members = self.store.set_members(&reverse_key(user_id)).await?;
        let mut identities = Vec::with_capacity(members.len());

        for member in members {
            let Some((channel, channel_user_id)) = member.split_once(':') else {
                continue;
            };
            let Ok(channel) = channel.parse::<ChannelType>() else {
                continue;
            };
            if let Some(identity) = self.load_identity(channel, channel_user_id).await? {
                if identity.user_id == *user_id {
                    identities.push(identity);
                }
            }
        }

        Ok(identities)
    }

    async fn load_identity(
        &self,
        channel: ChannelType,
        channel_user_id: &str,
    ) -> Result<Option<ChannelIdentity>, IdentityError> {
        let key = forward_key(channel, channel_user_id);
        let Some(row) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let identity = serde_json::from_str(&row).map_err(|e| StoreError::Codec {
            key,
            reason: e.to_string(),
        })?;
        Ok(Some(identity))
    }
}

/// Deterministic logical-user id from a stable platform seed: SHA-256 of the
/// seed folded into a v4-shaped UUID. The same platform account always maps
/// to the same id, across restarts and across gateway instances.
pub fn derived_uuid(seed: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(seed.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    // Stamp the version/variant bits so the result reads as a v4 UUID.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    uuid::Uuid::from_bytes(bytes).to_string()
}

/// Short-window duplicate suppression across channels. The key is the user
/// plus a content fingerprint; the first writer wins for the TTL window.
pub struct Deduplicator {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self::with_ttl(store, DEDUP_TTL)
    }

    pub fn with_ttl(store: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        // Longer windows start suppressing legitimate repeats.
        debug_assert!(ttl <= Duration::from_secs(10));
        Self { store, ttl }
    }

    /// True when the same user sent identical content within the window.
    pub async fn is_duplicate(
        &self,
        user_id: &UserId,
        content: &str,
        channel: ChannelType,
    ) -> Result<bool, StoreError> {
        let fingerprint = content_fingerprint(content);
        let key = format!("dedup:{user_id}:{fingerprint:08x}");
        let inserted = self
            .store
            .set_if_absent(&key, channel.as_str(), self.ttl)
            .await?;
        Ok(!inserted)
    }
}

/// Outbound routing strategy for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RouteStrategy {
    #[default]
    SameChannel,
    AllChannels,
    PreferWeb,
}

/// Per-user notification preferences.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationPrefs {
    #[serde(default)]
    pub strategy: RouteStrategy,
    #[serde(default)]
    pub enabled_channels: Vec<ChannelType>,
    pub mute_until: Option<chrono::DateTime<chrono::Utc>>,
}

impl NotificationPrefs {
    pub fn muted_now(&self) -> bool {
        self.mute_until
            .is_some_and(|until| until > chrono::Utc::now())
    }
}

fn prefs_key(user_id: &str) -> String {
    format!("prefs:{user_id}")
}

/// Load a user's notification preferences, defaulting when unset.
pub async fn load_prefs(
    store: &dyn SessionStore,
    user_id: &UserId,
) -> Result<NotificationPrefs, StoreError> {
    let key = prefs_key(user_id);
    match store.get(&key).await? {
        Some(row) => serde_json::from_str(&row).map_err(|e| StoreError::Codec {
            key,
            reason: e.to_string(),
        }),
        None => Ok(NotificationPrefs::default()),
    }
}

/// Persist a user's notification preferences.
pub async fn save_prefs(
    store: &dyn SessionStore,
    user_id: &UserId,
    prefs: &NotificationPrefs,
) -> Result<(), StoreError> {
    let key = prefs_key(user_id);
    let row = serde_json::to_string(prefs).map_err(|e| StoreError::Codec {
        key: key.clone(),
        reason: e.to_string(),
    })?;
    store.set(&key, &row, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn store() -> Arc<dyn SessionStore> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn identity_round_trip() {
        let identities = IdentityStore::new(store());
        let identity = ChannelIdentity::new("user-1", ChannelType::Telegram, "42")
            .with_display_name("Alice");
        identities.register_identity(identity).await.unwrap();

        let resolved = identities
            .resolve_user_id(ChannelType::Telegram, "42")
            .await
            .unwrap();
        assert_eq!(resolved.as_deref(), Some("user-1"));

        let listed = identities
            .user_identities(&UserId::from("user-1"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].channel_user_id, "42");
        assert!(!listed[0].linked);
    }

    #[tokio::test]
    async fn linking_moves_ownership() {
        let identities = IdentityStore::new(store());
        identities
            .register_identity(ChannelIdentity::new("user-a", ChannelType::Telegram, "42"))
            .await
            .unwrap();

        let primary = UserId::from("user-b");
        identities
            .link_identities(&primary, ChannelType::Telegram, "42")
            .await
            .unwrap();

        let resolved = identities
            .resolve_user_id(ChannelType::Telegram, "42")
            .await
            .unwrap();
        assert_eq!(resolved.as_deref(), Some("user-b"));

        let old = identities
            .user_identities(&UserId::from("user-a"))
            .await
            .unwrap();
        assert!(old.is_empty());

        let new = identities.user_identities(&primary).await.unwrap();
        assert_eq!(new.len(), 1);
        assert!(new[0].linked);
    }

    #[tokio::test]
    async fn linking_unknown_identity_is_a_no_op() {
        let identities = IdentityStore::new(store());
        identities
            .link_identities(&UserId::from("user-b"), ChannelType::Discord, "555")
            .await
            .unwrap();
        assert_eq!(
            identities
                .resolve_user_id(ChannelType::Discord, "555")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn stale_reverse_rows_are_skipped() {
        let backing = store();
        let identities = IdentityStore::new(backing.clone());
        identities
            .register_identity(ChannelIdentity::new("user-a", ChannelType::Telegram, "42"))
            .await
            .unwrap();

        // Simulate a relink that updated the forward row but whose reverse
        // cleanup has not landed yet.
        let relinked = ChannelIdentity::new("user-b", ChannelType::Telegram, "42");
        backing
            .set(
                "id:telegram:42",
                &serde_json::to_string(&relinked).unwrap(),
                None,
            )
            .await
            .unwrap();

        let listed = identities
            .user_identities(&UserId::from("user-a"))
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn duplicate_window_suppresses_identical_content() {
        let dedup = Deduplicator::with_ttl(store(), Duration::from_millis(50));
        let user = UserId::from("user-1");

        assert!(
            !dedup
                .is_duplicate(&user, "Are you there?", ChannelType::Telegram)
                .await
                .unwrap()
        );
        // Same content, any channel, inside the window: duplicate.
        assert!(
            dedup
                .is_duplicate(&user, "Are you there?", ChannelType::Web)
                .await
                .unwrap()
        );
        // Different content is not suppressed.
        assert!(
            !dedup
                .is_duplicate(&user, "Still there?", ChannelType::Telegram)
                .await
                .unwrap()
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(
            !dedup
                .is_duplicate(&user, "Are you there?", ChannelType::Telegram)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn prefs_round_trip_with_default_fallback() {
        let backing = store();
        let user = UserId::from("user-1");

        let defaults = load_prefs(backing.as_ref(), &user).await.unwrap();
        assert_eq!(defaults.strategy, RouteStrategy::SameChannel);
        assert!(!defaults.muted_now());

        let prefs = NotificationPrefs {
            strategy: RouteStrategy::PreferWeb,
            enabled_channels: vec![ChannelType::Web, ChannelType::Telegram],
            mute_until: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
        };
        save_prefs(backing.as_ref(), &user, &prefs).await.unwrap();

        let loaded = load_prefs(backing.as_ref(), &user).await.unwrap();
        assert_eq!(loaded.strategy, RouteStrategy::PreferWeb);
        assert!(loaded.muted_now());
    }
}
