//! Approval broker: tracks pending user-decision checkpoints requested by
//! Brain, forwards them to the user's surface, and routes resolutions back
//! through callbacks registered at startup. The broker holds no reference to
//! the registry; delivery goes through an injected handler.

use crate::brain::{ApprovalOutcome, BrainClient};
use crate::error::ApprovalError;
use crate::{Button, ChannelType, OutboundMessage, Result, UserId, WorkspaceId};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Delivers an approval prompt to a user's surface. Registered once at
/// startup (typically wrapping the message router). The origin channel is
/// taken from the approval's surface context when known.
pub type DeliveryHandler = Arc<
    dyn Fn(UserId, OutboundMessage, Option<ChannelType>) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;

/// A pending approval tracked in memory.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub task_id: String,
    pub user_id: UserId,
    pub surface_context: serde_json::Value,
}

pub struct ApprovalBroker {
    brain: Arc<dyn BrainClient>,
    pending: RwLock<HashMap<String, PendingApproval>>,
    /// Outcomes of approvals resolved this process lifetime, for idempotent
    /// repeat resolutions.
    resolved: RwLock<HashMap<String, bool>>,
    delivery: RwLock<Option<DeliveryHandler>>,
}

impl ApprovalBroker {
    pub fn new(brain: Arc<dyn BrainClient>) -> Self {
        Self {
            brain,
            pending: RwLock::new(HashMap::new()),
            resolved: RwLock::new(HashMap::new()),
            delivery: RwLock::new(None),
        }
    }

    /// Register the delivery handler. Called once during wiring, before any
    /// adapter connects.
    pub async fn set_delivery(&self, handler: DeliveryHandler) {
        *self.delivery.write().await = Some(handler);
    }

    /// Track an approval and emit the platform-native approve/reject prompt.
    /// A repeated request for an already-pending id is a no-op.
    pub async fn send_approval_request_for_user(
        &self,
        user_id: &UserId,
        approval_id: &str,
        description: &str,
        task_id: &str,
        surface_context: serde_json::Value,
    ) -> Result<()> {
        let origin = surface_context
            .get("channel")
            .and_then(|value| value.as_str())
            .and_then(|raw| raw.parse::<ChannelType>().ok());

        {
            let mut pending = self.pending.write().await;
            if pending.contains_key(approval_id) {
                tracing::debug!(%approval_id, "approval already pending, not re-sending");
                return Ok(());
            }
            pending.insert(
                approval_id.to_string(),
                PendingApproval {
                    task_id: task_id.to_string(),
                    user_id: user_id.clone(),
                    surface_context,
                },
            );
        }

        let prompt = OutboundMessage::text(format!("🔐 Approval required: {description}"))
            .with_buttons(vec![
                Button::new("✅ Approve", "approve").with_value(approval_id),
                Button::new("❌ Reject", "reject").with_value(approval_id),
            ]);

        let handler = self.delivery.read().await.clone();
        match handler {
            Some(deliver) => deliver(user_id.clone(), prompt, origin).await,
            None => {
                tracing::warn!(%approval_id, "no delivery handler registered, approval not surfaced");
                Ok(())
            }
        }
    }

    /// Resolve an approval from a surface event (button click, keyword).
    ///
    /// One-shot: the first resolution wins. A repeat with the same outcome
    /// succeeds (with a warning); a conflicting repeat reports
    /// `already resolved`. When the in-memory entry is gone (adapter
    /// restart) the actor is required and the call goes through anyway,
    /// since Brain is the source of truth.
    pub async fn resolve_pending(
        &self,
        approval_id: &str,
        approved: bool,
        actor_user_id: Option<&UserId>,
    ) -> Result<ApprovalOutcome> {
        if let Some(previous) = self.resolved.read().await.get(approval_id) {
            return if *previous == approved {
                tracing::warn!(%approval_id, "approval re-resolved with same outcome");
                Ok(ApprovalOutcome::ok())
            } else {
                Ok(ApprovalOutcome::failed("already resolved"))
            };
        }

        let entry = self.pending.read().await.get(approval_id).cloned();

        let user_id = match (&entry, actor_user_id) {
            (Some(entry), Some(actor)) => {
                if *actor != entry.user_id {
                    return Err(ApprovalError::WrongUser {
                        approval_id: approval_id.to_string(),
                    }
                    .into());
                }
                actor.clone()
            }
            (Some(entry), None) => entry.user_id.clone(),
            (None, Some(actor)) => actor.clone(),
            (None, None) => {
                return Err(ApprovalError::Unknown {
                    approval_id: approval_id.to_string(),
                }
                .into());
            }
        };

        let outcome = self
            .brain
            .approve_action(approval_id, &user_id, approved)
            .await
            .map_err(|error| ApprovalError::Callback(error.to_string()))?;

        if outcome.success {
            self.pending.write().await.remove(approval_id);
            self.resolved
                .write()
                .await
                .insert(approval_id.to_string(), approved);
            tracing::info!(%approval_id, approved, "approval resolved");
        }

        Ok(outcome)
    }

    /// Approvals still pending for a user, from the in-memory map.
    pub async fn pending_for_user(&self, user_id: &UserId) -> Vec<String> {
        self.pending
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.user_id == *user_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Ask Brain for the authoritative pending list (survives restarts).
    pub async fn list_pending(
        &self,
        user_id: &UserId,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<String>> {
        Ok(self
            .brain
            .list_pending_approvals(user_id, workspace_id)
            .await
            .map_err(|error| ApprovalError::Callback(error.to_string()))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::{ChatRequest, ChunkStream};
    use crate::error::BrainError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBrain {
        approvals: Mutex<Vec<(String, String, bool)>>,
    }

    #[async_trait]
    impl BrainClient for RecordingBrain {
        async fn stream_chat(
            &self,
            _request: ChatRequest,
        ) -> std::result::Result<ChunkStream, BrainError> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn approve_action(
            &self,
            approval_id: &str,
            user_id: &UserId,
            approved: bool,
        ) -> std::result::Result<ApprovalOutcome, BrainError> {
            self.approvals.lock().unwrap().push((
                approval_id.to_string(),
                user_id.to_string(),
                approved,
            ));
            Ok(ApprovalOutcome::ok())
        }

        async fn list_pending_approvals(
            &self,
            _user_id: &UserId,
            _workspace_id: &WorkspaceId,
        ) -> std::result::Result<Vec<String>, BrainError> {
            Ok(vec!["from-brain".to_string()])
        }
    }

    fn broker() -> (Arc<RecordingBrain>, ApprovalBroker) {
        let brain = Arc::new(RecordingBrain::default());
        let broker = ApprovalBroker::new(brain.clone());
        (brain, broker)
    }

    async fn track(broker: &ApprovalBroker, approval_id: &str, user: &str) {
        broker
            .send_approval_request_for_user(
                &UserId::from(user),
                approval_id,
                "delete the repo",
                "task-1",
                serde_json::json!({"channel": "telegram", "chat_id": 100}),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn approval_prompt_carries_buttons() {
        let (_, broker) = broker();
        let delivered: Arc<Mutex<Vec<(OutboundMessage, Option<ChannelType>)>>> = Arc::default();
        let sink = delivered.clone();
        broker
            .set_delivery(Arc::new(move |_user, message, origin| {
                let sink = sink.clone();
                Box::pin(async move {
                    sink.lock().unwrap().push((message, origin));
                    Ok(())
                })
            }))
            .await;

        track(&broker, "abc", "user-1").await;

        let messages = delivered.lock().unwrap();
        assert_eq!(messages.len(), 1);
        let (message, origin) = &messages[0];
        let tokens: Vec<String> = message
            .options
            .buttons
            .iter()
            .map(Button::callback_token)
            .collect();
        assert_eq!(tokens, vec!["approve:abc", "reject:abc"]);
        assert_eq!(*origin, Some(ChannelType::Telegram));
    }

    #[tokio::test]
    async fn repeated_request_for_pending_id_is_a_no_op() {
        let (_, broker) = broker();
        let count: Arc<Mutex<usize>> = Arc::default();
        let sink = count.clone();
        broker
            .set_delivery(Arc::new(move |_user, _message, _origin| {
                let sink = sink.clone();
                Box::pin(async move {
                    *sink.lock().unwrap() += 1;
                    Ok(())
                })
            }))
            .await;

        track(&broker, "abc", "user-1").await;
        track(&broker, "abc", "user-1").await;
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn resolution_is_one_shot_and_idempotent_up_to_outcome() {
        let (brain, broker) = broker();
        track(&broker, "abc", "user-1").await;
        let user = UserId::from("user-1");

        let first = broker
            .resolve_pending("abc", true, Some(&user))
            .await
            .unwrap();
        assert!(first.success);
        assert_eq!(
            brain.approvals.lock().unwrap().as_slice(),
            &[("abc".to_string(), "user-1".to_string(), true)]
        );

        // Same outcome again: success, no second brain call.
        let repeat = broker
            .resolve_pending("abc", true, Some(&user))
            .await
            .unwrap();
        assert!(repeat.success);
        assert_eq!(brain.approvals.lock().unwrap().len(), 1);

        // Conflicting outcome: already resolved.
        let conflict = broker
            .resolve_pending("abc", false, Some(&user))
            .await
            .unwrap();
        assert!(!conflict.success);
        assert_eq!(conflict.error.as_deref(), Some("already resolved"));
    }

    #[tokio::test]
    async fn resolution_rejects_the_wrong_actor() {
        let (_, broker) = broker();
        track(&broker, "abc", "user-1").await;

        let result = broker
            .resolve_pending("abc", true, Some(&UserId::from("intruder")))
            .await;
        assert!(matches!(
            result,
            Err(crate::Error::Approval(ApprovalError::WrongUser { .. }))
        ));
    }

    #[tokio::test]
    async fn unknown_approval_requires_an_actor_and_calls_through() {
        let (brain, broker) = broker();

        // No actor, no entry: structural error.
        assert!(matches!(
            broker.resolve_pending("ghost", true, None).await,
            Err(crate::Error::Approval(ApprovalError::Unknown { .. }))
        ));

        // Actor known: Brain is the source of truth, call goes through.
        let outcome = broker
            .resolve_pending("ghost", true, Some(&UserId::from("user-2")))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(brain.approvals.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pending_listing_prefers_brain() {
        let (_, broker) = broker();
        track(&broker, "abc", "user-1").await;

        let local = broker.pending_for_user(&UserId::from("user-1")).await;
        assert_eq!(local, vec!["abc"]);

        let authoritative = broker
            .list_pending(&UserId::from("user-1"), &WorkspaceId::from("ws"))
            .await
            .unwrap();
        assert_eq!(authoritative, vec!["from-brain"]);
    }
}
