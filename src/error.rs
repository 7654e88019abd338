//! Top-level error types for Switchboard.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Brain(#[from] BrainError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Channel adapter errors. Variants mirror the recovery policy: structural
/// errors are never retried, transient ones are retried with backoff.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("{channel} adapter is not connected")]
    NotConnected { channel: crate::ChannelType },

    #[error("{channel} adapter is already connecting")]
    AlreadyConnecting { channel: crate::ChannelType },

    #[error("{channel} connect failed: {reason}")]
    ConnectFailed {
        channel: crate::ChannelType,
        reason: String,
    },

    #[error("no {channel} mapping for user {user_id}")]
    UnknownUser {
        channel: crate::ChannelType,
        user_id: String,
    },

    #[error("unknown conversation: {conversation_id}")]
    UnknownConversation { conversation_id: String },

    #[error("{channel} does not support {operation}")]
    Unsupported {
        channel: crate::ChannelType,
        operation: &'static str,
    },

    #[error("authentication required")]
    Unauthenticated,

    #[error("forbidden")]
    Forbidden,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{channel} rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        channel: crate::ChannelType,
        retry_after_secs: u64,
    },

    #[error("{channel} send failed: {reason}")]
    SendFailed {
        channel: crate::ChannelType,
        reason: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Identity store errors.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("no identity for {channel}:{channel_user_id}")]
    Unknown {
        channel: crate::ChannelType,
        channel_user_id: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Upstream Brain errors.
#[derive(Debug, thiserror::Error)]
pub enum BrainError {
    #[error("brain request failed: {0}")]
    Request(String),

    #[error("brain stream aborted: {0}")]
    StreamAborted(String),

    #[error("malformed brain chunk: {0}")]
    Protocol(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Approval broker errors.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval {approval_id} already resolved")]
    AlreadyResolved { approval_id: String },

    #[error("unknown approval: {approval_id}")]
    Unknown { approval_id: String },

    #[error("approval {approval_id} belongs to another user")]
    WrongUser { approval_id: String },

    #[error("approval callback failed: {0}")]
    Callback(String),
}

/// Session/identity key-value store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("value for {key} is not valid JSON: {reason}")]
    Codec { key: String, reason: String },
}
