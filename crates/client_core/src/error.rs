use shared::domain::MessageId;
use thiserror::Error;

/// Failures the core surfaces to its caller. Transport-level detail rides the
/// `anyhow` chain underneath; callers that need to branch downcast to this.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no internal identity found for external id '{0}'")]
    IdentityNotFound(String),

    #[error("no conversation is open")]
    NoOpenConversation,

    #[error("live channel disconnected")]
    ChannelDisconnected,

    #[error("send failed for local message {local_id:?}: {reason}")]
    SendFailed { local_id: MessageId, reason: String },

    #[error("message {0:?} is not in a failed state")]
    NotRetriable(MessageId),

    #[error("unknown local message {0:?}")]
    UnknownLocalMessage(MessageId),
}
