//! Error taxonomy for the synchronization engine.
//!
//! Duplicate and out-of-order events are not errors: they are absorbed by
//! idempotent upserts and never show up here.

use thiserror::Error;

use crate::model::MessageId;

/// Errors surfaced by the engine, the session and the remote service client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The live connection is down. Cached state stays valid but goes stale.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// An optimistic send did not reach the service (network or validation).
    /// The placeholder stays in the store; nothing is retried.
    #[error("send of {placeholder_id} failed: {reason}")]
    SendFailed {
        placeholder_id: MessageId,
        reason: String,
    },

    /// Accept/cancel attempted on an offer that is already accepted or cancelled.
    #[error("offer on message {0} is already resolved")]
    OfferAlreadyResolved(MessageId),

    /// A history page arrived after the user navigated to another conversation.
    #[error("history for conversation {0} arrived after it was closed")]
    HistoryFetchStale(String),

    /// The referenced message is not in the open conversation.
    #[error("message {0} is not in the open conversation")]
    UnknownMessage(MessageId),

    /// The referenced message carries no offer.
    #[error("message {0} carries no offer")]
    NoOffer(MessageId),

    /// An accept/cancel for this message is still waiting on the service.
    #[error("offer transition for message {0} is already in flight")]
    OfferTransitionInFlight(MessageId),

    /// The remote service rejected the request or could not be reached.
    #[error("remote service error: {0}")]
    Api(String),

    /// A setting cannot be used as given (for example an unparsable gateway URL).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A frame or payload could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session task has stopped.
    #[error("session closed")]
    SessionClosed,
}

impl From<crate::protocol::ProtocolError> for SyncError {
    fn from(err: crate::protocol::ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Api(err.to_string())
    }
}
