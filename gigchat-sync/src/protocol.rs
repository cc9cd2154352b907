//! Named-event wire protocol spoken over the live connection.
//!
//! Every WebSocket text frame carries one JSON envelope:
//! ```text
//! ┌──────────────────────────┬──────────────────────────────┐
//! │ "event": <name>          │ "data": <event payload>      │
//! │ "message received"       │ Message                      │
//! │ "message updated"        │ Message                      │
//! │ "conversation list upd…" │ Message                      │
//! │ "messages read"          │ {conversationId, messageIds} │
//! │ "order notification"     │ OrderNotification            │
//! │ "online"                 │ ["alice", "bob", …]          │
//! └──────────────────────────┴──────────────────────────────┘
//! ```
//!
//! `message received` and `message updated` stay distinct here so the UI can
//! animate them differently; the engine applies both the same way.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{ConversationId, Message, MessageId, OrderNotification};
use crate::transport::ConnectionState;

/// Inbound event names.
pub mod names {
    pub const MESSAGE_RECEIVED: &str = "message received";
    pub const MESSAGE_UPDATED: &str = "message updated";
    pub const CONVERSATION_LIST_UPDATED: &str = "conversation list updated";
    pub const MESSAGES_READ: &str = "messages read";
    pub const ORDER_NOTIFICATION: &str = "order notification";
    pub const ONLINE: &str = "online";

    /// Outbound: ask the server for a fresh `online` roster.
    pub const GET_LOGGED_IN_USERS: &str = "getLoggedInUsers";
    /// Outbound: announce the local user.
    pub const LOGGED_IN_USERS: &str = "loggedInUsers";
    /// Outbound: withdraw the local user.
    pub const REMOVE_LOGGED_IN_USER: &str = "removeLoggedInUser";

    /// Every inbound name the engine consumes.
    pub const INBOUND: [&str; 6] = [
        MESSAGE_RECEIVED,
        MESSAGE_UPDATED,
        CONVERSATION_LIST_UPDATED,
        MESSAGES_READ,
        ORDER_NOTIFICATION,
        ONLINE,
    ];
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    #[error("malformed payload for {event}: {reason}")]
    MalformedPayload { event: String, reason: String },
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Read receipt payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: ConversationId,
    pub message_ids: Vec<MessageId>,
}

/// Decoded event handed to the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    MessageReceived(Message),
    MessageUpdated(Message),
    ConversationListUpdated(Message),
    ReadReceipt(ReadReceipt),
    PresenceSnapshot(Vec<String>),
    OrderNotification(OrderNotification),
    /// Synthesized locally from the transport, never on the wire.
    Connection(ConnectionState),
    /// Synthesized locally: a new connection replaced an earlier one.
    Reconnected,
}

impl InboundEvent {
    /// Decode a named payload.
    pub fn decode(event: &str, data: Value) -> Result<Self, ProtocolError> {
        fn payload<T: serde::de::DeserializeOwned>(
            event: &str,
            data: Value,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(data).map_err(|e| ProtocolError::MalformedPayload {
                event: event.to_string(),
                reason: e.to_string(),
            })
        }

        match event {
            names::MESSAGE_RECEIVED => Ok(Self::MessageReceived(payload(event, data)?)),
            names::MESSAGE_UPDATED => Ok(Self::MessageUpdated(payload(event, data)?)),
            names::CONVERSATION_LIST_UPDATED => {
                Ok(Self::ConversationListUpdated(payload(event, data)?))
            }
            names::MESSAGES_READ => Ok(Self::ReadReceipt(payload(event, data)?)),
            names::ORDER_NOTIFICATION => Ok(Self::OrderNotification(payload(event, data)?)),
            names::ONLINE => Ok(Self::PresenceSnapshot(payload(event, data)?)),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }

    /// Decode a whole frame.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        Self::decode(&envelope.event, envelope.data)
    }

    /// Wire name, or `None` for locally synthesized events.
    pub fn name(&self) -> Option<&'static str> {
        match self {
            Self::MessageReceived(_) => Some(names::MESSAGE_RECEIVED),
            Self::MessageUpdated(_) => Some(names::MESSAGE_UPDATED),
            Self::ConversationListUpdated(_) => Some(names::CONVERSATION_LIST_UPDATED),
            Self::ReadReceipt(_) => Some(names::MESSAGES_READ),
            Self::OrderNotification(_) => Some(names::ORDER_NOTIFICATION),
            Self::PresenceSnapshot(_) => Some(names::ONLINE),
            Self::Connection(_) | Self::Reconnected => None,
        }
    }
}

/// Events this client emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    GetLoggedInUsers,
    LoggedInUsers(String),
    RemoveLoggedInUser(String),
}

impl OutboundEvent {
    pub fn into_envelope(self) -> Envelope {
        match self {
            Self::GetLoggedInUsers => Envelope::new(names::GET_LOGGED_IN_USERS, Value::Null),
            Self::LoggedInUsers(username) => {
                Envelope::new(names::LOGGED_IN_USERS, Value::String(username))
            }
            Self::RemoveLoggedInUser(username) => {
                Envelope::new(names::REMOVE_LOGGED_IN_USER, Value::String(username))
            }
        }
    }
}
