//! Chat data model shared by every store and by the wire protocol.
//!
//! All types serialize to the camelCase JSON the marketplace gateway speaks.
//! Timestamps are `chrono::DateTime<Utc>` (RFC 3339 on the wire).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server- or client-issued message identity.
pub type MessageId = String;

/// Server-issued conversation identity (or a `pending-` placeholder).
pub type ConversationId = String;

/// Prefix of client-generated placeholder message ids (`local-1`, `local-2`, …).
pub const LOCAL_MESSAGE_PREFIX: &str = "local-";

/// Prefix of client-generated placeholder conversation ids.
pub const PENDING_CONVERSATION_PREFIX: &str = "pending-";

/// Fresh `pending-<uuid>` id for a conversation the service has not created yet.
pub fn new_pending_conversation_id() -> ConversationId {
    format!("{PENDING_CONVERSATION_PREFIX}{}", uuid::Uuid::new_v4())
}

/// Whether a conversation id is a client placeholder awaiting the service.
pub fn is_pending_conversation(id: &str) -> bool {
    id.starts_with(PENDING_CONVERSATION_PREFIX)
}

// ───────────────────────────────────────────────────────────────────
// Attachments
// ───────────────────────────────────────────────────────────────────

/// Coarse MIME category of an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentCategory {
    Image,
    Video,
    Audio,
    Document,
    Archive,
    #[serde(other)]
    Other,
}

/// A file already uploaded by the service and referenced by URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    pub category: AttachmentCategory,
    /// Size in bytes.
    pub size: u64,
    pub file_name: String,
}

/// A file picked locally, sent inline with the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingAttachment {
    pub file_name: String,
    pub category: AttachmentCategory,
    pub data: Vec<u8>,
}

// ───────────────────────────────────────────────────────────────────
// Offers
// ───────────────────────────────────────────────────────────────────

/// Terminal-or-not state of an offer, derived from its two flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferStatus {
    Pending,
    Accepted,
    Cancelled,
}

/// Transition a participant may request on a pending offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OfferAction {
    #[serde(rename = "accepted")]
    Accept,
    #[serde(rename = "cancelled")]
    Cancel,
}

impl OfferAction {
    /// Name used by the gateway's `type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferAction::Accept => "accepted",
            OfferAction::Cancel => "cancelled",
        }
    }
}

/// Price/delivery proposal embedded in a chat message.
///
/// `accepted` and `cancelled` are mutually exclusive; once either is set
/// the offer is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    pub gig_title: String,
    /// Price in whole currency units.
    pub price: u64,
    pub description: String,
    pub delivery_in_days: u32,
    #[serde(default)]
    pub old_delivery_date: Option<String>,
    #[serde(default)]
    pub new_delivery_date: Option<String>,
    #[serde(default)]
    pub accepted: bool,
    #[serde(default)]
    pub cancelled: bool,
}

impl Offer {
    /// Current status. A malformed offer with both flags set reads as accepted.
    pub fn status(&self) -> OfferStatus {
        if self.accepted {
            OfferStatus::Accepted
        } else if self.cancelled {
            OfferStatus::Cancelled
        } else {
            OfferStatus::Pending
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status() != OfferStatus::Pending
    }

    /// Take `newer` but keep our terminal flags if we are already resolved.
    fn absorb(&mut self, newer: Offer) {
        let status = self.status();
        *self = newer;
        match status {
            OfferStatus::Accepted => {
                self.accepted = true;
                self.cancelled = false;
            }
            OfferStatus::Cancelled => {
                self.accepted = false;
                self.cancelled = true;
            }
            OfferStatus::Pending => {
                // Normalize a malformed double-flag write to accepted.
                if self.accepted {
                    self.cancelled = false;
                }
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Messages
// ───────────────────────────────────────────────────────────────────

/// One chat message as stored and as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_username: String,
    pub receiver_username: String,
    #[serde(default)]
    pub sender_picture: Option<String>,
    #[serde(default)]
    pub receiver_picture: Option<String>,
    /// `None` for attachment-only messages.
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub offer: Option<Offer>,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Total order inside a conversation: `(created_at, id)`.
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }

    /// Unread and addressed to `username`.
    pub fn is_unread_for(&self, username: &str) -> bool {
        !self.is_read && self.receiver_username == username
    }

    /// Client-generated optimistic placeholder.
    pub fn is_placeholder(&self) -> bool {
        self.id.starts_with(LOCAL_MESSAGE_PREFIX)
    }

    /// Replace our contents with a newer write of the same message.
    ///
    /// Last write wins for every field except the monotone ones: `is_read`
    /// never goes back to false, a resolved offer stays resolved, and an
    /// update that omits the offer keeps the one we have.
    pub fn absorb(&mut self, newer: Message) {
        let was_read = self.is_read;
        let previous_offer = self.offer.take();
        *self = newer;
        self.is_read |= was_read;
        self.offer = match (previous_offer, self.offer.take()) {
            (Some(mut old), Some(new)) => {
                old.absorb(new);
                Some(old)
            }
            (Some(old), None) => Some(old),
            (None, new) => new,
        };
    }
}

/// Order-lifecycle notification pushed on the `order notification` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderNotification {
    pub id: String,
    pub order_id: String,
    pub sender_username: String,
    pub receiver_username: String,
    pub message: String,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl OrderNotification {
    pub fn is_unread_for(&self, username: &str) -> bool {
        !self.is_read && self.receiver_username == username
    }
}

// ───────────────────────────────────────────────────────────────────
// Projections
// ───────────────────────────────────────────────────────────────────

/// Conversation list row: the latest message plus an unread badge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationListEntry {
    pub conversation_id: ConversationId,
    pub last_message: Message,
    /// Some message in this conversation is unread and addressed to the local user.
    pub unread: bool,
}

impl ConversationListEntry {
    pub fn new(last_message: Message, unread: bool) -> Self {
        Self {
            conversation_id: last_message.conversation_id.clone(),
            last_message,
            unread,
        }
    }

    /// Timestamp the list is sorted by.
    pub fn latest_at(&self) -> DateTime<Utc> {
        self.last_message.created_at
    }

    /// The participant that is not `local_user`.
    pub fn counterpart(&self, local_user: &str) -> &str {
        if self.last_message.sender_username == local_user {
            &self.last_message.receiver_username
        } else {
            &self.last_message.sender_username
        }
    }
}

/// Global badge flags, always derived from the stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationState {
    pub has_unread_message: bool,
    pub has_unread_notification: bool,
}

/// What the caller wants to send; the engine turns it into a placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    /// `None` when no conversation with the receiver exists yet.
    pub conversation_id: Option<ConversationId>,
    pub receiver_username: String,
    pub receiver_picture: Option<String>,
    pub body: Option<String>,
    pub attachment: Option<OutgoingAttachment>,
    pub offer: Option<Offer>,
}

impl MessageDraft {
    /// Plain text draft.
    pub fn text(
        conversation_id: Option<ConversationId>,
        receiver_username: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            receiver_username: receiver_username.into(),
            receiver_picture: None,
            body: Some(body.into()),
            attachment: None,
            offer: None,
        }
    }
}
