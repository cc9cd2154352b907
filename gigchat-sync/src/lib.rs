//! # gigchat-sync — Conversation synchronization for the gig marketplace
//!
//! Keeps a client-side view of chat conversations consistent while history
//! fetches, live push events and the user's own optimistic sends race.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐  named JSON events  ┌──────────────┐
//! │ EventTransport │ ◄─────────────────► │  Push relay  │
//! │ (WebSocket)    │                     └──────────────┘
//! └──────┬─────────┘
//!        │ EventBridge (InboundEvent)
//!        ▼
//! ┌──────────────┐   spawned calls     ┌──────────────┐
//! │ SyncSession  │ ──────────────────► │  ChatApi     │
//! │ (dispatcher) │ ◄── completions ─── │ (HTTP)       │
//! └──────┬───────┘                     └──────────────┘
//!        │ owns
//!        ▼
//! ┌───────────────────────────────────────────────┐
//! │ ReconciliationEngine                          │
//! │  MessageStore · ConversationListStore         │
//! │  PresenceTracker · UnreadIndex · OfferHandler │
//! └──────┬────────────────────────────────────────┘
//!        │ watch
//!        ▼
//!  EngineSnapshot (UI)
//! ```
//!
//! ## Modules
//!
//! - [`model`] — Messages, offers, attachments, notifications
//! - [`message_store`] — Ordered, de-duplicated messages of the open conversation
//! - [`conversation_list`] — One row per conversation, most recent first
//! - [`presence`] — Online roster, replaced wholesale
//! - [`notifications`] — Inputs of the unread badges
//! - [`offer`] — Accept/cancel validation
//! - [`engine`] — Applies every source of change to the stores
//! - [`protocol`] — Named-event envelope codec
//! - [`transport`] — WebSocket connection with reconnect
//! - [`api`] — Request/response gateway client
//! - [`session`] — Single-task dispatcher and caller handle

pub mod api;
pub mod clock;
pub mod config;
pub mod conversation_list;
pub mod engine;
pub mod error;
pub mod message_store;
pub mod model;
pub mod notifications;
pub mod offer;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use api::{ChatApi, HistoryQuery, HttpChatApi, MarkReadRequest, MessagePayload};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ReconnectPolicy, SessionConfig};
pub use conversation_list::ConversationListStore;
pub use engine::{Applied, EngineSnapshot, HistoryPage, ReconciliationEngine, ViewContext};
pub use error::SyncError;
pub use message_store::{MessageStore, UpsertOutcome};
pub use model::{
    Attachment, AttachmentCategory, ConversationId, ConversationListEntry, Message, MessageDraft,
    MessageId, NotificationState, Offer, OfferAction, OfferStatus, OrderNotification,
    OutgoingAttachment,
};
pub use presence::PresenceTracker;
pub use protocol::{Envelope, InboundEvent, OutboundEvent, ProtocolError, ReadReceipt};
pub use session::{SentMessage, SessionHandle, SyncSession};
pub use transport::{ConnectionState, EventBridge, EventTransport};
