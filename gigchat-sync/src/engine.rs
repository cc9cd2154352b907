//! Reconciliation engine: the only writer of the chat stores.
//!
//! ## Architecture
//!
//! ```text
//!  history fetch ──┐
//!                  │         ┌──────────────────────────┐
//!  push events ────┼──────►  │   ReconciliationEngine   │ ──► EngineSnapshot
//!                  │         │                          │     (read-only)
//!  local sends ────┘         │  MessageStore (open)     │
//!                            │  ConversationListStore   │
//!                            │  PresenceTracker         │
//!                            │  UnreadIndex / Feed      │
//!                            │  OfferHandler            │
//!                            └──────────────────────────┘
//! ```
//!
//! Every write is an upsert keyed by message id, so the history channel and
//! the push channel may deliver the same message in any order, any number
//! of times, and converge on the same state.
//!
//! Which conversation is open is not engine state: callers pass a
//! [`ViewContext`] into every apply call.

use std::sync::Arc;

use log::{debug, warn};

use crate::api::MarkReadRequest;
use crate::clock::Clock;
use crate::conversation_list::ConversationListStore;
use crate::error::SyncError;
use crate::message_store::{MessageStore, UpsertOutcome};
use crate::model::{
    is_pending_conversation, new_pending_conversation_id, Attachment, ConversationId,
    ConversationListEntry, Message, MessageDraft, MessageId, NotificationState, OfferAction,
    OrderNotification, LOCAL_MESSAGE_PREFIX,
};
use crate::notifications::{NotificationFeed, UnreadIndex};
use crate::offer::{OfferHandler, OfferTransition};
use crate::presence::PresenceTracker;
use crate::protocol::{InboundEvent, ReadReceipt};
use crate::transport::ConnectionState;

// ───────────────────────────────────────────────────────────────────
// Context and results
// ───────────────────────────────────────────────────────────────────

/// Caller-owned view state handed to every apply call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewContext {
    pub open_conversation: Option<ConversationId>,
}

impl ViewContext {
    pub fn closed() -> Self {
        Self::default()
    }

    pub fn open(conversation_id: impl Into<ConversationId>) -> Self {
        Self {
            open_conversation: Some(conversation_id.into()),
        }
    }

    pub fn is_open(&self, conversation_id: &str) -> bool {
        self.open_conversation.as_deref() == Some(conversation_id)
    }
}

/// One page of history for a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    /// Conversation the request was made for (may be a `pending-` id).
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
}

/// What an applied event touched. The UI may use it for animation hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    MessageReceived {
        conversation_id: ConversationId,
        outcome: Option<UpsertOutcome>,
    },
    MessageUpdated {
        conversation_id: ConversationId,
        outcome: Option<UpsertOutcome>,
    },
    ConversationListUpdated {
        conversation_id: ConversationId,
    },
    ReadReceipt {
        conversation_id: ConversationId,
        flipped: usize,
    },
    Presence {
        online: usize,
    },
    OrderNotification {
        id: String,
    },
    Connection(ConnectionState),
    Reconnected,
}

/// Read-only copy of everything the presentation layer renders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub open_conversation: Option<ConversationId>,
    /// Messages of the open conversation, `(created_at, id)` order.
    pub messages: Vec<Message>,
    /// Conversation list, most recent first.
    pub conversations: Vec<ConversationListEntry>,
    pub online_users: Vec<String>,
    pub notifications: NotificationState,
    pub order_notifications: Vec<OrderNotification>,
    pub connection: ConnectionState,
}

impl EngineSnapshot {
    pub fn is_online(&self, username: &str) -> bool {
        self.online_users.iter().any(|u| u == username)
    }
}

// ───────────────────────────────────────────────────────────────────
// Engine
// ───────────────────────────────────────────────────────────────────

/// Owns the stores and applies every source of change to them.
pub struct ReconciliationEngine {
    local_user: String,
    clock: Arc<dyn Clock>,
    messages: MessageStore,
    conversations: ConversationListStore,
    presence: PresenceTracker,
    unread: UnreadIndex,
    feed: NotificationFeed,
    offers: OfferHandler,
    notification: NotificationState,
    connection: ConnectionState,
    /// Counter behind `local-<n>` placeholder ids.
    next_local_id: u64,
}

impl ReconciliationEngine {
    pub fn new(local_user: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            local_user: local_user.into(),
            clock,
            messages: MessageStore::new(),
            conversations: ConversationListStore::new(),
            presence: PresenceTracker::new(),
            unread: UnreadIndex::new(),
            feed: NotificationFeed::new(),
            offers: OfferHandler::new(),
            notification: NotificationState::default(),
            connection: ConnectionState::Disconnected,
            next_local_id: 1,
        }
    }

    // ── Push events ──────────────────────────────────────────────

    /// Apply one push event. Duplicates and reordering are absorbed.
    pub fn apply_event(&mut self, event: InboundEvent, ctx: &ViewContext) -> Applied {
        match event {
            InboundEvent::MessageReceived(msg) => {
                let conversation_id = msg.conversation_id.clone();
                let outcome = self.apply_message(msg, ctx);
                Applied::MessageReceived {
                    conversation_id,
                    outcome,
                }
            }
            // Same idempotent path as a received message.
            InboundEvent::MessageUpdated(msg) => {
                let conversation_id = msg.conversation_id.clone();
                let outcome = self.apply_message(msg, ctx);
                Applied::MessageUpdated {
                    conversation_id,
                    outcome,
                }
            }
            InboundEvent::ConversationListUpdated(msg) => {
                let conversation_id = msg.conversation_id.clone();
                self.apply_summary(msg);
                self.conversations.reorder_by_recency();
                self.recompute_unread_message();
                Applied::ConversationListUpdated { conversation_id }
            }
            InboundEvent::ReadReceipt(receipt) => {
                let conversation_id = receipt.conversation_id.clone();
                let flipped = self.apply_read_receipt(&receipt, ctx);
                Applied::ReadReceipt {
                    conversation_id,
                    flipped,
                }
            }
            InboundEvent::PresenceSnapshot(usernames) => {
                self.presence.replace(usernames);
                Applied::Presence {
                    online: self.presence.len(),
                }
            }
            InboundEvent::OrderNotification(notification) => {
                let id = notification.id.clone();
                self.feed.upsert(notification);
                self.notification.has_unread_notification =
                    self.feed.has_unread_for(&self.local_user);
                Applied::OrderNotification { id }
            }
            InboundEvent::Connection(state) => {
                if state != ConnectionState::Connected {
                    debug!("Transport {state:?}: presence and live updates paused");
                }
                self.connection = state;
                Applied::Connection(state)
            }
            InboundEvent::Reconnected => {
                debug!("Link restored after a drop");
                Applied::Reconnected
            }
        }
    }

    /// Upsert into the open store (if it is this conversation) and the list.
    fn apply_message(&mut self, msg: Message, ctx: &ViewContext) -> Option<UpsertOutcome> {
        let conversation_id = msg.conversation_id.clone();
        let unread_changed = self.unread.observe(&msg, &self.local_user);
        // Ids already read stay read, even when a stale copy says otherwise.
        let fast_unread = self.unread.is_tracked(&conversation_id, &msg.id);

        let outcome = if ctx.is_open(&conversation_id) {
            self.bind_open_store(&conversation_id);
            Some(self.messages.upsert(msg.clone()))
        } else {
            None
        };

        let unread = self.unread.has_unread(&conversation_id);
        self.conversations
            .upsert(ConversationListEntry::new(msg, unread));
        self.conversations.reorder_by_recency();

        if fast_unread {
            self.notification.has_unread_message = true;
        } else if unread_changed {
            self.recompute_unread_message();
        }
        outcome
    }

    /// Feed a summary message to the list only.
    fn apply_summary(&mut self, msg: Message) {
        self.unread.observe(&msg, &self.local_user);
        let unread = self.unread.has_unread(&msg.conversation_id);
        self.conversations
            .upsert(ConversationListEntry::new(msg, unread));
    }

    fn apply_read_receipt(&mut self, receipt: &ReadReceipt, ctx: &ViewContext) -> usize {
        let conversation_id = receipt.conversation_id.as_str();
        let flipped = if ctx.is_open(conversation_id)
            && self.messages.conversation_id() == Some(conversation_id)
        {
            self.messages.mark_read(&receipt.message_ids).len()
        } else {
            0
        };

        self.unread.clear_ids(conversation_id, &receipt.message_ids);
        self.conversations
            .mark_read(conversation_id, &receipt.message_ids);
        self.conversations
            .set_unread(conversation_id, self.unread.has_unread(conversation_id));
        self.recompute_unread_message();
        flipped
    }

    /// Make sure the open store is bound to `conversation_id`.
    fn bind_open_store(&mut self, conversation_id: &str) {
        if self.messages.conversation_id() != Some(conversation_id) {
            self.messages.reset(Some(conversation_id.to_string()));
        }
    }

    // ── History ──────────────────────────────────────────────────

    /// Rebind the open store to whatever `ctx` says is open.
    ///
    /// Called by the owner of the context right after it changes.
    pub fn sync_open_conversation(&mut self, ctx: &ViewContext) {
        match ctx.open_conversation.as_deref() {
            Some(id) => self.bind_open_store(id),
            None => self.messages.reset(None),
        }
    }

    /// Seed the open store with a history page.
    ///
    /// Pages for a conversation that is no longer open are rejected with
    /// [`SyncError::HistoryFetchStale`] and leave every store untouched.
    /// Messages that arrived live while the fetch was in flight are kept.
    /// A page fetched under a `pending-` id that turns out to belong to an
    /// existing conversation moves `ctx` to the real id.
    pub fn seed_history(
        &mut self,
        page: HistoryPage,
        ctx: &mut ViewContext,
    ) -> Result<usize, SyncError> {
        if !ctx.is_open(&page.conversation_id) {
            debug!(
                "Discarding stale history for {} (open: {:?})",
                page.conversation_id, ctx.open_conversation
            );
            return Err(SyncError::HistoryFetchStale(page.conversation_id));
        }

        let mut conversation_id = page.conversation_id.clone();
        if is_pending_conversation(&conversation_id) {
            if let Some(resolved) = page
                .messages
                .iter()
                .map(|m| m.conversation_id.as_str())
                .find(|id| !is_pending_conversation(id))
            {
                let resolved = resolved.to_string();
                self.rekey_conversation(&conversation_id, &resolved, ctx);
                conversation_id = resolved;
            }
        }

        let live: Vec<Message> = if self.messages.conversation_id() == Some(&conversation_id) {
            self.messages.messages()
        } else {
            Vec::new()
        };

        let count = page.messages.len();
        for msg in &page.messages {
            self.unread.observe(msg, &self.local_user);
        }
        self.messages.seed(conversation_id.clone(), page.messages);
        for msg in live {
            self.messages.upsert(msg);
        }

        if let Some(latest) = self.messages.latest().cloned() {
            let unread = self.unread.has_unread(&conversation_id);
            self.conversations
                .upsert(ConversationListEntry::new(latest, unread));
            self.conversations.reorder_by_recency();
        }
        self.recompute_unread_message();
        Ok(count)
    }

    /// Seed the conversation list from a summaries fetch (latest message per conversation).
    pub fn seed_conversation_list(&mut self, summaries: Vec<Message>) {
        for msg in summaries {
            self.apply_summary(msg);
        }
        self.conversations.reorder_by_recency();
        self.recompute_unread_message();
    }

    // ── Optimistic send ──────────────────────────────────────────

    /// Create the optimistic placeholder for a draft and show it immediately.
    ///
    /// Without a conversation id the draft goes to the open conversation if
    /// it is still a placeholder, otherwise to a fresh `pending-` id.
    pub fn begin_send(&mut self, draft: &MessageDraft, ctx: &ViewContext) -> Message {
        let id = format!("{LOCAL_MESSAGE_PREFIX}{}", self.next_local_id);
        self.next_local_id += 1;

        let conversation_id = draft.conversation_id.clone().unwrap_or_else(|| {
            match ctx.open_conversation.as_deref() {
                Some(open) if is_pending_conversation(open) => open.to_string(),
                _ => new_pending_conversation_id(),
            }
        });

        let placeholder = Message {
            id,
            conversation_id,
            sender_username: self.local_user.clone(),
            receiver_username: draft.receiver_username.clone(),
            sender_picture: None,
            receiver_picture: draft.receiver_picture.clone(),
            body: draft.body.clone(),
            attachment: draft.attachment.as_ref().map(|a| Attachment {
                url: String::new(),
                category: a.category,
                size: a.data.len() as u64,
                file_name: a.file_name.clone(),
            }),
            offer: draft.offer.clone(),
            is_read: false,
            created_at: self.clock.now(),
        };

        self.apply_message(placeholder.clone(), ctx);
        placeholder
    }

    /// Apply the service's answer to an optimistic send.
    ///
    /// The placeholder stays in the store until the caller discards it by id;
    /// only the conversation list summary is swapped here.
    pub fn complete_send(
        &mut self,
        placeholder: &Message,
        authoritative: Message,
        ctx: &mut ViewContext,
    ) {
        if placeholder.conversation_id != authoritative.conversation_id {
            self.rekey_conversation(
                &placeholder.conversation_id,
                &authoritative.conversation_id,
                ctx,
            );
        }
        self.conversations.replace_summary(
            &authoritative.conversation_id,
            &placeholder.id,
            authoritative.clone(),
        );
        self.apply_message(authoritative, ctx);
    }

    /// Log a failed send. The placeholder is left for the caller's error UI.
    pub fn fail_send(&mut self, placeholder: &Message, reason: &str) -> SyncError {
        warn!("Send of {} failed: {reason}", placeholder.id);
        SyncError::SendFailed {
            placeholder_id: placeholder.id.clone(),
            reason: reason.to_string(),
        }
    }

    /// Drop a message from the open store (placeholder swap).
    pub fn discard_message(&mut self, id: &str) -> Option<Message> {
        self.messages.remove(id)
    }

    fn rekey_conversation(&mut self, from: &str, to: &str, ctx: &mut ViewContext) {
        debug!("Conversation {from} resolved to {to}");
        if ctx.is_open(from) {
            ctx.open_conversation = Some(to.to_string());
            self.messages.set_conversation_id(to);
        }
        self.conversations.rekey(from, to);
        self.unread.rekey(from, to);
    }

    // ── Read state ───────────────────────────────────────────────

    /// Optimistically mark everything addressed to us in a conversation as read.
    ///
    /// Returns the request to send to the service, or `None` if nothing was unread.
    pub fn mark_conversation_read(
        &mut self,
        conversation_id: &str,
        ctx: &ViewContext,
    ) -> Option<MarkReadRequest> {
        let mut ids = self.unread.ids(conversation_id);
        if ctx.is_open(conversation_id) {
            for id in self.messages.unread_for(&self.local_user) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        if ids.is_empty() {
            return None;
        }

        let entry = self.conversations.get(conversation_id);
        let newest = self
            .messages
            .iter()
            .filter(|m| ids.contains(&m.id))
            .last()
            .map(|m| (m.id.clone(), m.sender_username.clone()));
        let (message_id, sender_username) = match (newest, entry) {
            (Some(found), _) => found,
            (None, Some(entry)) => (
                entry.last_message.id.clone(),
                entry.counterpart(&self.local_user).to_string(),
            ),
            (None, None) => (ids[0].clone(), String::new()),
        };

        self.apply_read_receipt(
            &ReadReceipt {
                conversation_id: conversation_id.to_string(),
                message_ids: ids,
            },
            ctx,
        );

        Some(MarkReadRequest {
            receiver_username: self.local_user.clone(),
            sender_username,
            message_id,
        })
    }

    /// Mark one order notification read locally. False for unknown ids.
    pub fn mark_notification_read(&mut self, id: &str) -> bool {
        let known = self.feed.mark_read(id);
        self.notification.has_unread_notification = self.feed.has_unread_for(&self.local_user);
        known
    }

    /// Full fold over the conversation list.
    fn recompute_unread_message(&mut self) {
        self.notification.has_unread_message = self.conversations.any_unread();
    }

    /// Recompute both badge flags from scratch.
    pub fn recompute_notifications(&mut self) -> NotificationState {
        self.recompute_unread_message();
        self.notification.has_unread_notification = self.feed.has_unread_for(&self.local_user);
        self.notification
    }

    // ── Offers ───────────────────────────────────────────────────

    /// Validate an accept/cancel against the open conversation and mark it in flight.
    pub fn begin_offer_transition(
        &mut self,
        message_id: &str,
        action: OfferAction,
    ) -> Result<OfferTransition, SyncError> {
        self.offers.begin(&self.messages, message_id, action)
    }

    /// The service answered an offer transition.
    pub fn finish_offer_transition(&mut self, message_id: &str) {
        self.offers.finish(message_id);
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub fn conversations(&self) -> &ConversationListStore {
        &self.conversations
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.presence.is_online(username)
    }

    pub fn notification_state(&self) -> NotificationState {
        self.notification
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn unread_ids(&self, conversation_id: &str) -> Vec<MessageId> {
        self.unread.ids(conversation_id)
    }

    /// Copy of everything renderable.
    pub fn snapshot(&self, ctx: &ViewContext) -> EngineSnapshot {
        let messages = match ctx.open_conversation.as_deref() {
            Some(id) if self.messages.conversation_id() == Some(id) => self.messages.messages(),
            _ => Vec::new(),
        };
        EngineSnapshot {
            open_conversation: ctx.open_conversation.clone(),
            messages,
            conversations: self.conversations.entries().to_vec(),
            online_users: self.presence.online_users(),
            notifications: self.notification,
            order_notifications: self.feed.items(),
            connection: self.connection,
        }
    }
}
