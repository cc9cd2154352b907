//! Ordered, de-duplicated message collection for one conversation.
//!
//! ```text
//!   upsert(msg) ──► index: id → created_at ──► hit?  ──► absorb into entry
//!                                              miss? ──► insert at (created_at, id)
//!
//!   ordered: BTreeMap<(created_at, id), Message>   (read-back order)
//! ```
//!
//! Read-back is always sorted by `(created_at, id)`, whatever the arrival
//! order, and every id appears exactly once. Re-applying a message is a no-op.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::model::{ConversationId, Message, MessageId};

type SortKey = (DateTime<Utc>, MessageId);

/// What an upsert did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First time this id was seen.
    Inserted,
    /// Existing entry changed.
    Updated,
    /// Same content as before (duplicate delivery).
    Unchanged,
}

/// Messages of a single conversation.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    conversation_id: Option<ConversationId>,
    ordered: BTreeMap<SortKey, Message>,
    /// id → created_at of the stored copy, to locate the ordered entry.
    index: HashMap<MessageId, DateTime<Utc>>,
}

impl MessageStore {
    /// Empty store bound to no conversation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store bound to `conversation_id`.
    pub fn for_conversation(conversation_id: impl Into<ConversationId>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            ..Self::default()
        }
    }

    /// Replace the contents with a first-load page, de-duplicated and sorted.
    pub fn seed(&mut self, conversation_id: impl Into<ConversationId>, messages: Vec<Message>) {
        self.conversation_id = Some(conversation_id.into());
        self.ordered.clear();
        self.index.clear();
        for msg in messages {
            self.upsert(msg);
        }
    }

    /// Insert if `id` is unseen, otherwise merge into the existing entry.
    pub fn upsert(&mut self, message: Message) -> UpsertOutcome {
        let Some(created_at) = self.index.get(&message.id).copied() else {
            self.index.insert(message.id.clone(), message.created_at);
            self.ordered
                .insert((message.created_at, message.id.clone()), message);
            return UpsertOutcome::Inserted;
        };

        let key = (created_at, message.id.clone());
        let Some(mut existing) = self.ordered.remove(&key) else {
            // Index and map out of step; treat as a fresh insert.
            self.index.insert(message.id.clone(), message.created_at);
            self.ordered
                .insert((message.created_at, message.id.clone()), message);
            return UpsertOutcome::Inserted;
        };

        let before = existing.clone();
        existing.absorb(message);
        let outcome = if existing == before {
            UpsertOutcome::Unchanged
        } else {
            UpsertOutcome::Updated
        };

        self.index.insert(existing.id.clone(), existing.created_at);
        self.ordered
            .insert((existing.created_at, existing.id.clone()), existing);
        outcome
    }

    /// Flip `is_read` on the listed ids. Unknown ids are ignored.
    ///
    /// Returns the ids that actually changed.
    pub fn mark_read(&mut self, message_ids: &[MessageId]) -> Vec<MessageId> {
        let mut flipped = Vec::new();
        for id in message_ids {
            let Some(created_at) = self.index.get(id) else {
                continue;
            };
            if let Some(msg) = self.ordered.get_mut(&(*created_at, id.clone())) {
                if !msg.is_read {
                    msg.is_read = true;
                    flipped.push(id.clone());
                }
            }
        }
        flipped
    }

    /// Drop one message by id (placeholder swap after an authoritative send).
    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let created_at = self.index.remove(id)?;
        self.ordered.remove(&(created_at, id.to_string()))
    }

    /// Rebind the store after the service resolved a placeholder conversation id.
    pub fn set_conversation_id(&mut self, conversation_id: impl Into<ConversationId>) {
        self.conversation_id = Some(conversation_id.into());
    }

    /// Forget everything and bind to a new conversation.
    pub fn reset(&mut self, conversation_id: Option<ConversationId>) {
        self.conversation_id = conversation_id;
        self.ordered.clear();
        self.index.clear();
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        let created_at = self.index.get(id)?;
        self.ordered.get(&(*created_at, id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Messages in `(created_at, id)` order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.ordered.values()
    }

    /// Owned copy of the messages in read-back order.
    pub fn messages(&self) -> Vec<Message> {
        self.ordered.values().cloned().collect()
    }

    /// Newest message, if any.
    pub fn latest(&self) -> Option<&Message> {
        self.ordered.values().next_back()
    }

    /// Ids of unread messages addressed to `username`, oldest first.
    pub fn unread_for(&self, username: &str) -> Vec<MessageId> {
        self.ordered
            .values()
            .filter(|m| m.is_unread_for(username))
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
