//! One row per conversation, most recent first.
//!
//! Rows are created on first sight of a conversation (history fetch or live
//! event) and never removed during a session: remote deletion is not
//! observed by this client.

use crate::model::{ConversationId, ConversationListEntry, Message, MessageId};

/// Conversation list projection.
#[derive(Debug, Clone, Default)]
pub struct ConversationListStore {
    entries: Vec<ConversationListEntry>,
}

impl ConversationListStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or merge a row keyed by `conversation_id`.
    ///
    /// The row keeps whichever message is newest by `(created_at, id)`; a
    /// write for the message it already shows is merged into it. `unread`
    /// always takes the incoming value. Position is untouched until
    /// [`reorder_by_recency`](Self::reorder_by_recency).
    pub fn upsert(&mut self, entry: ConversationListEntry) {
        let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.conversation_id == entry.conversation_id)
        else {
            self.entries.push(entry);
            return;
        };

        existing.unread = entry.unread;
        if existing.last_message.id == entry.last_message.id {
            existing.last_message.absorb(entry.last_message);
        } else if entry.last_message.sort_key() > existing.last_message.sort_key() {
            existing.last_message = entry.last_message;
        }
    }

    /// Stable sort, newest first; equal timestamps order by conversation id.
    pub fn reorder_by_recency(&mut self) {
        self.entries.sort_by(|a, b| {
            b.latest_at()
                .cmp(&a.latest_at())
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });
    }

    /// Overwrite the unread badge of one row. Returns false for unknown rows.
    pub fn set_unread(&mut self, conversation_id: &str, unread: bool) -> bool {
        match self.get_mut(conversation_id) {
            Some(entry) => {
                entry.unread = unread;
                true
            }
            None => false,
        }
    }

    /// Reflect a read receipt on the row's summary message.
    pub fn mark_read(&mut self, conversation_id: &str, message_ids: &[MessageId]) {
        if let Some(entry) = self.get_mut(conversation_id) {
            if message_ids.contains(&entry.last_message.id) {
                entry.last_message.is_read = true;
            }
        }
    }

    /// Move a row from a placeholder id to the id the service assigned.
    ///
    /// If a row for `to` already exists the two are merged.
    pub fn rekey(&mut self, from: &str, to: &str) {
        let Some(pos) = self.entries.iter().position(|e| e.conversation_id == from) else {
            return;
        };
        let mut entry = self.entries.remove(pos);
        entry.conversation_id = to.to_string();
        entry.last_message.conversation_id = to.to_string();
        self.upsert(entry);
    }

    /// Swap the row's summary if it still shows `stale_id` (placeholder echo).
    pub fn replace_summary(&mut self, conversation_id: &str, stale_id: &str, message: Message) {
        if let Some(entry) = self.get_mut(conversation_id) {
            if entry.last_message.id == stale_id {
                entry.last_message = message;
            }
        }
    }

    pub fn get(&self, conversation_id: &str) -> Option<&ConversationListEntry> {
        self.entries
            .iter()
            .find(|e| e.conversation_id == conversation_id)
    }

    fn get_mut(&mut self, conversation_id: &str) -> Option<&mut ConversationListEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.conversation_id == conversation_id)
    }

    /// Rows in display order.
    pub fn entries(&self) -> &[ConversationListEntry] {
        &self.entries
    }

    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        self.entries
            .iter()
            .map(|e| e.conversation_id.clone())
            .collect()
    }

    /// Fold: at least one row shows an unread badge.
    pub fn any_unread(&self) -> bool {
        self.entries.iter().any(|e| e.unread)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
