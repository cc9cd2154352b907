//! Inputs of the global badge flags.
//!
//! `NotificationState` is never stored authoritatively: it is folded from
//! the per-conversation unread sets and the order-notification feed.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::model::{ConversationId, Message, MessageId, OrderNotification};

/// Unread messages addressed to the local user, grouped by conversation.
///
/// Fed from every source that shows us a message (history page, list
/// summary, live event), so the badge of a conversation that is not open
/// is still exact. Ids once seen read are remembered and never tracked
/// again, whatever order the sources arrive in.
#[derive(Debug, Clone, Default)]
pub struct UnreadIndex {
    by_conversation: HashMap<ConversationId, HashSet<MessageId>>,
    read: HashMap<ConversationId, HashSet<MessageId>>,
}

impl UnreadIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track or untrack one message. Returns true when the set changed.
    pub fn observe(&mut self, message: &Message, local_user: &str) -> bool {
        if message.is_read {
            self.remember_read(&message.conversation_id, std::slice::from_ref(&message.id));
        }
        if message.is_unread_for(local_user)
            && !self.is_known_read(&message.conversation_id, &message.id)
        {
            self.by_conversation
                .entry(message.conversation_id.clone())
                .or_default()
                .insert(message.id.clone())
        } else {
            self.forget(&message.conversation_id, &message.id)
        }
    }

    /// Drop the listed ids (read receipt) and remember them as read.
    pub fn clear_ids(&mut self, conversation_id: &str, message_ids: &[MessageId]) -> bool {
        self.remember_read(conversation_id, message_ids);
        let Some(set) = self.by_conversation.get_mut(conversation_id) else {
            return false;
        };
        let before = set.len();
        for id in message_ids {
            set.remove(id);
        }
        before != set.len()
    }

    /// Drop one id, wherever it is tracked under `conversation_id`.
    pub fn forget(&mut self, conversation_id: &str, message_id: &str) -> bool {
        self.by_conversation
            .get_mut(conversation_id)
            .is_some_and(|set| set.remove(message_id))
    }

    fn remember_read(&mut self, conversation_id: &str, message_ids: &[MessageId]) {
        self.read
            .entry(conversation_id.to_string())
            .or_default()
            .extend(message_ids.iter().cloned());
    }

    /// The id was read at some point this session.
    pub fn is_known_read(&self, conversation_id: &str, message_id: &str) -> bool {
        self.read
            .get(conversation_id)
            .is_some_and(|set| set.contains(message_id))
    }

    /// Currently counted as unread.
    pub fn is_tracked(&self, conversation_id: &str, message_id: &str) -> bool {
        self.by_conversation
            .get(conversation_id)
            .is_some_and(|set| set.contains(message_id))
    }

    /// Move ids tracked under a placeholder conversation to the real one.
    pub fn rekey(&mut self, from: &str, to: &str) {
        for map in [&mut self.by_conversation, &mut self.read] {
            if let Some(ids) = map.remove(from) {
                map.entry(to.to_string()).or_default().extend(ids);
            }
        }
    }

    pub fn has_unread(&self, conversation_id: &str) -> bool {
        self.by_conversation
            .get(conversation_id)
            .is_some_and(|set| !set.is_empty())
    }

    /// Tracked ids of one conversation, sorted.
    pub fn ids(&self, conversation_id: &str) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self
            .by_conversation
            .get(conversation_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

/// Order notifications seen this session, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct NotificationFeed {
    items: BTreeMap<String, OrderNotification>,
}

impl NotificationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by id. A notification already read stays read.
    pub fn upsert(&mut self, notification: OrderNotification) {
        match self.items.get_mut(&notification.id) {
            Some(existing) => {
                let was_read = existing.is_read;
                *existing = notification;
                existing.is_read |= was_read;
            }
            None => {
                self.items.insert(notification.id.clone(), notification);
            }
        }
    }

    /// Returns false for unknown ids.
    pub fn mark_read(&mut self, id: &str) -> bool {
        match self.items.get_mut(id) {
            Some(item) => {
                item.is_read = true;
                true
            }
            None => false,
        }
    }

    /// Fold: any unread notification addressed to `local_user`.
    pub fn has_unread_for(&self, local_user: &str) -> bool {
        self.items.values().any(|n| n.is_unread_for(local_user))
    }

    /// Newest first.
    pub fn items(&self) -> Vec<OrderNotification> {
        let mut items: Vec<_> = self.items.values().cloned().collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
