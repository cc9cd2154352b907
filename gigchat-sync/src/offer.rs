//! Accept/cancel handshake for offers embedded in messages.
//!
//! ```text
//!   Pending ──accept──► Accepted   (terminal)
//!      │
//!      └────cancel───► Cancelled  (terminal)
//! ```
//!
//! The handler only validates and issues transitions. The new state lands
//! through the `message updated` event like any other message write, so the
//! engine keeps a single write path.

use std::collections::HashMap;

use crate::error::SyncError;
use crate::message_store::MessageStore;
use crate::model::{MessageId, OfferAction};

/// A validated transition ready to be sent to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferTransition {
    pub message_id: MessageId,
    pub action: OfferAction,
}

/// Tracks transitions waiting on the service.
#[derive(Debug, Clone, Default)]
pub struct OfferHandler {
    in_flight: HashMap<MessageId, OfferAction>,
}

impl OfferHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a transition against the current state of `store`.
    pub fn check(&self, store: &MessageStore, message_id: &str) -> Result<(), SyncError> {
        let message = store
            .get(message_id)
            .ok_or_else(|| SyncError::UnknownMessage(message_id.to_string()))?;
        let offer = message
            .offer
            .as_ref()
            .ok_or_else(|| SyncError::NoOffer(message_id.to_string()))?;
        if offer.is_resolved() {
            return Err(SyncError::OfferAlreadyResolved(message_id.to_string()));
        }
        if self.in_flight.contains_key(message_id) {
            return Err(SyncError::OfferTransitionInFlight(message_id.to_string()));
        }
        Ok(())
    }

    /// Validate and mark the transition as in flight.
    pub fn begin(
        &mut self,
        store: &MessageStore,
        message_id: &str,
        action: OfferAction,
    ) -> Result<OfferTransition, SyncError> {
        self.check(store, message_id)?;
        self.in_flight.insert(message_id.to_string(), action);
        Ok(OfferTransition {
            message_id: message_id.to_string(),
            action,
        })
    }

    /// The service answered (either way); allow new requests for this message.
    pub fn finish(&mut self, message_id: &str) -> Option<OfferAction> {
        self.in_flight.remove(message_id)
    }
}
