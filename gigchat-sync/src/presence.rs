//! Presence tracking: who is connected right now.
//!
//! ## Flow
//!
//! ```text
//! (re)connect
//!       │
//!       ▼
//! emit "getLoggedInUsers"
//!       │
//!       ▼   (server pushes a full roster)
//! "online" ["alice", "bob", …]
//!       │
//!       ▼
//! PresenceTracker::replace()   (wholesale, never a diff)
//!       │
//!       ▼
//! is_online("alice")
//! ```
//!
//! The server always sends the complete roster, so a snapshot simply
//! overwrites whatever was there before. A stale snapshot is acceptable:
//! the next one corrects it.

use std::collections::BTreeSet;

// ───────────────────────────────────────────────────────────────────
// Presence tracker
// ───────────────────────────────────────────────────────────────────

/// Set of currently connected usernames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceTracker {
    online: BTreeSet<String>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roster with a fresh snapshot.
    pub fn replace<I, S>(&mut self, usernames: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.online = usernames.into_iter().map(Into::into).collect();
    }

    /// Set membership.
    pub fn is_online(&self, username: &str) -> bool {
        self.online.contains(username)
    }

    /// Online usernames in sorted order.
    pub fn online_users(&self) -> Vec<String> {
        self.online.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.online.len()
    }

    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }
}

// ===================================================================
// Tests
// ===================================================================
