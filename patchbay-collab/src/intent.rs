//! Destructive-intent tokens.
//!
//! A merge-based document cannot tell "the user deleted this item" apart
//! from "this replica never saw the item" — both arrive as the same sync
//! message. Every deletion is therefore gated behind a capability token:
//! random, scoped to exactly one item id, valid for at most ten seconds,
//! consumed exactly once. The room only honors a token it learned about
//! over the control channel from the same connection.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{unix_millis, INTENT_TTL};

/// A registered single-use deletion authorization.
#[derive(Debug, Clone)]
pub struct DeleteIntent {
    pub token: String,
    pub item_id: String,
    pub expires_at: Instant,
}

impl DeleteIntent {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Mint a fresh unguessable intent token.
pub fn mint_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// The outstanding intents of one connection.
///
/// Owned by the connection record and destroyed with it; intents never
/// authorize deletions arriving over a different connection.
#[derive(Debug, Default)]
pub struct IntentSet {
    intents: HashMap<String, DeleteIntent>,
}

impl IntentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an announced intent.
    ///
    /// `expires_at_millis` is the client's requested wall-clock deadline; it
    /// is clamped to [`INTENT_TTL`] from receipt. Already-expired intents are
    /// dropped and `false` is returned.
    pub fn register(&mut self, token: &str, item_id: &str, expires_at_millis: u64) -> bool {
        let now_wall = unix_millis();
        if expires_at_millis <= now_wall {
            return false;
        }
        let requested = Duration::from_millis(expires_at_millis - now_wall);
        let ttl = requested.min(INTENT_TTL);
        self.intents.insert(
            token.to_string(),
            DeleteIntent {
                token: token.to_string(),
                item_id: item_id.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        true
    }

    /// Consume the intent matching `token`, but only if it is unexpired and
    /// scoped to exactly `item_id`. Succeeds at most once per token.
    pub fn consume(&mut self, token: &str, item_id: &str) -> bool {
        self.prune();
        match self.intents.get(token) {
            Some(intent) if intent.item_id == item_id => {
                self.intents.remove(token);
                true
            }
            _ => false,
        }
    }

    /// Consume the first unexpired intent scoped to `item_id`, whatever its
    /// token. Covers concurrent deletes where the document's shared
    /// token field was overwritten by another replica's delete in flight;
    /// the authorization still came from this connection and names exactly
    /// the item that disappeared.
    pub fn consume_for_item(&mut self, item_id: &str) -> bool {
        self.prune();
        let token = self
            .intents
            .values()
            .find(|intent| intent.item_id == item_id)
            .map(|intent| intent.token.clone());
        match token {
            Some(token) => self.intents.remove(&token).is_some(),
            None => false,
        }
    }

    /// Drop every expired intent.
    pub fn prune(&mut self) {
        self.intents.retain(|_, intent| !intent.is_expired());
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}
