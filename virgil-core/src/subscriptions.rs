//! Registry of which peers want status updates for which channels.

use std::collections::BTreeMap;

use virgil_types::ChannelKey;

/// Maps a channel key to the ordered set of peer names subscribed to its
/// status updates. Keyed by logical peer name, never by socket identity.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscribers: BTreeMap<ChannelKey, Vec<String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber. Duplicate adds are no-ops. Returns true if the
    /// peer was newly added.
    pub fn add(&mut self, key: &ChannelKey, peer: &str) -> bool {
        let entry = self.subscribers.entry(key.clone()).or_default();
        if entry.iter().any(|p| p == peer) {
            false
        } else {
            entry.push(peer.to_string());
            true
        }
    }

    /// Remove a subscriber. Returns true if the peer was present.
    /// Emptied entries are left in place.
    pub fn remove(&mut self, key: &ChannelKey, peer: &str) -> bool {
        match self.subscribers.get_mut(key) {
            Some(entry) => {
                let before = entry.len();
                entry.retain(|p| p != peer);
                entry.len() != before
            }
            None => false,
        }
    }

    pub fn subscribers(&self, key: &ChannelKey) -> &[String] {
        self.subscribers.get(key).map_or(&[], Vec::as_slice)
    }

    pub fn is_subscribed(&self, key: &ChannelKey, peer: &str) -> bool {
        self.subscribers(key).iter().any(|p| p == peer)
    }
}
