//! Subscription table
//!
//! Maps `(group, instance)` channels to the set of connections
//! subscribed there. The instance wildcard `"*"` is stored like any
//! other instance; [`SubscriptionTable::find`] folds it in at lookup
//! time.

use std::collections::{BTreeSet, HashMap};

use crate::wire::header::WILDCARD;

/// Two-part subscription key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    /// Group name
    pub group: String,
    /// Instance name, possibly the wildcard `"*"`
    pub instance: String,
}

impl ChannelKey {
    /// Create a new channel key
    pub fn new(group: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            instance: instance.into(),
        }
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.instance)
    }
}

/// Mapping from channel keys to subscriber connection ids
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    channels: HashMap<ChannelKey, Vec<u64>>,
}

impl SubscriptionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription; duplicate requests are no-ops.
    ///
    /// Returns whether the connection was newly added.
    pub fn subscribe(&mut self, key: ChannelKey, conn: u64) -> bool {
        let subscribers = self.channels.entry(key).or_default();
        if subscribers.contains(&conn) {
            return false;
        }
        subscribers.push(conn);
        true
    }

    /// Remove a subscription; returns whether the removal happened.
    pub fn unsubscribe(&mut self, key: &ChannelKey, conn: u64) -> bool {
        let Some(subscribers) = self.channels.get_mut(key) else {
            return false;
        };
        let Some(position) = subscribers.iter().position(|&id| id == conn) else {
            return false;
        };
        subscribers.remove(position);
        if subscribers.is_empty() {
            self.channels.remove(key);
        }
        true
    }

    /// Remove a connection from every channel.
    ///
    /// Returns the distinct groups it was actually removed from, so the
    /// caller can emit one `unsubscribed` notification per group even
    /// when several instances of it were subscribed.
    pub fn unsubscribe_all(&mut self, conn: u64) -> Vec<String> {
        let mut groups = BTreeSet::new();
        self.channels.retain(|key, subscribers| {
            if let Some(position) = subscribers.iter().position(|&id| id == conn) {
                subscribers.remove(position);
                groups.insert(key.group.clone());
            }
            !subscribers.is_empty()
        });
        groups.into_iter().collect()
    }

    /// Subscribers of exactly `(group, instance)`
    pub fn find_exact(&self, group: &str, instance: &str) -> Vec<u64> {
        self.channels
            .get(&ChannelKey::new(group, instance))
            .cloned()
            .unwrap_or_default()
    }

    /// Subscribers of `(group, instance)` plus `(group, "*")`, deduplicated
    pub fn find(&self, group: &str, instance: &str) -> Vec<u64> {
        let mut subscribers = self.find_exact(group, instance);
        if instance != WILDCARD {
            for id in self.find_exact(group, WILDCARD) {
                if !subscribers.contains(&id) {
                    subscribers.push(id);
                }
            }
        }
        subscribers
    }

    /// Whether any subscription for `conn` remains
    pub fn is_subscribed_anywhere(&self, conn: u64) -> bool {
        self.channels
            .values()
            .any(|subscribers| subscribers.contains(&conn))
    }
}
