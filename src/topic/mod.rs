//! Topic matching and subscription management
//!
//! - [`token`] splits topics and filters into segments
//! - [`trie::SubscriptionTrie`] holds `(client, filter)` identities in a
//!   persistent tree with lock-free reads and CAS-committed writes
//! - [`SubscriptionStore`] resolves each matched identity's QoS through the
//!   session layer and collapses multiple matches per client
//!
//! The trie never caches QoS: a subscription's requested QoS lives with the
//! owning session and is read at match time.

pub mod token;
pub mod trie;

pub use token::{parse_filter, parse_topic, topic_matches_filter, Token};
pub use trie::{ClientTopic, SubscriptionTrie, TrieNode};

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use tracing::{debug, warn};

use crate::protocol::QoS;

/// Errors raised for topic filters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    InvalidFilter(&'static str),
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFilter(msg) => write!(f, "invalid topic filter: {}", msg),
        }
    }
}

impl std::error::Error for TopicError {}

/// A resolved subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub client_id: Arc<str>,
    pub filter: Arc<str>,
    pub qos: QoS,
}

/// Source of truth for per-client subscriptions (the session store)
pub trait SubscriptionLookup: Send + Sync {
    /// Requested QoS of `client_id`'s subscription to `filter`, if it still exists
    fn subscription_qos(&self, client_id: &str, filter: &str) -> Option<QoS>;

    /// Every `(client, filter)` pair currently recorded
    fn all_subscriptions(&self) -> Vec<ClientTopic>;
}

/// Subscription trie plus QoS resolution
pub struct SubscriptionStore {
    trie: SubscriptionTrie,
    lookup: Arc<dyn SubscriptionLookup>,
}

impl SubscriptionStore {
    pub fn new(lookup: Arc<dyn SubscriptionLookup>) -> Self {
        Self {
            trie: SubscriptionTrie::new(),
            lookup,
        }
    }

    pub fn trie(&self) -> &SubscriptionTrie {
        &self.trie
    }

    pub fn add(&self, identity: &ClientTopic) -> Result<(), TopicError> {
        self.trie.add(identity)
    }

    pub fn remove(&self, filter: &str, client_id: &str) -> Result<bool, TopicError> {
        self.trie.remove(filter, client_id)
    }

    pub fn remove_all_for_client(&self, client_id: &str) -> bool {
        self.trie.remove_all_for_client(client_id)
    }

    /// Subscribers for a published `topic`: at most one entry per client,
    /// carrying the highest QoS among that client's matching filters.
    /// Identities whose subscription vanished from the session layer are
    /// skipped.
    pub fn matches(&self, topic: &str) -> Vec<Subscription> {
        let identities = self.trie.matches(topic);
        let mut by_client: AHashMap<Arc<str>, Subscription> =
            AHashMap::with_capacity(identities.len());

        for identity in identities {
            let Some(qos) = self
                .lookup
                .subscription_qos(&identity.client_id, &identity.filter)
            else {
                debug!(
                    client_id = %identity.client_id,
                    filter = %identity.filter,
                    "matched subscription no longer exists, skipping"
                );
                continue;
            };

            by_client
                .entry(Arc::clone(&identity.client_id))
                .and_modify(|existing| {
                    if qos > existing.qos {
                        existing.qos = qos;
                        existing.filter = Arc::clone(&identity.filter);
                    }
                })
                .or_insert(Subscription {
                    client_id: identity.client_id,
                    filter: identity.filter,
                    qos,
                });
        }

        by_client.into_values().collect()
    }

    /// Rebuild the trie from the session layer (startup after reload)
    pub fn reload(&self) {
        self.trie.clear();
        let mut count = 0;
        for identity in self.lookup.all_subscriptions() {
            match self.trie.add(&identity) {
                Ok(()) => count += 1,
                Err(e) => warn!(
                    client_id = %identity.client_id,
                    filter = %identity.filter,
                    "dropping stored subscription: {}",
                    e
                ),
            }
        }
        debug!("subscription trie rebuilt with {} entries", count);
    }

    pub fn len(&self) -> usize {
        self.trie.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct StaticLookup {
        subs: DashMap<(String, String), QoS>,
    }

    impl StaticLookup {
        fn set(&self, client: &str, filter: &str, qos: QoS) {
            self.subs.insert((client.to_string(), filter.to_string()), qos);
        }
    }

    impl SubscriptionLookup for StaticLookup {
        fn subscription_qos(&self, client_id: &str, filter: &str) -> Option<QoS> {
            self.subs
                .get(&(client_id.to_string(), filter.to_string()))
                .map(|q| *q)
        }

        fn all_subscriptions(&self) -> Vec<ClientTopic> {
            self.subs
                .iter()
                .map(|e| ClientTopic::new(e.key().0.as_str(), e.key().1.as_str()))
                .collect()
        }
    }

    fn store_with(entries: &[(&str, &str, QoS)]) -> (Arc<StaticLookup>, SubscriptionStore) {
        let lookup = Arc::new(StaticLookup::default());
        let store = SubscriptionStore::new(lookup.clone());
        for (client, filter, qos) in entries {
            lookup.set(client, filter, *qos);
            store.add(&ClientTopic::new(*client, *filter)).unwrap();
        }
        (lookup, store)
    }

    #[test]
    fn test_dedup_keeps_highest_qos() {
        let (_, store) = store_with(&[
            ("c1", "a/+", QoS::AtMostOnce),
            ("c1", "a/#", QoS::ExactlyOnce),
            ("c1", "a/b", QoS::AtLeastOnce),
        ]);
        let matched = store.matches("a/b");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].qos, QoS::ExactlyOnce);
        assert_eq!(&*matched[0].filter, "a/#");
    }

    #[test]
    fn test_one_entry_per_client() {
        let (_, store) = store_with(&[
            ("c1", "a/+", QoS::AtLeastOnce),
            ("c2", "a/b", QoS::AtMostOnce),
            ("c2", "#", QoS::AtLeastOnce),
        ]);
        let mut matched = store.matches("a/b");
        matched.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        assert_eq!(matched.len(), 2);
        assert_eq!(&*matched[0].client_id, "c1");
        assert_eq!(matched[1].qos, QoS::AtLeastOnce);
    }

    #[test]
    fn test_qos_read_at_match_time() {
        let (lookup, store) = store_with(&[("c1", "a/b", QoS::AtMostOnce)]);
        lookup.set("c1", "a/b", QoS::ExactlyOnce);
        assert_eq!(store.matches("a/b")[0].qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_vanished_subscription_skipped() {
        let (lookup, store) = store_with(&[("c1", "a/b", QoS::AtLeastOnce)]);
        lookup.subs.clear();
        assert!(store.matches("a/b").is_empty());
    }

    #[test]
    fn test_reload_rebuilds_from_lookup() {
        let lookup = Arc::new(StaticLookup::default());
        lookup.set("c1", "sensors/+/temp", QoS::AtLeastOnce);
        lookup.set("c2", "bad/#/filter", QoS::AtLeastOnce);
        let store = SubscriptionStore::new(lookup.clone());
        store.reload();
        assert_eq!(store.len(), 1);
        assert_eq!(store.matches("sensors/kitchen/temp").len(), 1);
    }
}
