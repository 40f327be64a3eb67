//! Persistent subscription trie
//!
//! Nodes are immutable and shared through `Arc`. A mutation copies only the
//! nodes along the path it touches and publishes the new root with a
//! compare-and-swap; on conflict the new path is discarded and the mutation
//! is replayed against the root that won. Readers load the root once and
//! traverse that snapshot without taking any lock.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use arc_swap::ArcSwap;
use smallvec::SmallVec;
use tracing::debug;

use super::token::{parse_filter, parse_topic, Token};
use super::TopicError;

/// Subscription identity anchored in the trie
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientTopic {
    pub client_id: Arc<str>,
    pub filter: Arc<str>,
}

impl ClientTopic {
    pub fn new(client_id: impl Into<Arc<str>>, filter: impl Into<Arc<str>>) -> Self {
        Self {
            client_id: client_id.into(),
            filter: filter.into(),
        }
    }
}

/// Identities collected by a single lookup
pub type Matches = SmallVec<[ClientTopic; 8]>;

/// Immutable trie node
#[derive(Debug, Clone, Default)]
pub struct TrieNode {
    /// Token leading to this node; `None` only at the root
    token: Option<Token>,
    children: BTreeMap<Token, Arc<TrieNode>>,
    /// Identities whose filter ends exactly here (set semantics)
    subscriptions: SmallVec<[ClientTopic; 2]>,
}

impl TrieNode {
    fn with_token(token: Token) -> Self {
        Self {
            token: Some(token),
            ..Default::default()
        }
    }

    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    pub fn subscriptions(&self) -> &[ClientTopic] {
        &self.subscriptions
    }

    pub fn children(&self) -> impl Iterator<Item = &Arc<TrieNode>> {
        self.children.values()
    }

    fn is_empty(&self) -> bool {
        self.subscriptions.is_empty() && self.children.is_empty()
    }

    /// Count of identities in this subtree
    pub fn len(&self) -> usize {
        self.subscriptions.len() + self.children.values().map(|c| c.len()).sum::<usize>()
    }

    /// Copy of this node with `identity` attached at the end of `tokens`.
    /// `None` when the identity is already present.
    fn with_added(&self, tokens: &[Token], identity: &ClientTopic) -> Option<TrieNode> {
        let mut copy = self.clone();
        match tokens.split_first() {
            None => {
                if self.subscriptions.contains(identity) {
                    return None;
                }
                copy.subscriptions.push(identity.clone());
            }
            Some((head, tail)) => {
                let child = match self.children.get(head) {
                    Some(child) => child.with_added(tail, identity)?,
                    None => TrieNode::with_token(head.clone()).with_added(tail, identity)?,
                };
                copy.children.insert(head.clone(), Arc::new(child));
            }
        }
        Some(copy)
    }

    /// Copy of this node with `identity` detached from the end of `tokens`.
    /// Outer `None`: identity absent. Inner `None`: this node became empty.
    fn with_removed(&self, tokens: &[Token], identity: &ClientTopic) -> Option<Option<TrieNode>> {
        let mut copy = self.clone();
        match tokens.split_first() {
            None => {
                let pos = self.subscriptions.iter().position(|s| s == identity)?;
                copy.subscriptions.remove(pos);
            }
            Some((head, tail)) => match self.children.get(head)?.with_removed(tail, identity)? {
                Some(child) => {
                    copy.children.insert(head.clone(), Arc::new(child));
                }
                None => {
                    copy.children.remove(head);
                }
            },
        }
        Some((!copy.is_empty() || copy.token.is_none()).then_some(copy))
    }

    /// Subtree without any identity of `client_id`. `None` if nothing changed.
    fn without_client(&self, client_id: &str) -> Option<TrieNode> {
        let mut changed = false;
        let mut copy = TrieNode {
            token: self.token.clone(),
            children: BTreeMap::new(),
            subscriptions: self
                .subscriptions
                .iter()
                .filter(|s| &*s.client_id != client_id)
                .cloned()
                .collect(),
        };
        changed |= copy.subscriptions.len() != self.subscriptions.len();

        for (token, child) in &self.children {
            match child.without_client(client_id) {
                // untouched subtree is shared, not copied
                None => {
                    copy.children.insert(token.clone(), Arc::clone(child));
                }
                Some(pruned) => {
                    changed = true;
                    if !pruned.is_empty() {
                        copy.children.insert(token.clone(), Arc::new(pruned));
                    }
                }
            }
        }

        changed.then_some(copy)
    }

    fn collect(&self, tokens: &[Token], out: &mut Matches) {
        if let Some(multi) = self.children.get(&Token::MultiLevel) {
            out.extend(multi.subscriptions.iter().cloned());
        }
        match tokens.split_first() {
            None => out.extend(self.subscriptions.iter().cloned()),
            Some((head, tail)) => {
                if let Some(child) = self.children.get(head) {
                    child.collect(tail, out);
                }
                if let Some(single) = self.children.get(&Token::SingleLevel) {
                    single.collect(tail, out);
                }
            }
        }
    }

    fn dump_into(&self, depth: usize, out: &mut String) {
        let indent = "\t".repeat(depth);
        let _ = match &self.token {
            Some(token) => writeln!(out, "{}[{}]", indent, token),
            None => writeln!(out, "<root>"),
        };
        for sub in &self.subscriptions {
            let _ = writeln!(out, "{}  {} -> {}", indent, sub.client_id, sub.filter);
        }
        for child in self.children.values() {
            child.dump_into(depth + 1, out);
        }
    }
}

/// Lock-free, copy-on-write subscription trie
#[derive(Debug)]
pub struct SubscriptionTrie {
    root: ArcSwap<TrieNode>,
}

impl Default for SubscriptionTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionTrie {
    pub fn new() -> Self {
        Self {
            root: ArcSwap::from_pointee(TrieNode::default()),
        }
    }

    /// Current root; stays valid and unchanged for as long as it is held
    pub fn snapshot(&self) -> Arc<TrieNode> {
        self.root.load_full()
    }

    /// Apply `mutate` to the current root until the result commits.
    /// `mutate` returns `None` when there is nothing to change.
    fn commit<F>(&self, op: &'static str, mut mutate: F) -> bool
    where
        F: FnMut(&TrieNode) -> Option<TrieNode>,
    {
        loop {
            let current = self.root.load_full();
            let Some(new_root) = mutate(&*current) else {
                return false;
            };
            let prev = self.root.compare_and_swap(&current, Arc::new(new_root));
            if Arc::ptr_eq(&*prev, &current) {
                return true;
            }
            debug!("trie {} lost a concurrent update, retrying", op);
        }
    }

    /// Attach `identity` at the path of its filter
    pub fn add(&self, identity: &ClientTopic) -> Result<(), TopicError> {
        let tokens = parse_filter(&identity.filter)?;
        if self.commit("add", |root| root.with_added(&tokens, identity)) {
            debug!(client_id = %identity.client_id, filter = %identity.filter, "subscription added");
        }
        Ok(())
    }

    /// Detach the identity `(client_id, filter)`, pruning emptied nodes.
    /// Returns whether it was present.
    pub fn remove(&self, filter: &str, client_id: &str) -> Result<bool, TopicError> {
        let tokens = parse_filter(filter)?;
        let identity = ClientTopic::new(client_id, filter);
        let removed = self.commit("remove", |root| {
            root.with_removed(&tokens, &identity)
                .map(|node| node.unwrap_or_default())
        });
        if removed {
            debug!(client_id, filter, "subscription removed");
        }
        Ok(removed)
    }

    /// Detach every identity of `client_id`
    pub fn remove_all_for_client(&self, client_id: &str) -> bool {
        let removed = self.commit("remove_all", |root| root.without_client(client_id));
        if removed {
            debug!(client_id, "all subscriptions removed");
        }
        removed
    }

    /// Drop every identity
    pub fn clear(&self) {
        self.root.store(Arc::new(TrieNode::default()));
    }

    /// Identities whose filter matches the concrete `topic`, possibly several
    /// per client. Runs entirely against one snapshot.
    pub fn matches(&self, topic: &str) -> Matches {
        let tokens = parse_topic(topic);
        let root = self.root.load();
        let mut out = Matches::new();
        root.collect(&tokens, &mut out);
        out
    }

    /// Number of identities
    pub fn len(&self) -> usize {
        self.root.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.load().is_empty()
    }

    /// Indented rendering of the current tree
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.root.load().dump_into(0, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::token::topic_matches_filter;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::thread;

    fn ids(trie: &SubscriptionTrie, topic: &str) -> Vec<(String, String)> {
        let mut v: Vec<_> = trie
            .matches(topic)
            .into_iter()
            .map(|m| (m.client_id.to_string(), m.filter.to_string()))
            .collect();
        v.sort();
        v
    }

    fn subscribe(trie: &SubscriptionTrie, client: &str, filter: &str) {
        trie.add(&ClientTopic::new(client, filter)).unwrap();
    }

    #[test]
    fn test_exact_match() {
        let trie = SubscriptionTrie::new();
        subscribe(&trie, "c1", "a/b");
        assert_eq!(ids(&trie, "a/b"), vec![("c1".into(), "a/b".into())]);
        assert!(ids(&trie, "a").is_empty());
        assert!(ids(&trie, "a/b/c").is_empty());
    }

    #[test]
    fn test_single_level_wildcard() {
        let trie = SubscriptionTrie::new();
        subscribe(&trie, "c1", "a/+/c");
        assert_eq!(ids(&trie, "a/x/c").len(), 1);
        assert_eq!(ids(&trie, "a//c").len(), 1);
        assert!(ids(&trie, "a/x/y/c").is_empty());
        assert!(ids(&trie, "a/c").is_empty());
    }

    #[test]
    fn test_multi_level_wildcard() {
        let trie = SubscriptionTrie::new();
        subscribe(&trie, "c1", "a/#");
        assert_eq!(ids(&trie, "a").len(), 1);
        assert_eq!(ids(&trie, "a/b").len(), 1);
        assert_eq!(ids(&trie, "a/b/c").len(), 1);
        assert!(ids(&trie, "b").is_empty());
    }

    #[test]
    fn test_root_multi_level_matches_everything() {
        let trie = SubscriptionTrie::new();
        subscribe(&trie, "c1", "#");
        for topic in ["a", "a/b", "/", "", "$SYS/x"] {
            assert_eq!(ids(&trie, topic).len(), 1, "topic {:?}", topic);
        }
    }

    #[test]
    fn test_single_level_does_not_match_parent() {
        let trie = SubscriptionTrie::new();
        subscribe(&trie, "c1", "a/+");
        assert!(ids(&trie, "a").is_empty());
        assert_eq!(ids(&trie, "a/").len(), 1);
    }

    #[test]
    fn test_empty_segments_are_distinct() {
        let trie = SubscriptionTrie::new();
        subscribe(&trie, "c1", "a//b");
        assert_eq!(ids(&trie, "a//b").len(), 1);
        assert!(ids(&trie, "a/b").is_empty());
    }

    #[test]
    fn test_invalid_filters_rejected() {
        let trie = SubscriptionTrie::new();
        assert!(trie.add(&ClientTopic::new("c1", "a/b#")).is_err());
        assert!(trie.add(&ClientTopic::new("c1", "a/+b")).is_err());
        assert!(trie.add(&ClientTopic::new("c1", "a/#/b")).is_err());
        assert!(trie.is_empty());
    }

    #[test]
    fn test_add_is_idempotent() {
        let trie = SubscriptionTrie::new();
        subscribe(&trie, "c1", "a/b");
        let before = trie.snapshot();
        subscribe(&trie, "c1", "a/b");
        assert!(Arc::ptr_eq(&before, &trie.snapshot()));
        assert_eq!(trie.len(), 1);
    }

    #[test]
    fn test_publish_wildcards_are_literal() {
        let trie = SubscriptionTrie::new();
        subscribe(&trie, "c1", "a/+");
        subscribe(&trie, "c2", "a/b");
        assert_eq!(ids(&trie, "a/#"), vec![("c1".into(), "a/+".into())]);
    }

    #[test]
    fn test_remove_prunes_nodes() {
        let trie = SubscriptionTrie::new();
        subscribe(&trie, "c1", "a/b/c");
        assert!(trie.remove("a/b/c", "c1").unwrap());
        assert!(trie.is_empty());
        assert_eq!(trie.snapshot().children().count(), 0);
    }

    #[test]
    fn test_remove_absent_keeps_root() {
        let trie = SubscriptionTrie::new();
        subscribe(&trie, "c1", "a/b");
        let before = trie.snapshot();
        assert!(!trie.remove("a/b", "c2").unwrap());
        assert!(!trie.remove("x/y", "c1").unwrap());
        assert!(Arc::ptr_eq(&before, &trie.snapshot()));
    }

    #[test]
    fn test_remove_keeps_siblings() {
        let trie = SubscriptionTrie::new();
        subscribe(&trie, "c1", "a/b");
        subscribe(&trie, "c2", "a/b");
        subscribe(&trie, "c1", "a/c");
        assert!(trie.remove("a/b", "c1").unwrap());
        assert_eq!(ids(&trie, "a/b"), vec![("c2".into(), "a/b".into())]);
        assert_eq!(ids(&trie, "a/c").len(), 1);
    }

    #[test]
    fn test_remove_all_for_client_shares_untouched_subtrees() {
        let trie = SubscriptionTrie::new();
        subscribe(&trie, "c1", "a/b");
        subscribe(&trie, "c1", "x/#");
        subscribe(&trie, "c2", "z/y");
        let untouched = trie
            .snapshot()
            .children()
            .find(|c| c.token().map(|t| t.to_string()) == Some("z".to_string()))
            .cloned()
            .unwrap();

        assert!(trie.remove_all_for_client("c1"));
        assert_eq!(trie.len(), 1);
        assert!(ids(&trie, "a/b").is_empty());

        let after = trie.snapshot();
        let z = after.children().next().unwrap();
        assert!(Arc::ptr_eq(z, &untouched));
        assert!(!trie.remove_all_for_client("c1"));
    }

    #[test]
    fn test_snapshot_is_stable() {
        let trie = SubscriptionTrie::new();
        subscribe(&trie, "c1", "a/b");
        let snapshot = trie.snapshot();
        subscribe(&trie, "c2", "a/b");
        trie.remove("a/b", "c1").unwrap();

        let mut out = Matches::new();
        snapshot.collect(&parse_topic("a/b"), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(&*out[0].client_id, "c1");
    }

    #[test]
    fn test_dump_lists_identities() {
        let trie = SubscriptionTrie::new();
        subscribe(&trie, "c1", "a/+");
        let dump = trie.dump();
        assert!(dump.contains("[a]"));
        assert!(dump.contains("[+]"));
        assert!(dump.contains("c1 -> a/+"));
    }

    #[test]
    fn test_concurrent_add_remove_linearizable() {
        let trie = Arc::new(SubscriptionTrie::new());
        // Permanent identity that concurrent writers must never lose
        subscribe(&trie, "anchor", "shared/topic");

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let trie = Arc::clone(&trie);
                thread::spawn(move || {
                    let client = format!("client-{}", t);
                    for i in 0..200 {
                        let filter = format!("shared/{}", i % 5);
                        trie.add(&ClientTopic::new(client.as_str(), filter.as_str()))
                            .unwrap();
                        trie.add(&ClientTopic::new(client.as_str(), "shared/+"))
                            .unwrap();
                        if i % 2 == 0 {
                            trie.remove(&filter, &client).unwrap();
                        }
                        assert!(trie
                            .matches("shared/topic")
                            .iter()
                            .any(|m| &*m.client_id == "anchor"));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // per thread: shared/+ plus shared/0, shared/2, shared/4 (last touched on odd i)
        assert_eq!(trie.len(), 1 + 8 * 4);
        for t in 0..8 {
            let client = format!("client-{}", t);
            assert!(trie.remove("shared/+", &client).unwrap());
        }
        assert_eq!(trie.len(), 1 + 8 * 3);
    }

    proptest! {
        #[test]
        fn trie_agrees_with_reference_matcher(
            filters in proptest::collection::vec("(a|b|\\+|)(/(a|b|\\+|))*(/#)?|#", 1..12),
            topic in "(a|b|)(/(a|b|)){0,4}",
        ) {
            let trie = SubscriptionTrie::new();
            for (i, filter) in filters.iter().enumerate() {
                trie.add(&ClientTopic::new(format!("c{}", i), filter.as_str())).unwrap();
            }
            let mut got: Vec<String> = trie.matches(&topic).into_iter().map(|m| m.client_id.to_string()).collect();
            got.sort();
            let mut expected: Vec<String> = filters
                .iter()
                .enumerate()
                .filter(|(_, f)| topic_matches_filter(&topic, f))
                .map(|(i, _)| format!("c{}", i))
                .collect();
            expected.sort();
            prop_assert_eq!(got, expected);
        }
    }
}
