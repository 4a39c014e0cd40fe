//! Topic subscription tree with trie-based wildcard matching and
//! retained-message storage.
//!
//! Each edge is one `/`-separated topic level. `+` and `#` subscriptions
//! live in dedicated child slots rather than the literal child map, so a
//! literal level named e.g. `+` can never collide with a wildcard.
//!
//! Topics whose first level starts with `$` are never matched by `+` or `#`
//! at the root (MQTT-4.7.2-1); this keeps `$SYS/*` out of blanket `#`
//! subscriptions.

use ahash::AHashMap;
use bytes::Bytes;

use crate::packet::QoS;

/// A retained message, stored at its exact topic node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

#[derive(Default)]
struct TopicNode {
    /// Literal child levels.
    children: AHashMap<String, TopicNode>,
    /// `+` single-level wildcard child.
    plus: Option<Box<TopicNode>>,
    /// `#` multi-level wildcard child (always terminal).
    hash: Option<Box<TopicNode>>,
    /// Subscribers whose filter ends at this node.
    subscribers: AHashMap<String, QoS>,
    /// Retained message for this exact topic.
    retained: Option<RetainedMessage>,
}

impl TopicNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty()
            && self.plus.is_none()
            && self.hash.is_none()
            && self.subscribers.is_empty()
            && self.retained.is_none()
    }

    fn insert(&mut self, levels: &[&str], client_id: &str, qos: QoS) {
        let Some((level, remaining)) = levels.split_first() else {
            // Terminal: replace any existing grant for this client
            self.subscribers.insert(client_id.to_string(), qos);
            return;
        };

        match *level {
            "#" => {
                let child = self.hash.get_or_insert_with(Default::default);
                child.subscribers.insert(client_id.to_string(), qos);
            }
            "+" => {
                let child = self.plus.get_or_insert_with(Default::default);
                child.insert(remaining, client_id, qos);
            }
            _ => {
                let child = self.children.entry(level.to_string()).or_default();
                child.insert(remaining, client_id, qos);
            }
        }
    }

    /// Remove a subscription, pruning branches that become empty.
    /// Returns true if an entry was removed.
    fn remove(&mut self, levels: &[&str], client_id: &str) -> bool {
        let Some((level, remaining)) = levels.split_first() else {
            return self.subscribers.remove(client_id).is_some();
        };

        match *level {
            "#" => {
                let Some(child) = self.hash.as_mut() else {
                    return false;
                };
                let removed = child.subscribers.remove(client_id).is_some();
                if child.is_empty() {
                    self.hash = None;
                }
                removed
            }
            "+" => {
                let Some(child) = self.plus.as_mut() else {
                    return false;
                };
                let removed = child.remove(remaining, client_id);
                if child.is_empty() {
                    self.plus = None;
                }
                removed
            }
            _ => {
                let Some(child) = self.children.get_mut(*level) else {
                    return false;
                };
                let removed = child.remove(remaining, client_id);
                if child.is_empty() {
                    self.children.remove(*level);
                }
                removed
            }
        }
    }

    fn remove_client(&mut self, client_id: &str) {
        self.subscribers.remove(client_id);
        if let Some(child) = self.plus.as_mut() {
            child.remove_client(client_id);
        }
        if let Some(child) = self.hash.as_mut() {
            child.remove_client(client_id);
        }
        for child in self.children.values_mut() {
            child.remove_client(client_id);
        }
    }

    /// Drop empty descendants bottom-up. Returns true if this node is now empty.
    fn prune(&mut self) -> bool {
        if let Some(child) = self.plus.as_mut() {
            if child.prune() {
                self.plus = None;
            }
        }
        if let Some(child) = self.hash.as_mut() {
            if child.prune() {
                self.hash = None;
            }
        }
        self.children.retain(|_, child| !child.prune());
        self.is_empty()
    }
}

/// Merge subscribers into the result map, keeping the highest QoS when the
/// same client matches through more than one filter.
fn collect_max_qos(result: &mut AHashMap<String, QoS>, subscribers: &AHashMap<String, QoS>) {
    for (client_id, qos) in subscribers {
        result
            .entry(client_id.clone())
            .and_modify(|existing| {
                if *qos > *existing {
                    *existing = *qos;
                }
            })
            .or_insert(*qos);
    }
}

/// Trie over topic levels holding subscriptions and retained messages.
pub struct TopicTree {
    root: TopicNode,
    /// Insertion-order tracking for retained messages, oldest first.
    retained_order: Vec<String>,
}

impl TopicTree {
    pub fn new() -> Self {
        Self {
            root: TopicNode::default(),
            retained_order: Vec::new(),
        }
    }

    /// Subscribe a client to a topic filter. An existing grant for the same
    /// (filter, client) is replaced, upgrading or downgrading the QoS.
    pub fn subscribe(&mut self, filter: &str, client_id: &str, qos: QoS) {
        let levels: Vec<&str> = filter.split('/').collect();
        self.root.insert(&levels, client_id, qos);
    }

    /// Unsubscribe a client from a topic filter, pruning empty branches.
    /// Returns true if a subscription was removed.
    pub fn unsubscribe(&mut self, filter: &str, client_id: &str) -> bool {
        let levels: Vec<&str> = filter.split('/').collect();
        self.root.remove(&levels, client_id)
    }

    /// Remove every subscription held by a client.
    pub fn remove_client(&mut self, client_id: &str) {
        self.root.remove_client(client_id);
        self.root.prune();
    }

    /// Drop empty branches left behind by unsubscribes and retained clears.
    pub fn prune(&mut self) {
        self.root.prune();
    }

    /// Find all subscribers matching a concrete topic.
    /// Returns client id -> granted QoS, max QoS on overlapping filters.
    pub fn matches(&self, topic: &str) -> AHashMap<String, QoS> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut result = AHashMap::new();

        // Iterative DFS over (node, next level index)
        let mut stack: Vec<(&TopicNode, usize)> = vec![(&self.root, 0)];

        while let Some((node, idx)) = stack.pop() {
            if idx == levels.len() {
                collect_max_qos(&mut result, &node.subscribers);
                // A trailing `#` also matches the parent level itself
                if let Some(hash) = &node.hash {
                    collect_max_qos(&mut result, &hash.subscribers);
                }
                continue;
            }

            let level = levels[idx];
            // MQTT-4.7.2-1: no wildcard matching against $-topics at the root
            let skip_wildcards = idx == 0 && level.starts_with('$');

            if !skip_wildcards {
                if let Some(hash) = &node.hash {
                    collect_max_qos(&mut result, &hash.subscribers);
                }
                if let Some(plus) = &node.plus {
                    stack.push((plus, idx + 1));
                }
            }

            if let Some(child) = node.children.get(level) {
                stack.push((child, idx + 1));
            }
        }

        result
    }

    /// Total number of subscriptions in the tree (for `$SYS`).
    pub fn subscription_count(&self) -> usize {
        let mut count = 0;
        let mut stack: Vec<&TopicNode> = vec![&self.root];
        while let Some(node) = stack.pop() {
            count += node.subscribers.len();
            if let Some(plus) = &node.plus {
                stack.push(plus);
            }
            if let Some(hash) = &node.hash {
                stack.push(hash);
            }
            stack.extend(node.children.values());
        }
        count
    }

    /// Store or clear a retained message for an exact topic.
    ///
    /// An empty payload removes the entry. Storing the (N+1)-th message when
    /// `max_retained` entries exist evicts the oldest one.
    pub fn set_retained(&mut self, topic: &str, payload: Bytes, qos: QoS, max_retained: usize) {
        if payload.is_empty() {
            self.clear_retained(topic);
            return;
        }

        let existing = self.get_retained(topic).is_some();
        if !existing && self.retained_order.len() >= max_retained {
            let oldest = self.retained_order.remove(0);
            self.clear_node_retained(&oldest);
        }

        let node = self.ensure_path(topic);
        node.retained = Some(RetainedMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });

        self.retained_order.retain(|t| t != topic);
        self.retained_order.push(topic.to_string());
    }

    /// Remove the retained entry at an exact topic, if any.
    pub fn clear_retained(&mut self, topic: &str) {
        self.clear_node_retained(topic);
        self.retained_order.retain(|t| t != topic);
    }

    /// Remove every retained entry.
    pub fn clear_all_retained(&mut self) {
        for topic in std::mem::take(&mut self.retained_order) {
            self.clear_node_retained(&topic);
        }
        self.root.prune();
    }

    /// Retained message at an exact topic.
    pub fn get_retained(&self, topic: &str) -> Option<&RetainedMessage> {
        let mut node = &self.root;
        for level in topic.split('/') {
            node = node.children.get(level)?;
        }
        node.retained.as_ref()
    }

    /// Number of retained messages currently stored (for `$SYS`).
    pub fn retained_count(&self) -> usize {
        self.retained_order.len()
    }

    /// All retained messages, for management dumps.
    pub fn retained_dump(&self) -> Vec<RetainedMessage> {
        let mut result = Vec::with_capacity(self.retained_order.len());
        let mut stack: Vec<&TopicNode> = vec![&self.root];
        while let Some(node) = stack.pop() {
            if let Some(retained) = &node.retained {
                result.push(retained.clone());
            }
            stack.extend(node.children.values());
        }
        result
    }

    /// All retained messages whose topic matches a filter, using the same
    /// wildcard semantics as subscription matching (including `$` isolation).
    pub fn matching_retained(&self, filter: &str) -> Vec<RetainedMessage> {
        let levels: Vec<&str> = filter.split('/').collect();
        let mut result = Vec::new();

        let mut stack: Vec<(&TopicNode, usize)> = vec![(&self.root, 0)];

        while let Some((node, idx)) = stack.pop() {
            if idx == levels.len() {
                if let Some(retained) = &node.retained {
                    result.push(retained.clone());
                }
                continue;
            }

            let level = levels[idx];
            let at_root = idx == 0;

            match level {
                "#" => {
                    // Everything below this node, minus $-topics at the root
                    let mut dfs: Vec<&TopicNode> = Vec::new();
                    if at_root {
                        for (name, child) in &node.children {
                            if !name.starts_with('$') {
                                dfs.push(child);
                            }
                        }
                    } else {
                        dfs.push(node);
                    }
                    while let Some(n) = dfs.pop() {
                        if let Some(retained) = &n.retained {
                            result.push(retained.clone());
                        }
                        dfs.extend(n.children.values());
                    }
                }
                "+" => {
                    for (name, child) in &node.children {
                        if at_root && name.starts_with('$') {
                            continue;
                        }
                        stack.push((child, idx + 1));
                    }
                }
                _ => {
                    if let Some(child) = node.children.get(level) {
                        stack.push((child, idx + 1));
                    }
                }
            }
        }

        result
    }

    fn ensure_path(&mut self, topic: &str) -> &mut TopicNode {
        let mut node = &mut self.root;
        for level in topic.split('/') {
            node = node.children.entry(level.to_string()).or_default();
        }
        node
    }

    fn clear_node_retained(&mut self, topic: &str) {
        let mut node = &mut self.root;
        for level in topic.split('/') {
            match node.children.get_mut(level) {
                Some(child) => node = child,
                None => return,
            }
        }
        node.retained = None;
    }
}

impl Default for TopicTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qos_of(result: &AHashMap<String, QoS>, client: &str) -> Option<QoS> {
        result.get(client).copied()
    }

    #[test]
    fn test_exact_match() {
        let mut tree = TopicTree::new();
        tree.subscribe("sensors/temp", "a", QoS::AtMostOnce);

        assert_eq!(tree.matches("sensors/temp").len(), 1);
        assert!(tree.matches("sensors/humidity").is_empty());
        assert!(tree.matches("sensors").is_empty());
        assert!(tree.matches("sensors/temp/extra").is_empty());
    }

    #[test]
    fn test_plus_wildcard() {
        let mut tree = TopicTree::new();
        tree.subscribe("sensors/+/temp", "a", QoS::AtLeastOnce);

        assert_eq!(qos_of(&tree.matches("sensors/room1/temp"), "a"), Some(QoS::AtLeastOnce));
        assert_eq!(tree.matches("sensors/room2/temp").len(), 1);
        assert!(tree.matches("sensors/room1/humidity").is_empty());
        // '+' matches exactly one level
        assert!(tree.matches("sensors/room1/floor2/temp").is_empty());
    }

    #[test]
    fn test_hash_wildcard() {
        let mut tree = TopicTree::new();
        tree.subscribe("sensors/#", "a", QoS::AtMostOnce);

        assert_eq!(tree.matches("sensors/temp").len(), 1);
        assert_eq!(tree.matches("sensors/room1/floor2/temp").len(), 1);
        // '#' matches the parent level itself
        assert_eq!(tree.matches("sensors").len(), 1);
        assert!(tree.matches("actuators/light").is_empty());
    }

    #[test]
    fn test_max_qos_on_overlapping_filters() {
        let mut tree = TopicTree::new();
        tree.subscribe("sensors/#", "a", QoS::AtMostOnce);
        tree.subscribe("sensors/+/temp", "a", QoS::ExactlyOnce);
        tree.subscribe("sensors/room1/temp", "a", QoS::AtLeastOnce);

        let result = tree.matches("sensors/room1/temp");
        assert_eq!(result.len(), 1);
        assert_eq!(qos_of(&result, "a"), Some(QoS::ExactlyOnce));
    }

    #[test]
    fn test_subscription_replacement_changes_qos() {
        let mut tree = TopicTree::new();
        tree.subscribe("a/b", "c1", QoS::AtMostOnce);
        tree.subscribe("a/b", "c1", QoS::ExactlyOnce);
        assert_eq!(qos_of(&tree.matches("a/b"), "c1"), Some(QoS::ExactlyOnce));
        assert_eq!(tree.subscription_count(), 1);

        tree.subscribe("a/b", "c1", QoS::AtMostOnce);
        assert_eq!(qos_of(&tree.matches("a/b"), "c1"), Some(QoS::AtMostOnce));
    }

    #[test]
    fn test_system_topic_isolation() {
        let mut tree = TopicTree::new();
        tree.subscribe("#", "blanket", QoS::AtMostOnce);
        tree.subscribe("+/broker/uptime", "plus", QoS::AtMostOnce);

        assert!(tree.matches("$SYS/broker/uptime").is_empty());

        tree.subscribe("$SYS/#", "sys", QoS::AtMostOnce);
        let result = tree.matches("$SYS/broker/uptime");
        assert_eq!(result.len(), 1);
        assert!(result.contains_key("sys"));

        // Ordinary topics still reach the blanket subscriber
        assert!(tree.matches("sensors/temp").contains_key("blanket"));
    }

    #[test]
    fn test_unsubscribe_prunes_branches() {
        let mut tree = TopicTree::new();
        tree.subscribe("a/b/c/d", "c1", QoS::AtMostOnce);
        assert!(tree.unsubscribe("a/b/c/d", "c1"));
        assert!(!tree.unsubscribe("a/b/c/d", "c1"));
        assert!(tree.matches("a/b/c/d").is_empty());
        // The branch is gone entirely
        assert_eq!(tree.subscription_count(), 0);
        assert!(tree.root.children.is_empty());
    }

    #[test]
    fn test_unsubscribe_keeps_retained_branch() {
        let mut tree = TopicTree::new();
        tree.subscribe("a/b", "c1", QoS::AtMostOnce);
        tree.set_retained("a/b", Bytes::from_static(b"x"), QoS::AtMostOnce, 100);
        assert!(tree.unsubscribe("a/b", "c1"));
        assert!(tree.get_retained("a/b").is_some());
    }

    #[test]
    fn test_remove_client() {
        let mut tree = TopicTree::new();
        tree.subscribe("a/+", "c1", QoS::AtMostOnce);
        tree.subscribe("a/#", "c1", QoS::AtMostOnce);
        tree.subscribe("a/b", "c2", QoS::AtMostOnce);

        tree.remove_client("c1");
        let result = tree.matches("a/b");
        assert_eq!(result.len(), 1);
        assert!(result.contains_key("c2"));
    }

    #[test]
    fn test_retained_set_get_clear() {
        let mut tree = TopicTree::new();
        tree.set_retained("status/device1", Bytes::from_static(b"online"), QoS::AtLeastOnce, 100);
        assert_eq!(tree.retained_count(), 1);
        assert_eq!(
            tree.get_retained("status/device1").unwrap().payload,
            Bytes::from_static(b"online")
        );

        // Empty payload clears the entry and only that entry
        tree.set_retained("status/device2", Bytes::from_static(b"ok"), QoS::AtMostOnce, 100);
        tree.set_retained("status/device1", Bytes::new(), QoS::AtMostOnce, 100);
        assert!(tree.get_retained("status/device1").is_none());
        assert!(tree.get_retained("status/device2").is_some());
        assert_eq!(tree.retained_count(), 1);
    }

    #[test]
    fn test_retained_lru_eviction() {
        let mut tree = TopicTree::new();
        tree.set_retained("t/1", Bytes::from_static(b"1"), QoS::AtMostOnce, 2);
        tree.set_retained("t/2", Bytes::from_static(b"2"), QoS::AtMostOnce, 2);
        // Refresh t/1 so t/2 becomes the oldest
        tree.set_retained("t/1", Bytes::from_static(b"1b"), QoS::AtMostOnce, 2);
        tree.set_retained("t/3", Bytes::from_static(b"3"), QoS::AtMostOnce, 2);

        assert_eq!(tree.retained_count(), 2);
        assert!(tree.get_retained("t/2").is_none());
        assert!(tree.get_retained("t/1").is_some());
        assert!(tree.get_retained("t/3").is_some());
    }

    #[test]
    fn test_matching_retained_wildcards() {
        let mut tree = TopicTree::new();
        tree.set_retained("status/device1", Bytes::from_static(b"a"), QoS::AtMostOnce, 100);
        tree.set_retained("status/device2", Bytes::from_static(b"b"), QoS::AtMostOnce, 100);
        tree.set_retained("other/device3", Bytes::from_static(b"c"), QoS::AtMostOnce, 100);

        let mut topics: Vec<String> = tree
            .matching_retained("status/+")
            .into_iter()
            .map(|r| r.topic)
            .collect();
        topics.sort();
        assert_eq!(topics, ["status/device1", "status/device2"]);

        assert_eq!(tree.matching_retained("#").len(), 3);
        assert_eq!(tree.matching_retained("other/device3").len(), 1);
        assert!(tree.matching_retained("none/+").is_empty());
    }

    #[test]
    fn test_matching_retained_system_isolation() {
        let mut tree = TopicTree::new();
        tree.set_retained("$SYS/broker/uptime", Bytes::from_static(b"1"), QoS::AtMostOnce, 100);
        tree.set_retained("sensors/temp", Bytes::from_static(b"2"), QoS::AtMostOnce, 100);

        assert_eq!(tree.matching_retained("#").len(), 1);
        assert!(tree.matching_retained("+/broker/uptime").is_empty());
        assert_eq!(tree.matching_retained("$SYS/#").len(), 1);
        assert_eq!(tree.matching_retained("$SYS/broker/uptime").len(), 1);
    }

    #[test]
    fn test_clear_all_retained() {
        let mut tree = TopicTree::new();
        tree.set_retained("a/1", Bytes::from_static(b"1"), QoS::AtMostOnce, 100);
        tree.set_retained("a/2", Bytes::from_static(b"2"), QoS::AtMostOnce, 100);
        tree.clear_all_retained();
        assert_eq!(tree.retained_count(), 0);
        assert!(tree.retained_dump().is_empty());
    }
}
