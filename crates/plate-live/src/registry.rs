//! Topic ↔ connection index.
//!
//! Forward (topic → connections) and reverse (connection → topics) maps sit
//! behind one lock so every mutation updates both or neither. Only connection
//! ids are stored here; sockets belong to the connection manager.

use crate::connections::ConnectionId;
use crate::topic::{Topic, TopicKind};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Default)]
struct Index {
    by_topic: BTreeMap<Topic, BTreeSet<ConnectionId>>,
    by_connection: BTreeMap<ConnectionId, BTreeSet<Topic>>,
}

impl Index {
    fn unlink(&mut self, topic: &Topic, connection: &ConnectionId) -> bool {
        let removed = match self.by_topic.get_mut(topic) {
            Some(subscribers) => {
                let removed = subscribers.remove(connection);
                if subscribers.is_empty() {
                    self.by_topic.remove(topic);
                }
                removed
            }
            None => false,
        };
        if let Some(topics) = self.by_connection.get_mut(connection) {
            topics.remove(topic);
            if topics.is_empty() {
                self.by_connection.remove(connection);
            }
        }
        removed
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    index: Mutex<Index>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the subscription did not exist before.
    pub fn subscribe(&self, topic: &Topic, connection: &ConnectionId) -> bool {
        let mut index = self.index.lock();
        let added = index
            .by_topic
            .entry(topic.clone())
            .or_default()
            .insert(connection.clone());
        index
            .by_connection
            .entry(connection.clone())
            .or_default()
            .insert(topic.clone());
        if added {
            debug!(%topic, %connection, "subscribed");
        }
        added
    }

    /// Returns `true` when a subscription was removed.
    pub fn unsubscribe(&self, topic: &Topic, connection: &ConnectionId) -> bool {
        let removed = self.index.lock().unlink(topic, connection);
        if removed {
            debug!(%topic, %connection, "unsubscribed");
        }
        removed
    }

    pub fn subscribers_of(&self, topic: &Topic) -> BTreeSet<ConnectionId> {
        self.index
            .lock()
            .by_topic
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn topics_of(&self, connection: &ConnectionId) -> BTreeSet<Topic> {
        self.index
            .lock()
            .by_connection
            .get(connection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_subscribers(&self, topic: &Topic) -> bool {
        self.index.lock().by_topic.contains_key(topic)
    }

    /// Drop every subscription of `connection`. Walks only that connection's
    /// own topics. Returns how many subscriptions were removed.
    pub fn remove_connection(&self, connection: &ConnectionId) -> usize {
        let mut index = self.index.lock();
        let Some(topics) = index.by_connection.remove(connection) else {
            return 0;
        };
        for topic in &topics {
            if let Some(subscribers) = index.by_topic.get_mut(topic) {
                subscribers.remove(connection);
                if subscribers.is_empty() {
                    index.by_topic.remove(topic);
                }
            }
        }
        debug!(%connection, removed = topics.len(), "dropped connection subscriptions");
        topics.len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.index.lock().by_connection.keys().cloned().collect()
    }

    /// Subscription totals keyed by topic kind; every kind is present.
    pub fn counts_by_kind(&self) -> BTreeMap<String, usize> {
        let index = self.index.lock();
        let mut counts: BTreeMap<String, usize> = [TopicKind::Sample, TopicKind::Run, TopicKind::System]
            .iter()
            .map(|kind| (kind.as_str().to_string(), 0))
            .collect();
        for (topic, subscribers) in &index.by_topic {
            *counts.entry(topic.kind().as_str().to_string()).or_insert(0) += subscribers.len();
        }
        counts
    }

    pub fn subscription_count(&self) -> usize {
        self.index.lock().by_topic.values().map(BTreeSet::len).sum()
    }

    /// Both maps describe the same set of pairs and hold no empty entries.
    pub fn is_consistent(&self) -> bool {
        let index = self.index.lock();
        let forward: BTreeSet<(Topic, ConnectionId)> = index
            .by_topic
            .iter()
            .flat_map(|(t, cs)| cs.iter().map(move |c| (t.clone(), c.clone())))
            .collect();
        let reverse: BTreeSet<(Topic, ConnectionId)> = index
            .by_connection
            .iter()
            .flat_map(|(c, ts)| ts.iter().map(move |t| (t.clone(), c.clone())))
            .collect();
        forward == reverse
            && index.by_topic.values().all(|s| !s.is_empty())
            && index.by_connection.values().all(|s| !s.is_empty())
    }
}
