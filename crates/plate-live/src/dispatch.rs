//! Topic fan-out.
//!
//! Best effort, at most once per subscribed connection. Nothing is queued: a
//! connection that is dead or not yet subscribed when `publish` runs never
//! sees that notification. Delivery happens on the caller's thread, so
//! notifications on one topic arrive in call order.

use crate::connections::ConnectionManager;
use crate::error::LiveResult;
use crate::notify::Notification;
use crate::topic::Topic;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub topic: Topic,
    pub subscribers: usize,
    pub delivered: usize,
    /// Subscribers with no socket left that accepted the frame.
    pub unreachable: usize,
}

#[derive(Clone)]
pub struct BroadcastDispatcher {
    connections: Arc<ConnectionManager>,
}

impl BroadcastDispatcher {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Socket failures are absorbed here; the only error is a notification
    /// that cannot be encoded.
    pub fn publish(&self, topic: &Topic, notification: &Notification) -> LiveResult<PublishReport> {
        let subscribers = self.connections.registry().subscribers_of(topic);
        let mut report = PublishReport {
            topic: topic.clone(),
            subscribers: subscribers.len(),
            delivered: 0,
            unreachable: 0,
        };
        if subscribers.is_empty() {
            return Ok(report);
        }

        let frame = notification.encode()?;
        for connection in &subscribers {
            if self.connections.send(connection, &frame).is_delivered() {
                report.delivered += 1;
            } else {
                report.unreachable += 1;
            }
        }
        debug!(
            %topic,
            kind = notification.type_name(),
            subscribers = report.subscribers,
            delivered = report.delivered,
            unreachable = report.unreachable,
            "published"
        );
        Ok(report)
    }

    pub fn has_subscribers(&self, topic: &Topic) -> bool {
        self.connections.registry().has_subscribers(topic)
    }

    pub fn publish_to(&self, topic: &str, notification: &Notification) -> LiveResult<PublishReport> {
        let topic: Topic = topic.parse()?;
        self.publish(&topic, notification)
    }
}
