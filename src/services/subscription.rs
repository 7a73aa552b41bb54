//! Live subscription registry — fan-out of frames to interested connections.
//!
//! DESIGN
//! ======
//! Connections register a bounded sender under one or more topics. Services
//! publish frames to a topic without knowing which connections are attached.
//! Delivery is best-effort `try_send`: a slow consumer loses frames rather
//! than stalling the publisher. Closed senders are pruned lazily on publish;
//! a pruned subscriber is gone for good, there is no automatic re-subscribe.
//!
//! Each websocket connection holds the set of topics it subscribed to and
//! releases them when its context changes (leaving a room drops the room
//! topic; disconnect drops everything via `drop_connection`).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::frame::Frame;

/// What a connection can listen to.
///
/// `User` carries per-user traffic: DM deltas, friend events, notices.
/// `Room` carries room-wide traffic: chat messages, roster and stage changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    User(Uuid),
    Room(Uuid),
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::User(id) => write!(f, "user:{id}"),
            Topic::Room(id) => write!(f, "room:{id}"),
        }
    }
}

#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    topics: Arc<RwLock<HashMap<Topic, HashMap<Uuid, mpsc::Sender<Frame>>>>>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection's sender to a topic.
    pub async fn subscribe(&self, topic: Topic, conn_id: Uuid, tx: mpsc::Sender<Frame>) {
        let mut topics = self.topics.write().await;
        topics.entry(topic).or_default().insert(conn_id, tx);
    }

    /// Detach a connection from one topic.
    pub async fn unsubscribe(&self, topic: Topic, conn_id: Uuid) {
        let mut topics = self.topics.write().await;
        if let Some(subs) = topics.get_mut(&topic) {
            subs.remove(&conn_id);
            if subs.is_empty() {
                topics.remove(&topic);
            }
        }
    }

    /// Detach a connection from every topic. Called on disconnect.
    pub async fn drop_connection(&self, conn_id: Uuid) {
        let mut topics = self.topics.write().await;
        topics.retain(|_, subs| {
            subs.remove(&conn_id);
            !subs.is_empty()
        });
    }

    /// Send a frame to every subscriber of a topic.
    pub async fn publish(&self, topic: Topic, frame: &Frame) {
        self.publish_excluding(topic, frame, None).await;
    }

    /// Send a frame to every subscriber of a topic except one connection.
    ///
    /// Used when the originating connection already received a direct reply
    /// and should not see the broadcast copy.
    pub async fn publish_excluding(&self, topic: Topic, frame: &Frame, exclude_conn: Option<Uuid>) {
        let mut topics = self.topics.write().await;
        let Some(subs) = topics.get_mut(&topic) else {
            return;
        };

        subs.retain(|conn_id, tx| {
            if tx.is_closed() {
                return false;
            }
            if Some(*conn_id) == exclude_conn {
                return true;
            }
            if tx.try_send(frame.clone()).is_err() {
                tracing::debug!(%topic, %conn_id, "subscriber buffer full, frame dropped");
            }
            true
        });
        if subs.is_empty() {
            topics.remove(&topic);
        }
    }

    /// Number of live subscribers on a topic.
    pub async fn subscriber_count(&self, topic: Topic) -> usize {
        let topics = self.topics.read().await;
        topics.get(&topic).map_or(0, HashMap::len)
    }
}

#[cfg(test)]
#[path = "subscription_test.rs"]
mod tests;
