//! In-process fan-out of committed operations and presence changes.
//!
//! One bounded broadcast channel per document. Publishes happen after the
//! corresponding commit returned, so subscribers observe operations in
//! commit order. Nothing is retained for absent subscribers: a client that
//! misses events (lagged receiver, reconnect) recovers through the
//! catch-up read path, which serves the same total order.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::constants::FANOUT_BUFFER_SIZE;
use crate::presence::SessionRecord;
use crate::transform::EditOperation;

/// An event delivered to document subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum CollabEvent {
    /// An operation was committed.
    #[serde(rename = "updateAction")]
    OpCommitted { payload: EditOperation },
    /// A session joined; carries the full user list.
    #[serde(rename = "addUser")]
    UserJoined { payload: Vec<SessionRecord> },
    /// A session left; carries the departing session id.
    #[serde(rename = "removeUser")]
    UserLeft { payload: String },
}

/// Publish/subscribe hub keyed by document id.
///
/// The topic map is read-mostly: it changes only on first subscribe per
/// document and on lazy cleanup, so it sits behind a reader-writer lock.
#[derive(Default)]
pub struct FanoutHub {
    topics: RwLock<HashMap<String, broadcast::Sender<CollabEvent>>>,
}

impl FanoutHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a document's events. Creates the topic on first use.
    pub fn subscribe(&self, doc: &str) -> broadcast::Receiver<CollabEvent> {
        if let Some(sender) = self.topics.read().expect("fanout lock poisoned").get(doc) {
            return sender.subscribe();
        }
        let mut topics = self.topics.write().expect("fanout lock poisoned");
        topics
            .entry(doc.to_string())
            .or_insert_with(|| broadcast::channel(FANOUT_BUFFER_SIZE).0)
            .subscribe()
    }

    /// Publish an event to a document's subscribers. Events published while
    /// nobody subscribes are dropped, and the idle topic is removed.
    pub fn publish(&self, doc: &str, event: CollabEvent) {
        let delivered = {
            let topics = self.topics.read().expect("fanout lock poisoned");
            match topics.get(doc) {
                Some(sender) => sender.send(event).ok(),
                None => None,
            }
        };
        match delivered {
            Some(count) => debug!(doc = %doc, receivers = count, "event published"),
            None => {
                debug!(doc = %doc, "event dropped (no subscribers)");
                self.cleanup(doc);
            }
        }
    }

    /// Number of live subscribers on a document.
    pub fn subscriber_count(&self, doc: &str) -> usize {
        self.topics
            .read()
            .expect("fanout lock poisoned")
            .get(doc)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Drop a topic once its last receiver is gone.
    fn cleanup(&self, doc: &str) {
        let mut topics = self.topics.write().expect("fanout lock poisoned");
        if let Some(sender) = topics.get(doc)
            && sender.receiver_count() == 0
        {
            topics.remove(doc);
        }
    }
}
