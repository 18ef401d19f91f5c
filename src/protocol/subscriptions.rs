//! # Subscription Table
//!
//! Topic-to-handler mapping consulted on every inbound publish.
//!
//! A topic maps to at most one handler per connection. Duplicate subscribes
//! and unknown unsubscribes are local errors reported without touching the
//! wire. A publish arriving for a topic that was just unsubscribed is a
//! permitted race: the relay may still deliver in-flight events, and the
//! lookup simply comes back empty.

use crate::error::{RelayError, Result};
use crate::handler::TopicHandler;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub(crate) struct SubscriptionTable {
    topics: Mutex<HashMap<String, Arc<dyn TopicHandler>>>,
}

impl SubscriptionTable {
    pub(crate) fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a handler for `topic`, failing if one is already present.
    pub(crate) fn insert(&self, topic: &str, handler: Arc<dyn TopicHandler>) -> Result<()> {
        let mut topics = self.topics.lock().expect("subscription table poisoned");
        if topics.contains_key(topic) {
            return Err(RelayError::AlreadySubscribed(topic.to_string()));
        }
        topics.insert(topic.to_string(), handler);
        Ok(())
    }

    /// Remove the handler for `topic`, failing if none is present.
    pub(crate) fn remove(&self, topic: &str) -> Result<()> {
        let mut topics = self.topics.lock().expect("subscription table poisoned");
        match topics.remove(topic) {
            Some(_) => Ok(()),
            None => Err(RelayError::NotSubscribed(topic.to_string())),
        }
    }

    /// Look up the handler for an inbound publish.
    pub(crate) fn lookup(&self, topic: &str) -> Option<Arc<dyn TopicHandler>> {
        self.topics
            .lock()
            .expect("subscription table poisoned")
            .get(topic)
            .cloned()
    }

    /// Drop every subscription; used by teardown.
    pub(crate) fn clear(&self) {
        self.topics
            .lock()
            .expect("subscription table poisoned")
            .clear();
    }
}
