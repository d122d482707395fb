use crate::model::RetainedMessage;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// In-memory mirror of the broker's retained message set, one entry per
/// topic, last write wins. This is a derived view: it can be rebuilt from the
/// durable store at any time, so losing it on restart costs nothing but a
/// recovery pass.
pub struct RetainedCache {
    inner: RwLock<BTreeMap<String, RetainedMessage>>,
}

impl RetainedCache {
    pub fn new() -> Self {
        RetainedCache {
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, topic: &str) -> Option<RetainedMessage> {
        self.inner
            .read()
            .expect("retained cache lock poisoned")
            .get(topic)
            .cloned()
    }

    /// Replaces whatever the topic currently holds. Arrival order is the
    /// only ordering that matters here; callers must not reorder.
    pub fn put(&self, message: RetainedMessage) {
        self.inner
            .write()
            .expect("retained cache lock poisoned")
            .insert(message.topic.clone(), message);
    }

    /// Snapshot of every entry in topic order. Deterministic across calls
    /// with no intervening writes.
    pub fn all(&self) -> Vec<RetainedMessage> {
        self.inner
            .read()
            .expect("retained cache lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("retained cache lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RetainedCache {
    fn default() -> Self {
        Self::new()
    }
}
