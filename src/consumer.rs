//! Consumers and their per-queue round-robin sets. A consumer is a tag, an
//! auto-ack flag, and a delivery callback handed in by value; nothing here
//! holds a reference back into the session layer.

use crate::protocol::BasicProperties;
use log::{debug, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

pub type ConsumerCallback = Box<dyn Fn(&str, &BasicProperties, &[u8]) + Send + Sync>;

pub struct Consumer {
    pub tag: String,
    pub queue: String,
    pub auto_ack: bool,
    callback: ConsumerCallback,
}

impl Consumer {
    pub(crate) fn deliver(&self, properties: &BasicProperties, body: &[u8]) {
        (self.callback)(&self.tag, properties, body);
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("tag", &self.tag)
            .field("queue", &self.queue)
            .field("auto_ack", &self.auto_ack)
            .finish()
    }
}

struct SetInner {
    rr_seq: u64,
    consumers: Vec<Arc<Consumer>>,
}

/// The ordered consumers of one queue plus the monotonic round-robin
/// counter. The counter is never reset except by `clear`; removals shift
/// the modular sequence and that is accepted.
pub(crate) struct ConsumerSet {
    queue: String,
    inner: Mutex<SetInner>,
}

impl ConsumerSet {
    fn new(queue: &str) -> ConsumerSet {
        ConsumerSet {
            queue: queue.to_string(),
            inner: Mutex::new(SetInner {
                rr_seq: 0,
                consumers: Vec::new(),
            }),
        }
    }

    fn create(
        &self,
        tag: &str,
        queue: &str,
        auto_ack: bool,
        callback: ConsumerCallback,
    ) -> Option<Arc<Consumer>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.consumers.iter().any(|consumer| consumer.tag == tag) {
            warn!("queue {}: consumer tag {} already registered", self.queue, tag);
            return None;
        }
        let consumer = Arc::new(Consumer {
            tag: tag.to_string(),
            queue: queue.to_string(),
            auto_ack,
            callback,
        });
        inner.consumers.push(Arc::clone(&consumer));
        Some(consumer)
    }

    fn remove(&self, tag: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.consumers.iter().position(|consumer| consumer.tag == tag) {
            inner.consumers.remove(pos);
        }
    }

    fn choose(&self) -> Option<Arc<Consumer>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.consumers.is_empty() {
            debug!("queue {}: no consumers registered", self.queue);
            return None;
        }
        let idx = (inner.rr_seq % inner.consumers.len() as u64) as usize;
        inner.rr_seq += 1;
        Some(Arc::clone(&inner.consumers[idx]))
    }

    fn exists(&self, tag: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .consumers
            .iter()
            .any(|consumer| consumer.tag == tag)
    }

    fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().consumers.is_empty()
    }

    fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consumers.clear();
        inner.rr_seq = 0;
    }
}

/// Registry of consumer sets keyed by queue name. Lookups on a missing
/// queue warn and return the neutral failure value.
pub struct ConsumerManager {
    sets: Mutex<HashMap<String, Arc<ConsumerSet>>>,
}

impl Default for ConsumerManager {
    fn default() -> ConsumerManager {
        ConsumerManager::new()
    }
}

impl ConsumerManager {
    pub fn new() -> ConsumerManager {
        ConsumerManager {
            sets: Mutex::new(HashMap::new()),
        }
    }

    pub fn init_queue(&self, queue: &str) {
        let mut sets = self.sets.lock().unwrap();
        if sets.contains_key(queue) {
            return;
        }
        sets.insert(queue.to_string(), Arc::new(ConsumerSet::new(queue)));
    }

    pub fn destroy_queue(&self, queue: &str) {
        self.sets.lock().unwrap().remove(queue);
    }

    fn set(&self, queue: &str) -> Option<Arc<ConsumerSet>> {
        let set = self.sets.lock().unwrap().get(queue).cloned();
        if set.is_none() {
            warn!("no consumer set for queue {}", queue);
        }
        set
    }

    pub fn create(
        &self,
        tag: &str,
        queue: &str,
        auto_ack: bool,
        callback: ConsumerCallback,
    ) -> Option<Arc<Consumer>> {
        self.set(queue)?.create(tag, queue, auto_ack, callback)
    }

    pub fn remove(&self, tag: &str, queue: &str) {
        if let Some(set) = self.set(queue) {
            set.remove(tag);
        }
    }

    /// Fair selection: the next consumer in the queue's round-robin order.
    pub fn choose(&self, queue: &str) -> Option<Arc<Consumer>> {
        self.set(queue)?.choose()
    }

    pub fn exists(&self, tag: &str, queue: &str) -> bool {
        self.set(queue).is_some_and(|set| set.exists(tag))
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.set(queue).map_or(true, |set| set.is_empty())
    }

    pub fn clear(&self) {
        let mut sets = self.sets.lock().unwrap();
        for set in sets.values() {
            set.clear();
        }
        sets.clear();
    }
}
