//! The per-queue message pipeline: a ready FIFO feeding consumers, a
//! pending-ack map of delivered-but-unacknowledged messages, and, for
//! durable queues, an index of where each live record sits on disk. A
//! message is in exactly one of ready or pending until it is acknowledged.

use crate::errors::{IoSnafu, Result};
use crate::message_log::{MessageLog, MessagePayload};
use crate::protocol::{BasicProperties, DeliveryMode, Message};
use log::{error, warn};
use snafu::ResultExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Compaction runs after an ack once the file holds more than this many
/// records and fewer than half of them are still valid.
const COMPACT_MIN_TOTAL: usize = 2000;

#[derive(Clone, Copy)]
struct DiskSlot {
    offset: u64,
    length: u64,
}

struct StoreInner {
    queue: String,
    log: Option<MessageLog>,
    ready: VecDeque<Message>,
    pending: HashMap<String, Message>,
    slots: HashMap<String, DiskSlot>,
    total: usize,
    valid: usize,
}

pub(crate) struct QueueStore {
    inner: Mutex<StoreInner>,
}

impl QueueStore {
    /// Opens the pipeline for one queue. Durable queues get a data file and
    /// recover their backlog from it: the file is compacted on open, the
    /// surviving records seed the ready list in record order, and the
    /// counters start equal.
    fn open(base_dir: &Path, queue: &str, durable: bool) -> Result<QueueStore> {
        let mut inner = StoreInner {
            queue: queue.to_string(),
            log: None,
            ready: VecDeque::new(),
            pending: HashMap::new(),
            slots: HashMap::new(),
            total: 0,
            valid: 0,
        };
        if durable {
            let mut log = MessageLog::open(base_dir, queue)?;
            let records = log.compact()?;
            for record in records {
                inner.slots.insert(
                    record.payload.properties.id.clone(),
                    DiskSlot {
                        offset: record.offset,
                        length: record.length,
                    },
                );
                inner.ready.push_back(Message {
                    properties: record.payload.properties,
                    body: record.payload.body,
                });
            }
            inner.total = inner.slots.len();
            inner.valid = inner.total;
            inner.log = Some(log);
        }
        Ok(QueueStore {
            inner: Mutex::new(inner),
        })
    }

    /// Materializes and enqueues one message. The delivery mode resolves
    /// from the properties when set, otherwise from the queue's durability;
    /// a non-durable queue never persists.
    fn insert(&self, properties: Option<BasicProperties>, body: Vec<u8>, queue_durable: bool) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let mut properties = properties.unwrap_or_default();
        if properties.id.is_empty() {
            properties.id = Uuid::new_v4().to_string();
        }
        properties.delivery_mode = if !queue_durable {
            DeliveryMode::Undurable
        } else if properties.delivery_mode == DeliveryMode::Unknown {
            DeliveryMode::Durable
        } else {
            properties.delivery_mode
        };
        let message = Message {
            properties,
            body,
        };
        if message.properties.delivery_mode == DeliveryMode::Durable {
            let payload = MessagePayload {
                properties: message.properties.clone(),
                body: message.body.clone(),
                valid: true,
            };
            let appended = match inner.log.as_mut() {
                Some(log) => log.append(&payload),
                None => {
                    error!("queue {}: durable message but no data file", inner.queue);
                    return false;
                }
            };
            match appended {
                Ok((offset, length)) => {
                    inner
                        .slots
                        .insert(message.properties.id.clone(), DiskSlot { offset, length });
                    inner.total += 1;
                    inner.valid += 1;
                }
                Err(err) => {
                    error!(
                        "queue {}: failed to persist message {}: {}",
                        inner.queue, message.properties.id, err
                    );
                    return false;
                }
            }
        }
        inner.ready.push_back(message);
        true
    }

    /// Pops the head of the ready list into pending-ack.
    fn front(&self) -> Option<Message> {
        let mut inner = self.inner.lock().unwrap();
        let message = inner.ready.pop_front()?;
        inner
            .pending
            .insert(message.properties.id.clone(), message.clone());
        Some(message)
    }

    fn ack(&self, msg_id: &str) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(message) = inner.pending.remove(msg_id) else {
            warn!("queue {}: ack for unknown message {}", inner.queue, msg_id);
            return;
        };
        if let Some(slot) = inner.slots.remove(msg_id) {
            if let Some(log) = inner.log.as_mut() {
                if let Err(err) = log.invalidate(&message, slot.offset, slot.length) {
                    error!("queue {}: failed to invalidate message {}: {}", inner.queue, msg_id, err);
                }
            }
            inner.valid -= 1;
            if inner.total > COMPACT_MIN_TOTAL && inner.valid * 2 < inner.total {
                inner.compact();
            }
        }
    }

    fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.total, inner.valid)
    }

    fn ready_len(&self) -> usize {
        self.inner.lock().unwrap().ready.len()
    }

    fn destroy(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(log) = inner.log.take() {
            log.remove_files();
        }
        inner.ready.clear();
        inner.pending.clear();
        inner.slots.clear();
        inner.total = 0;
        inner.valid = 0;
    }
}

impl StoreInner {
    fn compact(&mut self) {
        let records = {
            let Some(log) = self.log.as_mut() else {
                return;
            };
            match log.compact() {
                Ok(records) => records,
                Err(err) => {
                    error!("queue {}: compaction failed: {}", self.queue, err);
                    return;
                }
            }
        };
        // every message still tracked in memory gets its slot refreshed; a
        // record the pipeline no longer knows about is requeued rather than
        // dropped on the floor
        let mut known: HashSet<String> = self.pending.keys().cloned().collect();
        known.extend(self.ready.iter().map(|message| message.properties.id.clone()));
        self.slots.clear();
        for record in records {
            let id = record.payload.properties.id.clone();
            self.slots.insert(
                id.clone(),
                DiskSlot {
                    offset: record.offset,
                    length: record.length,
                },
            );
            if !known.contains(&id) {
                warn!("queue {}: message {} resurfaced during compaction, requeueing", self.queue, id);
                self.ready.push_back(Message {
                    properties: record.payload.properties,
                    body: record.payload.body,
                });
            }
        }
        self.total = self.slots.len();
        self.valid = self.slots.len();
    }
}

/// Registry of pipelines keyed by queue name. The registry lock only guards
/// the map; each pipeline serializes its own state, so operations on
/// different queues never contend.
pub(crate) struct MessageManager {
    base_dir: PathBuf,
    stores: Mutex<HashMap<String, Arc<QueueStore>>>,
}

impl MessageManager {
    /// Creating the base directory is a startup requirement; failure is
    /// fatal and propagates.
    pub(crate) fn open(base_dir: &Path) -> Result<MessageManager> {
        fs::create_dir_all(base_dir).context(IoSnafu {
            doing: "creating message store directory",
        })?;
        Ok(MessageManager {
            base_dir: base_dir.to_path_buf(),
            stores: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn init_queue(&self, queue: &str, durable: bool) -> bool {
        let mut stores = self.stores.lock().unwrap();
        if stores.contains_key(queue) {
            return true;
        }
        match QueueStore::open(&self.base_dir, queue, durable) {
            Ok(store) => {
                stores.insert(queue.to_string(), Arc::new(store));
                true
            }
            Err(err) => {
                error!("queue {}: failed to open message store: {}", queue, err);
                false
            }
        }
    }

    pub(crate) fn destroy_queue(&self, queue: &str) {
        let store = self.stores.lock().unwrap().remove(queue);
        match store {
            Some(store) => store.destroy(),
            None => warn!("destroying message store of unknown queue {}", queue),
        }
    }

    fn store(&self, queue: &str) -> Option<Arc<QueueStore>> {
        let store = self.stores.lock().unwrap().get(queue).cloned();
        if store.is_none() {
            warn!("no message store for queue {}", queue);
        }
        store
    }

    pub(crate) fn insert(
        &self,
        queue: &str,
        properties: Option<BasicProperties>,
        body: Vec<u8>,
        queue_durable: bool,
    ) -> bool {
        match self.store(queue) {
            Some(store) => store.insert(properties, body, queue_durable),
            None => false,
        }
    }

    pub(crate) fn front(&self, queue: &str) -> Option<Message> {
        self.store(queue)?.front()
    }

    pub(crate) fn ack(&self, queue: &str, msg_id: &str) {
        if let Some(store) = self.store(queue) {
            store.ack(msg_id);
        }
    }

    /// (total, valid) record counters of a durable queue's file.
    pub(crate) fn counts(&self, queue: &str) -> Option<(usize, usize)> {
        self.store(queue).map(|store| store.counts())
    }

    pub(crate) fn ready_len(&self, queue: &str) -> Option<usize> {
        self.store(queue).map(|store| store.ready_len())
    }

    pub(crate) fn clear(&self) {
        let mut stores = self.stores.lock().unwrap();
        for store in stores.values() {
            store.destroy();
        }
        stores.clear();
    }
}
