//! The virtual host is the single entry point for entity and message
//! mutations. It composes the entity managers and the message pipelines;
//! each manager serializes its own state, so operations on disjoint
//! entities run in parallel and no method ever holds two manager locks.

use crate::binding::{BindingManager, QueueBindingMap};
use crate::errors::{IoSnafu, Result};
use crate::exchange::{Exchange, ExchangeManager};
use crate::message_store::MessageManager;
use crate::protocol::{BasicProperties, ExchangeType, FieldTable, Message};
use crate::queue::{QueueManager, QueueMap};
use crate::router;
use log::{error, info};
use snafu::ResultExt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub struct VirtualHost {
    name: String,
    exchanges: ExchangeManager,
    queues: QueueManager,
    bindings: BindingManager,
    messages: MessageManager,
}

impl VirtualHost {
    /// Opens (or creates) the host's persisted state and recovers every
    /// durable queue's backlog. Directory or table creation failure is
    /// fatal and propagates to the caller.
    pub fn open(name: &str, base_dir: &Path, dbfile: &Path) -> Result<VirtualHost> {
        let messages = MessageManager::open(base_dir)?;
        if let Some(parent) = dbfile.parent() {
            fs::create_dir_all(parent).context(IoSnafu {
                doing: "creating metadata store directory",
            })?;
        }
        let exchanges = ExchangeManager::open(dbfile)?;
        let queues = QueueManager::open(dbfile)?;
        let bindings = BindingManager::open(dbfile)?;
        let host = VirtualHost {
            name: name.to_string(),
            exchanges,
            queues,
            bindings,
            messages,
        };
        for (queue_name, queue) in host.queues.all() {
            if host.messages.init_queue(&queue_name, queue.durable) {
                info!("virtual host {}: recovered queue {}", host.name, queue_name);
            } else {
                error!("virtual host {}: failed to recover queue {}", host.name, queue_name);
            }
        }
        Ok(host)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declare_exchange(
        &self,
        name: &str,
        exchange_type: ExchangeType,
        durable: bool,
        auto_delete: bool,
        args: FieldTable,
    ) -> bool {
        self.exchanges
            .declare(name, exchange_type, durable, auto_delete, args)
    }

    pub fn delete_exchange(&self, name: &str) {
        // bindings first, so no binding ever references a dead exchange
        self.bindings.remove_exchange_bindings(name);
        self.exchanges.delete(name);
    }

    pub fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        args: FieldTable,
    ) -> bool {
        if !self.messages.init_queue(name, durable) {
            return false;
        }
        self.queues.declare(name, durable, exclusive, auto_delete, args)
    }

    pub fn delete_queue(&self, name: &str) {
        self.messages.destroy_queue(name);
        self.bindings.remove_queue_bindings(name);
        self.queues.delete(name);
    }

    /// Binds a queue to an exchange. The binding persists only when both
    /// endpoints are durable.
    pub fn bind(&self, exchange: &str, queue: &str, binding_key: &str) -> bool {
        let Some(exchange_rec) = self.exchanges.select(exchange) else {
            error!("bind failed, exchange {} does not exist", exchange);
            return false;
        };
        let Some(queue_rec) = self.queues.select(queue) else {
            error!("bind failed, queue {} does not exist", queue);
            return false;
        };
        if !router::is_valid_binding_key(binding_key) {
            return false;
        }
        self.bindings.bind(
            exchange,
            queue,
            binding_key,
            exchange_rec.durable && queue_rec.durable,
        )
    }

    pub fn unbind(&self, exchange: &str, queue: &str) {
        self.bindings.unbind(exchange, queue);
    }

    pub fn exchange_bindings(&self, exchange: &str) -> QueueBindingMap {
        self.bindings.exchange_bindings(exchange)
    }

    /// Appends one message to a queue's pipeline. Persisted when the queue
    /// is durable and the resolved delivery mode is durable.
    pub fn basic_publish(&self, queue: &str, properties: Option<BasicProperties>, body: Vec<u8>) -> bool {
        let Some(queue_rec) = self.queues.select(queue) else {
            error!("publish failed, queue {} does not exist", queue);
            return false;
        };
        self.messages.insert(queue, properties, body, queue_rec.durable)
    }

    /// Pops the head message into pending-ack; `None` when the queue is
    /// empty or unknown.
    pub fn basic_consume(&self, queue: &str) -> Option<Message> {
        self.messages.front(queue)
    }

    pub fn basic_ack(&self, queue: &str, msg_id: &str) {
        self.messages.ack(queue, msg_id);
    }

    pub fn select_exchange(&self, name: &str) -> Option<Arc<Exchange>> {
        self.exchanges.select(name)
    }

    pub fn exists_exchange(&self, name: &str) -> bool {
        self.exchanges.exists(name)
    }

    pub fn exists_queue(&self, name: &str) -> bool {
        self.queues.exists(name)
    }

    pub fn exists_binding(&self, exchange: &str, queue: &str) -> bool {
        self.bindings.exists(exchange, queue)
    }

    pub fn all_queues(&self) -> QueueMap {
        self.queues.all()
    }

    /// (total, valid) on-disk record counters of a queue's pipeline.
    pub fn queue_message_counts(&self, queue: &str) -> Option<(usize, usize)> {
        self.messages.counts(queue)
    }

    pub fn queue_ready_len(&self, queue: &str) -> Option<usize> {
        self.messages.ready_len(queue)
    }

    /// Drops every entity, every message, and all persisted state.
    pub fn clear(&self) {
        self.exchanges.clear();
        self.queues.clear();
        self.bindings.clear();
        self.messages.clear();
    }
}
