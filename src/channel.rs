//! Server-side channels. A channel is the unit of request/response pairing
//! within a connection: every handler performs its mutation through the
//! virtual host or the consumer manager, then frames exactly one
//! `basicResponse`. A channel owns at most one consumer, cancelled when the
//! channel goes away.

use crate::codec::FrameWriter;
use crate::consumer::{Consumer, ConsumerCallback, ConsumerManager};
use crate::pool::WorkerPool;
use crate::protocol::{BasicProperties, ExchangeType, FieldTable, Response};
use crate::router;
use crate::virtual_host::VirtualHost;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub(crate) struct Channel {
    id: String,
    writer: FrameWriter,
    host: Arc<VirtualHost>,
    consumers: Arc<ConsumerManager>,
    pool: Arc<WorkerPool>,
    consumer: Mutex<Option<Arc<Consumer>>>,
}

impl Channel {
    pub(crate) fn new(
        id: &str,
        writer: FrameWriter,
        host: Arc<VirtualHost>,
        consumers: Arc<ConsumerManager>,
        pool: Arc<WorkerPool>,
    ) -> Channel {
        Channel {
            id: id.to_string(),
            writer,
            host,
            consumers,
            pool,
            consumer: Mutex::new(None),
        }
    }

    fn respond(&self, ok: bool, rid: &str) {
        let response = Response::Basic {
            rid: rid.to_string(),
            cid: self.id.clone(),
            ok,
        };
        if let Err(err) = self.writer.send(&response) {
            warn!("channel {}: failed to write response: {}", self.id, err);
        }
    }

    pub(crate) fn declare_exchange(
        &self,
        rid: &str,
        name: &str,
        exchange_type: ExchangeType,
        durable: bool,
        auto_delete: bool,
        args: FieldTable,
    ) {
        let ok = self
            .host
            .declare_exchange(name, exchange_type, durable, auto_delete, args);
        self.respond(ok, rid);
    }

    pub(crate) fn delete_exchange(&self, rid: &str, name: &str) {
        self.host.delete_exchange(name);
        self.respond(true, rid);
    }

    pub(crate) fn declare_queue(
        &self,
        rid: &str,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        args: FieldTable,
    ) {
        let ok = self.host.declare_queue(name, durable, exclusive, auto_delete, args);
        if ok {
            self.consumers.init_queue(name);
        }
        self.respond(ok, rid);
    }

    pub(crate) fn delete_queue(&self, rid: &str, name: &str) {
        self.consumers.destroy_queue(name);
        self.host.delete_queue(name);
        self.respond(true, rid);
    }

    pub(crate) fn queue_bind(&self, rid: &str, exchange: &str, queue: &str, binding_key: &str) {
        let ok = self.host.bind(exchange, queue, binding_key);
        self.respond(ok, rid);
    }

    pub(crate) fn queue_unbind(&self, rid: &str, exchange: &str, queue: &str) {
        self.host.unbind(exchange, queue);
        self.respond(true, rid);
    }

    /// Routes the message through every binding of the exchange, appends it
    /// to each matched queue, and schedules one delivery task per match.
    /// One response covers the whole fan-out.
    pub(crate) fn basic_publish(
        &self,
        rid: &str,
        exchange: &str,
        properties: Option<BasicProperties>,
        body: Vec<u8>,
    ) {
        let Some(exchange_rec) = self.host.select_exchange(exchange) else {
            warn!("channel {}: publish to unknown exchange {}", self.id, exchange);
            self.respond(false, rid);
            return;
        };
        let routing_key = properties
            .as_ref()
            .map(|properties| properties.routing_key.clone())
            .unwrap_or_default();
        let bindings = self.host.exchange_bindings(exchange);
        for (queue, binding) in &bindings {
            if !router::route(exchange_rec.exchange_type, &routing_key, &binding.binding_key) {
                continue;
            }
            if !self.host.basic_publish(queue, properties.clone(), body.clone()) {
                warn!("channel {}: failed to enqueue message on {}", self.id, queue);
                continue;
            }
            debug!("channel {}: routed message to {}", self.id, queue);
            self.schedule_delivery(queue);
        }
        self.respond(true, rid);
    }

    pub(crate) fn basic_ack(&self, rid: &str, queue: &str, msg_id: &str) {
        self.host.basic_ack(queue, msg_id);
        self.respond(true, rid);
    }

    /// Registers this channel's consumer. Deliveries are framed straight
    /// onto the connection by the callback; the consumer manager never sees
    /// the channel itself.
    pub(crate) fn basic_consume(&self, rid: &str, queue: &str, consumer_tag: &str, auto_ack: bool) {
        if !self.host.exists_queue(queue) {
            self.respond(false, rid);
            return;
        }
        let mut slot = self.consumer.lock().unwrap();
        if slot.is_some() {
            warn!("channel {}: already consuming", self.id);
            self.respond(false, rid);
            return;
        }
        let writer = self.writer.clone();
        let cid = self.id.clone();
        let callback: ConsumerCallback = Box::new(move |tag, properties, body| {
            let push = Response::Deliver {
                cid: cid.clone(),
                consumer_tag: tag.to_string(),
                properties: properties.clone(),
                body: body.to_vec(),
            };
            if let Err(err) = writer.send(&push) {
                warn!("channel {}: failed to push delivery: {}", cid, err);
            }
        });
        match self.consumers.create(consumer_tag, queue, auto_ack, callback) {
            Some(consumer) => {
                *slot = Some(consumer);
                drop(slot);
                // a recovered backlog must reach the first subscriber
                // without waiting for a fresh publish
                self.schedule_drain(queue);
                self.respond(true, rid);
            }
            None => self.respond(false, rid),
        }
    }

    pub(crate) fn basic_cancel(&self, rid: &str, queue: &str, consumer_tag: &str) {
        self.consumers.remove(consumer_tag, queue);
        let mut slot = self.consumer.lock().unwrap();
        if slot.as_ref().is_some_and(|consumer| consumer.tag == consumer_tag) {
            *slot = None;
        }
        drop(slot);
        self.respond(true, rid);
    }

    fn schedule_delivery(&self, queue: &str) {
        let host = Arc::clone(&self.host);
        let consumers = Arc::clone(&self.consumers);
        let queue = queue.to_string();
        self.pool.execute(move || {
            deliver_one(&host, &consumers, &queue);
        });
    }

    fn schedule_drain(&self, queue: &str) {
        let host = Arc::clone(&self.host);
        let consumers = Arc::clone(&self.consumers);
        let queue = queue.to_string();
        self.pool.execute(move || {
            while deliver_one(&host, &consumers, &queue) {}
        });
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(consumer) = self.consumer.lock().unwrap().take() {
            self.consumers.remove(&consumer.tag, &consumer.queue);
        }
    }
}

/// One delivery step: pick a consumer, pop the head message, invoke the
/// callback, auto-ack when asked. The consumer is chosen before anything is
/// popped, so a queue with no subscribers never strands a message in
/// pending-ack. No lock is held across the callback.
pub(crate) fn deliver_one(host: &VirtualHost, consumers: &ConsumerManager, queue: &str) -> bool {
    let Some(consumer) = consumers.choose(queue) else {
        return false;
    };
    let Some(message) = host.basic_consume(queue) else {
        return false;
    };
    consumer.deliver(&message.properties, &message.body);
    if consumer.auto_ack {
        host.basic_ack(queue, &message.properties.id);
    }
    true
}

/// Channels of one connection, keyed by channel id.
pub(crate) struct ChannelManager {
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl ChannelManager {
    pub(crate) fn new() -> ChannelManager {
        ChannelManager {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Fails on a duplicate channel id.
    pub(crate) fn open_channel(
        &self,
        id: &str,
        writer: FrameWriter,
        host: Arc<VirtualHost>,
        consumers: Arc<ConsumerManager>,
        pool: Arc<WorkerPool>,
    ) -> bool {
        let mut channels = self.channels.lock().unwrap();
        if channels.contains_key(id) {
            return false;
        }
        let channel = Arc::new(Channel::new(id, writer, host, consumers, pool));
        channels.insert(id.to_string(), channel);
        true
    }

    pub(crate) fn close_channel(&self, id: &str) {
        self.channels.lock().unwrap().remove(id);
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.lock().unwrap().get(id).cloned()
    }
}
