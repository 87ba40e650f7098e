//! Server-side connections. A connection owns its channel registry and the
//! shared writing half of the socket; dropping it (on disconnect) tears
//! down every channel, which in turn cancels their consumers.

use crate::channel::ChannelManager;
use crate::codec::FrameWriter;
use crate::consumer::ConsumerManager;
use crate::errors::{Result, UnknownChannelSnafu};
use crate::pool::WorkerPool;
use crate::protocol::{Request, Response};
use crate::virtual_host::VirtualHost;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub(crate) struct Connection {
    writer: FrameWriter,
    channels: ChannelManager,
    host: Arc<VirtualHost>,
    consumers: Arc<ConsumerManager>,
    pool: Arc<WorkerPool>,
}

impl Connection {
    pub(crate) fn new(
        writer: FrameWriter,
        host: Arc<VirtualHost>,
        consumers: Arc<ConsumerManager>,
        pool: Arc<WorkerPool>,
    ) -> Connection {
        Connection {
            writer,
            channels: ChannelManager::new(),
            host,
            consumers,
            pool,
        }
    }

    fn respond(&self, ok: bool, rid: &str, cid: &str) {
        let response = Response::Basic {
            rid: rid.to_string(),
            cid: cid.to_string(),
            ok,
        };
        if let Err(err) = self.writer.send(&response) {
            warn!("failed to write response: {}", err);
        }
    }

    /// Dispatches one decoded request. An `Err` means the connection is no
    /// longer trustworthy and must be torn down.
    pub(crate) fn handle(&self, request: Request) -> Result<()> {
        debug!("dispatching {:?}", request);
        match request {
            Request::OpenChannel { rid, cid } => {
                let ok = self.channels.open_channel(
                    &cid,
                    self.writer.clone(),
                    Arc::clone(&self.host),
                    Arc::clone(&self.consumers),
                    Arc::clone(&self.pool),
                );
                if !ok {
                    error!("duplicate channel id {}", cid);
                }
                self.respond(ok, &rid, &cid);
                Ok(())
            }
            Request::CloseChannel { rid, cid } => {
                self.channels.close_channel(&cid);
                self.respond(true, &rid, &cid);
                Ok(())
            }
            Request::DeclareExchange {
                rid,
                cid,
                name,
                exchange_type,
                durable,
                auto_delete,
                args,
            } => {
                let channel = self.channel(&rid, &cid)?;
                channel.declare_exchange(&rid, &name, exchange_type, durable, auto_delete, args);
                Ok(())
            }
            Request::DeleteExchange { rid, cid, name } => {
                let channel = self.channel(&rid, &cid)?;
                channel.delete_exchange(&rid, &name);
                Ok(())
            }
            Request::DeclareQueue {
                rid,
                cid,
                name,
                durable,
                exclusive,
                auto_delete,
                args,
            } => {
                let channel = self.channel(&rid, &cid)?;
                channel.declare_queue(&rid, &name, durable, exclusive, auto_delete, args);
                Ok(())
            }
            Request::DeleteQueue { rid, cid, name } => {
                let channel = self.channel(&rid, &cid)?;
                channel.delete_queue(&rid, &name);
                Ok(())
            }
            Request::QueueBind {
                rid,
                cid,
                exchange,
                queue,
                binding_key,
            } => {
                let channel = self.channel(&rid, &cid)?;
                channel.queue_bind(&rid, &exchange, &queue, &binding_key);
                Ok(())
            }
            Request::QueueUnbind {
                rid,
                cid,
                exchange,
                queue,
            } => {
                let channel = self.channel(&rid, &cid)?;
                channel.queue_unbind(&rid, &exchange, &queue);
                Ok(())
            }
            Request::BasicPublish {
                rid,
                cid,
                exchange,
                properties,
                body,
            } => {
                let channel = self.channel(&rid, &cid)?;
                channel.basic_publish(&rid, &exchange, properties, body);
                Ok(())
            }
            Request::BasicAck {
                rid,
                cid,
                queue,
                msg_id,
            } => {
                let channel = self.channel(&rid, &cid)?;
                channel.basic_ack(&rid, &queue, &msg_id);
                Ok(())
            }
            Request::BasicConsume {
                rid,
                cid,
                queue,
                consumer_tag,
                auto_ack,
            } => {
                let channel = self.channel(&rid, &cid)?;
                channel.basic_consume(&rid, &queue, &consumer_tag, auto_ack);
                Ok(())
            }
            Request::BasicCancel {
                rid,
                cid,
                queue,
                consumer_tag,
            } => {
                let channel = self.channel(&rid, &cid)?;
                channel.basic_cancel(&rid, &queue, &consumer_tag);
                Ok(())
            }
        }
    }

    pub(crate) fn close(&self) {
        self.writer.shutdown();
    }

    fn channel(&self, rid: &str, cid: &str) -> Result<Arc<crate::channel::Channel>> {
        match self.channels.get(cid) {
            Some(channel) => Ok(channel),
            None => {
                error!("request for unknown channel {}", cid);
                self.respond(false, rid, cid);
                UnknownChannelSnafu { cid }.fail()
            }
        }
    }
}

/// Live connections keyed by an id assigned at accept time.
pub(crate) struct ConnectionManager {
    conns: Mutex<HashMap<u64, Arc<Connection>>>,
}

impl ConnectionManager {
    pub(crate) fn new() -> ConnectionManager {
        ConnectionManager {
            conns: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn add(&self, id: u64, connection: Arc<Connection>) {
        self.conns.lock().unwrap().insert(id, connection);
    }

    pub(crate) fn remove(&self, id: u64) {
        self.conns.lock().unwrap().remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.conns.lock().unwrap().len()
    }
}
