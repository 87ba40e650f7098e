//! Blocking client for the broker. A [`Client`] owns the socket and a
//! reader thread that demultiplexes incoming frames: `basicResponse`
//! records complete the RPC waiting on their request id, `basicConsume`
//! pushes land in the consuming channel's delivery queue.
//!
//! ```no_run
//! use quillmq::client::Client;
//! use quillmq::{BasicProperties, ExchangeType, FieldTable};
//!
//! # fn main() -> quillmq::Result<()> {
//! let client = Client::connect("127.0.0.1:6672")?;
//! let channel = client.open_channel()?;
//! channel.declare_exchange("events", ExchangeType::Topic, true, false, FieldTable::new())?;
//! channel.declare_queue("inbox", true, false, false, FieldTable::new())?;
//! channel.queue_bind("events", "inbox", "news.#")?;
//! channel.basic_publish("events", BasicProperties::with_routing_key("news.music.pop"), b"hi".to_vec())?;
//! # Ok(())
//! # }
//! ```

use crate::codec::{self, FrameWriter};
use crate::errors::{Error, IoSnafu, Result};
use crate::protocol::{BasicProperties, ExchangeType, FieldTable, Request, Response};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::warn;
use snafu::ResultExt;
use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread;
use uuid::Uuid;

/// One pushed message, as received by a consumer.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub consumer_tag: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

struct ClientShared {
    writer: FrameWriter,
    pending: Mutex<HashMap<String, Sender<bool>>>,
    deliveries: Mutex<HashMap<String, Sender<Delivery>>>,
}

pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Client> {
        let stream = TcpStream::connect(addr).context(IoSnafu {
            doing: "connecting to broker",
        })?;
        let reader = stream.try_clone().context(IoSnafu {
            doing: "cloning broker stream",
        })?;
        let shared = Arc::new(ClientShared {
            writer: FrameWriter::new(stream),
            pending: Mutex::new(HashMap::new()),
            deliveries: Mutex::new(HashMap::new()),
        });
        let reader_shared = Arc::clone(&shared);
        thread::spawn(move || reader_loop(reader, &reader_shared));
        Ok(Client { shared })
    }

    /// Opens a channel with a fresh id. Refusal (a duplicate id) is an
    /// error here rather than a boolean, since the caller cannot use the
    /// channel either way.
    pub fn open_channel(&self) -> Result<Channel> {
        let channel = Channel {
            cid: Uuid::new_v4().to_string(),
            shared: Arc::clone(&self.shared),
            closed: false,
        };
        let rid = Uuid::new_v4().to_string();
        let ok = channel.rpc(
            Request::OpenChannel {
                rid: rid.clone(),
                cid: channel.cid.clone(),
            },
            &rid,
        )?;
        if !ok {
            return Err(Error::Refused);
        }
        Ok(channel)
    }

    pub fn close(self) {
        self.shared.writer.shutdown();
    }
}

fn reader_loop(mut stream: TcpStream, shared: &ClientShared) {
    loop {
        match codec::read_frame::<_, Response>(&mut stream) {
            Ok(Some(Response::Basic { rid, ok, .. })) => {
                let tx = shared.pending.lock().unwrap().remove(&rid);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(ok);
                    }
                    None => warn!("response for unknown request {}", rid),
                }
            }
            Ok(Some(Response::Deliver {
                cid,
                consumer_tag,
                properties,
                body,
            })) => {
                let tx = shared.deliveries.lock().unwrap().get(&cid).cloned();
                match tx {
                    Some(tx) => {
                        let _ = tx.send(Delivery {
                            consumer_tag,
                            properties,
                            body,
                        });
                    }
                    None => warn!("delivery for unknown channel {}", cid),
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!("client reader exiting: {}", err);
                break;
            }
        }
    }
    // dropping the senders unblocks every RPC waiter and ends every
    // consumer's receive loop
    shared.pending.lock().unwrap().clear();
    shared.deliveries.lock().unwrap().clear();
}

/// A session on the broker connection. Every method is a blocking RPC
/// returning the broker's `ok` flag; transport failures are errors.
pub struct Channel {
    cid: String,
    shared: Arc<ClientShared>,
    closed: bool,
}

impl Channel {
    pub fn id(&self) -> &str {
        &self.cid
    }

    fn rpc(&self, request: Request, rid: &str) -> Result<bool> {
        let (tx, rx) = bounded(1);
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(rid.to_string(), tx);
        if let Err(err) = self.shared.writer.send(&request) {
            self.shared.pending.lock().unwrap().remove(rid);
            return Err(err);
        }
        // the sender is dropped if the reader thread dies first
        rx.recv().map_err(|_| Error::ClientDropped)
    }

    pub fn declare_exchange(
        &self,
        name: &str,
        exchange_type: ExchangeType,
        durable: bool,
        auto_delete: bool,
        args: FieldTable,
    ) -> Result<bool> {
        let rid = Uuid::new_v4().to_string();
        self.rpc(
            Request::DeclareExchange {
                rid: rid.clone(),
                cid: self.cid.clone(),
                name: name.to_string(),
                exchange_type,
                durable,
                auto_delete,
                args,
            },
            &rid,
        )
    }

    pub fn delete_exchange(&self, name: &str) -> Result<bool> {
        let rid = Uuid::new_v4().to_string();
        self.rpc(
            Request::DeleteExchange {
                rid: rid.clone(),
                cid: self.cid.clone(),
                name: name.to_string(),
            },
            &rid,
        )
    }

    pub fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        args: FieldTable,
    ) -> Result<bool> {
        let rid = Uuid::new_v4().to_string();
        self.rpc(
            Request::DeclareQueue {
                rid: rid.clone(),
                cid: self.cid.clone(),
                name: name.to_string(),
                durable,
                exclusive,
                auto_delete,
                args,
            },
            &rid,
        )
    }

    pub fn delete_queue(&self, name: &str) -> Result<bool> {
        let rid = Uuid::new_v4().to_string();
        self.rpc(
            Request::DeleteQueue {
                rid: rid.clone(),
                cid: self.cid.clone(),
                name: name.to_string(),
            },
            &rid,
        )
    }

    pub fn queue_bind(&self, exchange: &str, queue: &str, binding_key: &str) -> Result<bool> {
        let rid = Uuid::new_v4().to_string();
        self.rpc(
            Request::QueueBind {
                rid: rid.clone(),
                cid: self.cid.clone(),
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                binding_key: binding_key.to_string(),
            },
            &rid,
        )
    }

    pub fn queue_unbind(&self, exchange: &str, queue: &str) -> Result<bool> {
        let rid = Uuid::new_v4().to_string();
        self.rpc(
            Request::QueueUnbind {
                rid: rid.clone(),
                cid: self.cid.clone(),
                exchange: exchange.to_string(),
                queue: queue.to_string(),
            },
            &rid,
        )
    }

    pub fn basic_publish(
        &self,
        exchange: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<bool> {
        let rid = Uuid::new_v4().to_string();
        self.rpc(
            Request::BasicPublish {
                rid: rid.clone(),
                cid: self.cid.clone(),
                exchange: exchange.to_string(),
                properties: Some(properties),
                body,
            },
            &rid,
        )
    }

    pub fn basic_ack(&self, queue: &str, msg_id: &str) -> Result<bool> {
        let rid = Uuid::new_v4().to_string();
        self.rpc(
            Request::BasicAck {
                rid: rid.clone(),
                cid: self.cid.clone(),
                queue: queue.to_string(),
                msg_id: msg_id.to_string(),
            },
            &rid,
        )
    }

    /// Subscribes this channel to a queue. At most one consumer per
    /// channel; the broker refuses a second subscription.
    pub fn basic_consume(&self, queue: &str, consumer_tag: &str, auto_ack: bool) -> Result<Consumer> {
        let (tx, rx) = unbounded();
        {
            // register the delivery route before asking: the broker may
            // push a backlog ahead of the consume response
            let mut deliveries = self.shared.deliveries.lock().unwrap();
            if deliveries.contains_key(&self.cid) {
                return Err(Error::Refused);
            }
            deliveries.insert(self.cid.clone(), tx);
        }
        let rid = Uuid::new_v4().to_string();
        let ok = self.rpc(
            Request::BasicConsume {
                rid: rid.clone(),
                cid: self.cid.clone(),
                queue: queue.to_string(),
                consumer_tag: consumer_tag.to_string(),
                auto_ack,
            },
            &rid,
        )?;
        if !ok {
            self.shared.deliveries.lock().unwrap().remove(&self.cid);
            return Err(Error::Refused);
        }
        Ok(Consumer {
            tag: consumer_tag.to_string(),
            queue: queue.to_string(),
            receiver: rx,
        })
    }

    pub fn basic_cancel(&self, consumer: Consumer) -> Result<bool> {
        self.shared.deliveries.lock().unwrap().remove(&self.cid);
        let rid = Uuid::new_v4().to_string();
        self.rpc(
            Request::BasicCancel {
                rid: rid.clone(),
                cid: self.cid.clone(),
                queue: consumer.queue.clone(),
                consumer_tag: consumer.tag.clone(),
            },
            &rid,
        )
    }

    pub fn close(mut self) -> Result<bool> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<bool> {
        if self.closed {
            return Ok(true);
        }
        self.closed = true;
        self.shared.deliveries.lock().unwrap().remove(&self.cid);
        let rid = Uuid::new_v4().to_string();
        self.rpc(
            Request::CloseChannel {
                rid: rid.clone(),
                cid: self.cid.clone(),
            },
            &rid,
        )
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}

/// A subscription handle. Deliveries arrive on [`Consumer::receiver`] in
/// the order the broker pushed them for this channel.
pub struct Consumer {
    tag: String,
    queue: String,
    receiver: Receiver<Delivery>,
}

impl Consumer {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn receiver(&self) -> &Receiver<Delivery> {
        &self.receiver
    }
}
