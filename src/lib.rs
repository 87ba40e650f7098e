//! quillmq is a lightweight AMQP-style message broker: named exchanges
//! route published messages to bound queues by direct, fanout, or topic
//! matching; queues dispatch round-robin to their consumers over
//! multiplexed channels; durable entities and messages survive restarts
//! through a SQLite metadata store and per-queue append-only logs that are
//! compacted in the background.
//!
//! The crate ships the broker ([`Broker`]), its in-process core
//! ([`VirtualHost`], [`ConsumerManager`], [`router`]), and a blocking
//! [`client`] library speaking the same length-prefixed record protocol.

mod binding;
mod broker;
mod channel;
mod codec;
mod config;
mod connection;
mod consumer;
mod errors;
mod exchange;
mod message_log;
mod message_store;
mod pool;
mod protocol;
mod queue;
mod virtual_host;

pub mod client;
pub mod router;

pub use crate::binding::{Binding, QueueBindingMap};
pub use crate::broker::Broker;
pub use crate::codec::{read_frame, write_frame, FrameWriter, MAX_FRAME_LEN};
pub use crate::config::BrokerConfig;
pub use crate::consumer::{Consumer, ConsumerCallback, ConsumerManager};
pub use crate::errors::{Error, Result};
pub use crate::exchange::{Exchange, ExchangeMap};
pub use crate::pool::WorkerPool;
pub use crate::protocol::{
    BasicProperties, DeliveryMode, ExchangeType, FieldTable, Message, Request, Response,
};
pub use crate::queue::{Queue, QueueMap};
pub use crate::virtual_host::VirtualHost;
