//! The record types exchanged between clients and the broker, plus the
//! message types shared by the broker core. Every frame carries exactly one
//! `Request` or `Response`; the codec dispatches on the enum tag rather than
//! on open polymorphism.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Free-form per-entity arguments, stored as opaque strings. Keys and values
/// must not contain `=` or `&` (they are serialized as `k=v&k=v…`).
pub type FieldTable = HashMap<String, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeType {
    Unknown,
    Direct,
    Fanout,
    Topic,
}

impl ExchangeType {
    pub(crate) fn as_db(self) -> i64 {
        match self {
            ExchangeType::Unknown => 0,
            ExchangeType::Direct => 1,
            ExchangeType::Fanout => 2,
            ExchangeType::Topic => 3,
        }
    }

    pub(crate) fn from_db(value: i64) -> ExchangeType {
        match value {
            1 => ExchangeType::Direct,
            2 => ExchangeType::Fanout,
            3 => ExchangeType::Topic,
            _ => ExchangeType::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    Unknown,
    Undurable,
    Durable,
}

impl Default for DeliveryMode {
    fn default() -> DeliveryMode {
        DeliveryMode::Unknown
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicProperties {
    pub id: String,
    pub delivery_mode: DeliveryMode,
    pub routing_key: String,
}

impl BasicProperties {
    pub fn with_routing_key<S: Into<String>>(routing_key: S) -> BasicProperties {
        BasicProperties {
            routing_key: routing_key.into(),
            ..BasicProperties::default()
        }
    }
}

/// A materialized message as it moves through a queue's pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    OpenChannel {
        rid: String,
        cid: String,
    },
    CloseChannel {
        rid: String,
        cid: String,
    },
    DeclareExchange {
        rid: String,
        cid: String,
        name: String,
        exchange_type: ExchangeType,
        durable: bool,
        auto_delete: bool,
        args: FieldTable,
    },
    DeleteExchange {
        rid: String,
        cid: String,
        name: String,
    },
    DeclareQueue {
        rid: String,
        cid: String,
        name: String,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        args: FieldTable,
    },
    DeleteQueue {
        rid: String,
        cid: String,
        name: String,
    },
    QueueBind {
        rid: String,
        cid: String,
        exchange: String,
        queue: String,
        binding_key: String,
    },
    QueueUnbind {
        rid: String,
        cid: String,
        exchange: String,
        queue: String,
    },
    BasicPublish {
        rid: String,
        cid: String,
        exchange: String,
        properties: Option<BasicProperties>,
        body: Vec<u8>,
    },
    BasicAck {
        rid: String,
        cid: String,
        queue: String,
        msg_id: String,
    },
    BasicConsume {
        rid: String,
        cid: String,
        queue: String,
        consumer_tag: String,
        auto_ack: bool,
    },
    BasicCancel {
        rid: String,
        cid: String,
        queue: String,
        consumer_tag: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Basic {
        rid: String,
        cid: String,
        ok: bool,
    },
    /// Server-initiated push to a consumer.
    Deliver {
        cid: String,
        consumer_tag: String,
        properties: BasicProperties,
        body: Vec<u8>,
    },
}

/// Serializes an args table for the metadata store. Keys are sorted so the
/// stored form is stable across processes.
pub(crate) fn encode_args(args: &FieldTable) -> String {
    let mut pairs: Vec<_> = args.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    let encoded: Vec<String> = pairs
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    encoded.join("&")
}

pub(crate) fn parse_args(raw: &str) -> FieldTable {
    let mut args = FieldTable::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => {
                args.insert(key.to_string(), value.to_string());
            }
            None => {
                args.insert(pair.to_string(), String::new());
            }
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_round_trip() {
        let mut args = FieldTable::new();
        args.insert("x-mode".to_string(), "lazy".to_string());
        args.insert("owner".to_string(), "demo".to_string());
        let encoded = encode_args(&args);
        assert_eq!(encoded, "owner=demo&x-mode=lazy");
        assert_eq!(parse_args(&encoded), args);
    }

    #[test]
    fn empty_args_encode_to_empty_string() {
        let args = FieldTable::new();
        assert_eq!(encode_args(&args), "");
        assert!(parse_args("").is_empty());
    }

    #[test]
    fn exchange_type_db_round_trip() {
        for exchange_type in [
            ExchangeType::Unknown,
            ExchangeType::Direct,
            ExchangeType::Fanout,
            ExchangeType::Topic,
        ] {
            assert_eq!(ExchangeType::from_db(exchange_type.as_db()), exchange_type);
        }
        assert_eq!(ExchangeType::from_db(42), ExchangeType::Unknown);
    }
}
