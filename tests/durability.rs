//! Durability and compaction scenarios, driven at the virtual-host level so
//! a broker "restart" is just dropping and reopening the host over the same
//! directory.

use quillmq::{BasicProperties, DeliveryMode, ExchangeType, FieldTable, VirtualHost};
use std::fs;
use tempfile::TempDir;

fn open_host(dir: &TempDir) -> VirtualHost {
    VirtualHost::open("test-host", dir.path(), &dir.path().join("meta.db")).unwrap()
}

fn body_for(i: u32) -> Vec<u8> {
    i.to_le_bytes().to_vec()
}

#[test]
fn restart_recovers_unacked_durable_messages_in_order() {
    let dir = TempDir::new().unwrap();
    {
        let host = open_host(&dir);
        assert!(host.declare_queue("q1", true, false, false, FieldTable::new()));
        for i in 0..5 {
            assert!(host.basic_publish("q1", None, body_for(i)));
        }
        for _ in 0..2 {
            let message = host.basic_consume("q1").unwrap();
            host.basic_ack("q1", &message.properties.id);
        }
    }
    let host = open_host(&dir);
    assert_eq!(host.queue_message_counts("q1"), Some((3, 3)));
    let bodies: Vec<Vec<u8>> = (0..3)
        .map(|_| host.basic_consume("q1").unwrap().body)
        .collect();
    assert_eq!(bodies, [body_for(2), body_for(3), body_for(4)]);
    assert!(host.basic_consume("q1").is_none());
}

#[test]
fn delivered_but_unacked_messages_come_back_after_restart() {
    let dir = TempDir::new().unwrap();
    {
        let host = open_host(&dir);
        assert!(host.declare_queue("q1", true, false, false, FieldTable::new()));
        assert!(host.basic_publish("q1", None, b"in flight".to_vec()));
        // delivered, never acked: the durable copy stays valid
        let message = host.basic_consume("q1").unwrap();
        assert_eq!(message.body, b"in flight");
    }
    let host = open_host(&dir);
    let message = host.basic_consume("q1").unwrap();
    assert_eq!(message.body, b"in flight");
}

#[test]
fn explicitly_undurable_messages_do_not_survive() {
    let dir = TempDir::new().unwrap();
    {
        let host = open_host(&dir);
        assert!(host.declare_queue("q1", true, false, false, FieldTable::new()));
        let mut transient = BasicProperties::with_routing_key("k");
        transient.delivery_mode = DeliveryMode::Undurable;
        assert!(host.basic_publish("q1", Some(transient), b"gone".to_vec()));
        assert!(host.basic_publish("q1", None, b"kept".to_vec()));
    }
    let host = open_host(&dir);
    let message = host.basic_consume("q1").unwrap();
    assert_eq!(message.body, b"kept");
    assert!(host.basic_consume("q1").is_none());
}

#[test]
fn mass_ack_compacts_the_data_file() {
    let dir = TempDir::new().unwrap();
    let data_path = dir.path().join("q1.mqd");
    {
        let host = open_host(&dir);
        assert!(host.declare_queue("q1", true, false, false, FieldTable::new()));
        for i in 0..3000 {
            assert!(host.basic_publish("q1", None, body_for(i)));
        }
        assert_eq!(host.queue_message_counts("q1"), Some((3000, 3000)));
        let size_full = fs::metadata(&data_path).unwrap().len();

        for _ in 0..1800 {
            let message = host.basic_consume("q1").unwrap();
            host.basic_ack("q1", &message.properties.id);
        }
        // compaction fired mid-sequence: the file holds fewer records than
        // were published, and exactly 1200 of them are still valid
        let (total, valid) = host.queue_message_counts("q1").unwrap();
        assert_eq!(valid, 1200);
        assert!(total < 3000);
        assert!(valid <= total);
        assert!(fs::metadata(&data_path).unwrap().len() < size_full);
    }
    // reopening compacts again: only live records remain
    let host = open_host(&dir);
    assert_eq!(host.queue_message_counts("q1"), Some((1200, 1200)));
    let bodies: Vec<Vec<u8>> = (0..1200)
        .map(|_| host.basic_consume("q1").unwrap().body)
        .collect();
    let expected: Vec<Vec<u8>> = (1800..3000).map(body_for).collect();
    assert_eq!(bodies, expected);
}

#[test]
fn durable_bindings_route_after_restart() {
    let dir = TempDir::new().unwrap();
    {
        let host = open_host(&dir);
        assert!(host.declare_exchange("e1", ExchangeType::Topic, true, false, FieldTable::new()));
        assert!(host.declare_queue("q1", true, false, false, FieldTable::new()));
        assert!(host.bind("e1", "q1", "news.#"));
    }
    let host = open_host(&dir);
    let exchange = host.select_exchange("e1").unwrap();
    assert_eq!(exchange.exchange_type, ExchangeType::Topic);
    let bindings = host.exchange_bindings("e1");
    assert_eq!(bindings.get("q1").unwrap().binding_key, "news.#");
    assert!(quillmq::router::route(
        exchange.exchange_type,
        "news.music.pop",
        &bindings.get("q1").unwrap().binding_key
    ));
}
