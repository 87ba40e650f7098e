//! End-to-end scenarios over a live socket: a broker on an ephemeral port,
//! driven by the blocking client.

use quillmq::client::Client;
use quillmq::{
    read_frame, write_frame, BasicProperties, Broker, BrokerConfig, ExchangeType, FieldTable,
    Request, Response,
};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE: Duration = Duration::from_millis(300);

fn start_broker(workers: usize) -> (SocketAddr, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = BrokerConfig {
        listen: "127.0.0.1:0".to_string(),
        base_dir: dir.path().to_path_buf(),
        workers,
    };
    let broker = Broker::bind(&config).unwrap();
    let addr = broker.local_addr().unwrap();
    thread::spawn(move || {
        let _ = broker.run();
    });
    (addr, dir)
}

#[test]
fn topic_publish_reaches_only_matching_queues() {
    let (addr, _dir) = start_broker(2);
    let client = Client::connect(addr).unwrap();

    let admin = client.open_channel().unwrap();
    assert!(admin
        .declare_exchange("e1", ExchangeType::Topic, true, false, FieldTable::new())
        .unwrap());
    assert!(admin.declare_queue("q1", true, false, false, FieldTable::new()).unwrap());
    assert!(admin.declare_queue("q2", true, false, false, FieldTable::new()).unwrap());
    assert!(admin.queue_bind("e1", "q1", "queue1").unwrap());
    assert!(admin.queue_bind("e1", "q2", "news.music.#").unwrap());

    let ch1 = client.open_channel().unwrap();
    let c1 = ch1.basic_consume("q1", "c1", true).unwrap();
    let ch2 = client.open_channel().unwrap();
    let c2 = ch2.basic_consume("q2", "c2", true).unwrap();

    let properties = BasicProperties::with_routing_key("news.music.pop");
    assert!(admin.basic_publish("e1", properties, b"play".to_vec()).unwrap());

    let delivery = c2.receiver().recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(delivery.body, b"play");
    assert_eq!(delivery.consumer_tag, "c2");
    assert_eq!(delivery.properties.routing_key, "news.music.pop");
    assert!(c1.receiver().recv_timeout(SILENCE).is_err());
}

#[test]
fn direct_exchange_matches_on_exact_key() {
    let (addr, _dir) = start_broker(2);
    let client = Client::connect(addr).unwrap();

    let admin = client.open_channel().unwrap();
    assert!(admin
        .declare_exchange("e1", ExchangeType::Direct, false, false, FieldTable::new())
        .unwrap());
    assert!(admin.declare_queue("q1", false, false, false, FieldTable::new()).unwrap());
    assert!(admin.queue_bind("e1", "q1", "q1").unwrap());

    let ch1 = client.open_channel().unwrap();
    let c1 = ch1.basic_consume("q1", "c1", true).unwrap();

    assert!(admin
        .basic_publish("e1", BasicProperties::with_routing_key("q1"), b"hit".to_vec())
        .unwrap());
    assert!(admin
        .basic_publish("e1", BasicProperties::with_routing_key("q2"), b"miss".to_vec())
        .unwrap());

    let delivery = c1.receiver().recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(delivery.body, b"hit");
    assert!(c1.receiver().recv_timeout(SILENCE).is_err());
}

#[test]
fn two_consumers_split_the_queue_round_robin() {
    // one worker makes the delivery order deterministic
    let (addr, _dir) = start_broker(1);
    let client = Client::connect(addr).unwrap();

    let admin = client.open_channel().unwrap();
    assert!(admin
        .declare_exchange("rr", ExchangeType::Direct, false, false, FieldTable::new())
        .unwrap());
    assert!(admin.declare_queue("qrr", false, false, false, FieldTable::new()).unwrap());
    assert!(admin.queue_bind("rr", "qrr", "qrr").unwrap());

    let ch_a = client.open_channel().unwrap();
    let consumer_a = ch_a.basic_consume("qrr", "a", true).unwrap();
    let ch_b = client.open_channel().unwrap();
    let consumer_b = ch_b.basic_consume("qrr", "b", true).unwrap();

    for body in [b"m1", b"m2", b"m3", b"m4"] {
        assert!(admin
            .basic_publish("rr", BasicProperties::with_routing_key("qrr"), body.to_vec())
            .unwrap());
    }

    let a_bodies: Vec<Vec<u8>> = (0..2)
        .map(|_| consumer_a.receiver().recv_timeout(RECV_TIMEOUT).unwrap().body)
        .collect();
    let b_bodies: Vec<Vec<u8>> = (0..2)
        .map(|_| consumer_b.receiver().recv_timeout(RECV_TIMEOUT).unwrap().body)
        .collect();
    assert_eq!(a_bodies, [b"m1".to_vec(), b"m3".to_vec()]);
    assert_eq!(b_bodies, [b"m2".to_vec(), b"m4".to_vec()]);
    assert!(consumer_a.receiver().recv_timeout(SILENCE).is_err());
    assert!(consumer_b.receiver().recv_timeout(SILENCE).is_err());
}

#[test]
fn consume_with_manual_ack_round_trips() {
    let (addr, _dir) = start_broker(2);
    let client = Client::connect(addr).unwrap();

    let admin = client.open_channel().unwrap();
    assert!(admin
        .declare_exchange("e1", ExchangeType::Fanout, true, false, FieldTable::new())
        .unwrap());
    assert!(admin.declare_queue("q1", true, false, false, FieldTable::new()).unwrap());
    assert!(admin.queue_bind("e1", "q1", "any").unwrap());

    let ch1 = client.open_channel().unwrap();
    let c1 = ch1.basic_consume("q1", "c1", false).unwrap();
    assert!(admin
        .basic_publish("e1", BasicProperties::with_routing_key("k"), b"work".to_vec())
        .unwrap());

    let delivery = c1.receiver().recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(delivery.body, b"work");
    assert!(ch1.basic_ack("q1", &delivery.properties.id).unwrap());
}

#[test]
fn broker_refuses_bad_requests() {
    let (addr, _dir) = start_broker(2);
    let client = Client::connect(addr).unwrap();
    let admin = client.open_channel().unwrap();

    // publish to an exchange that does not exist
    assert!(!admin
        .basic_publish("nope", BasicProperties::with_routing_key("k"), b"x".to_vec())
        .unwrap());

    assert!(admin
        .declare_exchange("e1", ExchangeType::Topic, false, false, FieldTable::new())
        .unwrap());
    assert!(admin.declare_queue("q1", false, false, false, FieldTable::new()).unwrap());
    // illegal binding keys are refused
    assert!(!admin.queue_bind("e1", "q1", "#.#").unwrap());
    assert!(!admin.queue_bind("e1", "q1", "bad key").unwrap());
    // binding against a missing endpoint is refused
    assert!(!admin.queue_bind("e1", "missing", "k").unwrap());

    // consuming a missing queue is refused
    let ch = client.open_channel().unwrap();
    assert!(ch.basic_consume("missing", "c", true).is_err());
    // a channel holds at most one consumer
    let c1 = ch.basic_consume("q1", "c1", true).unwrap();
    assert!(ch.basic_consume("q1", "c2", true).is_err());
    drop(c1);

    // duplicate consumer tags within a queue are refused
    let other = client.open_channel().unwrap();
    assert!(other.basic_consume("q1", "c1", true).is_err());
}

#[test]
fn cancelled_consumer_stops_receiving() {
    let (addr, _dir) = start_broker(2);
    let client = Client::connect(addr).unwrap();

    let admin = client.open_channel().unwrap();
    assert!(admin
        .declare_exchange("e1", ExchangeType::Fanout, false, false, FieldTable::new())
        .unwrap());
    assert!(admin.declare_queue("q1", false, false, false, FieldTable::new()).unwrap());
    assert!(admin.queue_bind("e1", "q1", "k").unwrap());

    let ch1 = client.open_channel().unwrap();
    let c1 = ch1.basic_consume("q1", "c1", true).unwrap();
    assert!(admin
        .basic_publish("e1", BasicProperties::with_routing_key("k"), b"first".to_vec())
        .unwrap());
    let delivery = c1.receiver().recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(delivery.body, b"first");

    assert!(ch1.basic_cancel(c1).unwrap());
    assert!(admin
        .basic_publish("e1", BasicProperties::with_routing_key("k"), b"second".to_vec())
        .unwrap());
    // nothing is pushed to this channel anymore; the message stays queued
    // until another consumer subscribes
    let c2_channel = client.open_channel().unwrap();
    let c2 = c2_channel.basic_consume("q1", "c2", true).unwrap();
    let delivery = c2.receiver().recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(delivery.body, b"second");
}

#[test]
fn subscribing_drains_a_backlog() {
    let (addr, _dir) = start_broker(2);
    let client = Client::connect(addr).unwrap();

    let admin = client.open_channel().unwrap();
    assert!(admin
        .declare_exchange("e1", ExchangeType::Fanout, false, false, FieldTable::new())
        .unwrap());
    assert!(admin.declare_queue("q1", false, false, false, FieldTable::new()).unwrap());
    assert!(admin.queue_bind("e1", "q1", "k").unwrap());

    // publish before anyone subscribes
    for i in 0u8..3 {
        assert!(admin
            .basic_publish("e1", BasicProperties::with_routing_key("k"), vec![i])
            .unwrap());
    }

    let ch1 = client.open_channel().unwrap();
    let c1 = ch1.basic_consume("q1", "c1", true).unwrap();
    let bodies: Vec<Vec<u8>> = (0..3)
        .map(|_| c1.receiver().recv_timeout(RECV_TIMEOUT).unwrap().body)
        .collect();
    assert_eq!(bodies, [vec![0], vec![1], vec![2]]);
}

#[test]
fn unknown_channel_gets_a_false_response_then_teardown() {
    let (addr, _dir) = start_broker(2);
    let mut stream = TcpStream::connect(addr).unwrap();
    let request = Request::DeclareQueue {
        rid: "r1".to_string(),
        cid: "no-such-channel".to_string(),
        name: "q1".to_string(),
        durable: false,
        exclusive: false,
        auto_delete: false,
        args: FieldTable::new(),
    };
    write_frame(&mut stream, &request).unwrap();
    let response: Response = read_frame(&mut stream).unwrap().unwrap();
    assert_eq!(
        response,
        Response::Basic {
            rid: "r1".to_string(),
            cid: "no-such-channel".to_string(),
            ok: false,
        }
    );
    // the broker tears the connection down afterwards
    let next = read_frame::<_, Response>(&mut stream);
    assert!(matches!(next, Ok(None) | Err(_)));
}
