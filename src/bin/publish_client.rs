//! Demo publisher: declares the demo topology and publishes each
//! command-line argument as one message body.

use quillmq::client::Client;
use quillmq::{BasicProperties, ExchangeType, FieldTable, Result};
use std::env;

fn main() -> Result<()> {
    env_logger::init();
    let mut args: Vec<String> = env::args().skip(1).collect();
    let addr = if args.first().is_some_and(|arg| arg.contains(':')) {
        args.remove(0)
    } else {
        "127.0.0.1:6672".to_string()
    };
    if args.is_empty() {
        args.push("hello world".to_string());
    }

    let client = Client::connect(&addr)?;
    let channel = client.open_channel()?;
    channel.declare_exchange("exchange1", ExchangeType::Topic, true, false, FieldTable::new())?;
    channel.declare_queue("queue1", true, false, false, FieldTable::new())?;
    channel.queue_bind("exchange1", "queue1", "news.music.#")?;

    for body in args {
        let properties = BasicProperties::with_routing_key("news.music.pop");
        let ok = channel.basic_publish("exchange1", properties, body.clone().into_bytes())?;
        println!("published {:?}: {}", body, if ok { "ok" } else { "refused" });
    }

    channel.close()?;
    client.close();
    Ok(())
}
