//! Demo consumer: subscribes to the demo queue and prints every delivery,
//! acknowledging each one.

use quillmq::client::Client;
use quillmq::{ExchangeType, FieldTable, Result};
use std::env;

fn main() -> Result<()> {
    env_logger::init();
    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:6672".to_string());

    let client = Client::connect(&addr)?;
    let channel = client.open_channel()?;
    channel.declare_exchange("exchange1", ExchangeType::Topic, true, false, FieldTable::new())?;
    channel.declare_queue("queue1", true, false, false, FieldTable::new())?;
    channel.queue_bind("exchange1", "queue1", "news.music.#")?;

    let consumer = channel.basic_consume("queue1", "demo-consumer", false)?;
    println!("waiting for messages on queue1, ctrl-c to quit");
    for delivery in consumer.receiver().iter() {
        println!(
            "[{}] {}",
            delivery.properties.routing_key,
            String::from_utf8_lossy(&delivery.body)
        );
        channel.basic_ack("queue1", &delivery.properties.id)?;
    }
    Ok(())
}
