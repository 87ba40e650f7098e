use clap::Parser;
use quillmq::{Broker, BrokerConfig};
use std::path::PathBuf;
use std::process;

/// The quillmq broker daemon.
#[derive(Debug, Parser)]
#[command(name = "quilld", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:6672")]
    listen: String,

    /// Directory holding the metadata store and queue data files.
    #[arg(long, default_value = "quillmq-data")]
    base_dir: PathBuf,

    /// Number of delivery worker threads.
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let config = BrokerConfig {
        listen: args.listen,
        base_dir: args.base_dir,
        workers: args.workers,
    };
    let broker = match Broker::bind(&config) {
        Ok(broker) => broker,
        Err(err) => {
            eprintln!("quilld: startup failed: {}", err);
            process::exit(1);
        }
    };
    if let Err(err) = broker.run() {
        eprintln!("quilld: {}", err);
        process::exit(1);
    }
}
