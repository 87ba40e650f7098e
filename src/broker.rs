//! The broker: accept loop, per-connection decoder threads, and the shared
//! state every connection dispatches into.

use crate::codec::{self, FrameWriter};
use crate::config::BrokerConfig;
use crate::connection::{Connection, ConnectionManager};
use crate::consumer::ConsumerManager;
use crate::errors::{IoSnafu, Result};
use crate::pool::WorkerPool;
use crate::protocol::Request;
use crate::virtual_host::VirtualHost;
use log::{info, trace, warn};
use snafu::ResultExt;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

const DB_FILE: &str = "meta.db";
const HOST_NAME: &str = "quillmq";

pub struct Broker {
    listener: TcpListener,
    host: Arc<VirtualHost>,
    consumers: Arc<ConsumerManager>,
    connections: Arc<ConnectionManager>,
    pool: Arc<WorkerPool>,
}

impl Broker {
    /// Opens the persisted state, seeds a consumer set per recovered queue,
    /// and binds the listener. Any failure here aborts startup.
    pub fn bind(config: &BrokerConfig) -> Result<Broker> {
        let host = VirtualHost::open(HOST_NAME, &config.base_dir, &config.base_dir.join(DB_FILE))?;
        let consumers = ConsumerManager::new();
        for queue in host.all_queues().keys() {
            consumers.init_queue(queue);
        }
        let listener = TcpListener::bind(&config.listen).context(IoSnafu {
            doing: "binding listener",
        })?;
        Ok(Broker {
            listener,
            host: Arc::new(host),
            consumers: Arc::new(consumers),
            connections: Arc::new(ConnectionManager::new()),
            pool: Arc::new(WorkerPool::new(config.workers)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context(IoSnafu {
            doing: "reading listener address",
        })
    }

    /// Accepts connections forever, one decoder thread per connection.
    pub fn run(self) -> Result<()> {
        info!("listening on {}", self.local_addr()?);
        let mut next_id = 0u64;
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    continue;
                }
            };
            next_id += 1;
            let id = next_id;
            match stream.peer_addr() {
                Ok(peer) => info!("connection {} from {}", id, peer),
                Err(_) => info!("connection {}", id),
            }
            let writer_stream = match stream.try_clone() {
                Ok(writer_stream) => writer_stream,
                Err(err) => {
                    warn!("connection {}: failed to clone stream: {}", id, err);
                    continue;
                }
            };
            let connection = Arc::new(Connection::new(
                FrameWriter::new(writer_stream),
                Arc::clone(&self.host),
                Arc::clone(&self.consumers),
                Arc::clone(&self.pool),
            ));
            self.connections.add(id, Arc::clone(&connection));
            let connections = Arc::clone(&self.connections);
            thread::spawn(move || {
                serve(stream, &connection);
                connections.remove(id);
                info!("connection {} closed, {} still open", id, connections.len());
            });
        }
        Ok(())
    }
}

/// Decode loop for one connection: frames in, dispatch, until the peer goes
/// away or a protocol error makes the stream untrustworthy.
fn serve(mut stream: TcpStream, connection: &Connection) {
    loop {
        let request: Request = match codec::read_frame(&mut stream) {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(err) => {
                warn!("dropping connection: {}", err);
                connection.close();
                return;
            }
        };
        trace!("decoded {:?}", request);
        if let Err(err) = connection.handle(request) {
            warn!("closing connection: {}", err);
            connection.close();
            return;
        }
    }
}
