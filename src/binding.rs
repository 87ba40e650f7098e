//! Bindings relate an exchange to a queue under a binding key. The
//! in-memory index is exchange -> (queue -> binding); the inner map keeps
//! insertion order so publish fan-out walks bindings deterministically.

use crate::errors::{Result, StoreSnafu};
use indexmap::IndexMap;
use log::error;
use rusqlite::{params, Connection};
use snafu::ResultExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub binding_key: String,
    pub durable: bool,
}

/// queue name -> binding, for one exchange.
pub type QueueBindingMap = IndexMap<String, Arc<Binding>>;
pub(crate) type BindingMap = HashMap<String, QueueBindingMap>;

pub(crate) struct BindingMapper {
    conn: Mutex<Connection>,
}

impl BindingMapper {
    pub(crate) fn open(dbfile: &Path) -> Result<BindingMapper> {
        let conn = Connection::open(dbfile).context(StoreSnafu)?;
        let mapper = BindingMapper {
            conn: Mutex::new(conn),
        };
        mapper.create_table()?;
        Ok(mapper)
    }

    fn create_table(&self) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "create table if not exists binding(
                     exchange_name varchar(32),
                     queue_name varchar(32),
                     binding_key varchar(128))",
                [],
            )
            .context(StoreSnafu)?;
        Ok(())
    }

    fn drop_table(&self) -> bool {
        let ret = self
            .conn
            .lock()
            .unwrap()
            .execute("drop table if exists binding", []);
        if let Err(err) = ret {
            error!("failed to drop binding table: {}", err);
            return false;
        }
        true
    }

    pub(crate) fn insert(&self, binding: &Binding) -> bool {
        let ret = self.conn.lock().unwrap().execute(
            "insert into binding values (?1, ?2, ?3)",
            params![binding.exchange, binding.queue, binding.binding_key],
        );
        if let Err(err) = ret {
            error!(
                "failed to insert binding ({}, {}): {}",
                binding.exchange, binding.queue, err
            );
            return false;
        }
        true
    }

    pub(crate) fn remove(&self, exchange: &str, queue: &str) -> bool {
        let ret = self.conn.lock().unwrap().execute(
            "delete from binding where exchange_name = ?1 and queue_name = ?2",
            params![exchange, queue],
        );
        if let Err(err) = ret {
            error!("failed to delete binding ({}, {}): {}", exchange, queue, err);
            return false;
        }
        true
    }

    pub(crate) fn remove_exchange_bindings(&self, exchange: &str) -> bool {
        let ret = self.conn.lock().unwrap().execute(
            "delete from binding where exchange_name = ?1",
            params![exchange],
        );
        if let Err(err) = ret {
            error!("failed to delete bindings of exchange {}: {}", exchange, err);
            return false;
        }
        true
    }

    pub(crate) fn remove_queue_bindings(&self, queue: &str) -> bool {
        let ret = self.conn.lock().unwrap().execute(
            "delete from binding where queue_name = ?1",
            params![queue],
        );
        if let Err(err) = ret {
            error!("failed to delete bindings of queue {}: {}", queue, err);
            return false;
        }
        true
    }

    pub(crate) fn recovery(&self) -> BindingMap {
        let conn = self.conn.lock().unwrap();
        let mut result = BindingMap::new();
        let mut stmt = match conn.prepare("select exchange_name, queue_name, binding_key from binding") {
            Ok(stmt) => stmt,
            Err(err) => {
                error!("failed to scan binding table: {}", err);
                return result;
            }
        };
        let rows = stmt.query_map([], |row| {
            Ok(Binding {
                exchange: row.get(0)?,
                queue: row.get(1)?,
                binding_key: row.get(2)?,
                durable: true,
            })
        });
        match rows {
            Ok(rows) => {
                for binding in rows.flatten() {
                    result
                        .entry(binding.exchange.clone())
                        .or_default()
                        .insert(binding.queue.clone(), Arc::new(binding));
                }
            }
            Err(err) => error!("failed to scan binding table: {}", err),
        }
        result
    }
}

pub(crate) struct BindingManager {
    mapper: BindingMapper,
    bindings: Mutex<BindingMap>,
}

impl BindingManager {
    pub(crate) fn open(dbfile: &Path) -> Result<BindingManager> {
        let mapper = BindingMapper::open(dbfile)?;
        let bindings = Mutex::new(mapper.recovery());
        Ok(BindingManager { mapper, bindings })
    }

    /// At most one binding per (exchange, queue) pair; rebinding the same
    /// pair is a no-op that reports success. The binding key must already be
    /// validated (see [`crate::router::is_valid_binding_key`]).
    pub(crate) fn bind(&self, exchange: &str, queue: &str, binding_key: &str, durable: bool) -> bool {
        let mut bindings = self.bindings.lock().unwrap();
        let queue_bindings = bindings.entry(exchange.to_string()).or_default();
        if queue_bindings.contains_key(queue) {
            return true;
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            binding_key: binding_key.to_string(),
            durable,
        };
        if durable && !self.mapper.insert(&binding) {
            return false;
        }
        queue_bindings.insert(queue.to_string(), Arc::new(binding));
        true
    }

    pub(crate) fn unbind(&self, exchange: &str, queue: &str) {
        let mut bindings = self.bindings.lock().unwrap();
        let Some(queue_bindings) = bindings.get_mut(exchange) else {
            return;
        };
        let Some(binding) = queue_bindings.shift_remove(queue) else {
            return;
        };
        if binding.durable {
            self.mapper.remove(exchange, queue);
        }
    }

    pub(crate) fn remove_exchange_bindings(&self, exchange: &str) {
        let mut bindings = self.bindings.lock().unwrap();
        self.mapper.remove_exchange_bindings(exchange);
        bindings.remove(exchange);
    }

    pub(crate) fn remove_queue_bindings(&self, queue: &str) {
        let mut bindings = self.bindings.lock().unwrap();
        self.mapper.remove_queue_bindings(queue);
        for queue_bindings in bindings.values_mut() {
            queue_bindings.shift_remove(queue);
        }
    }

    pub(crate) fn exchange_bindings(&self, exchange: &str) -> QueueBindingMap {
        self.bindings
            .lock()
            .unwrap()
            .get(exchange)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn get(&self, exchange: &str, queue: &str) -> Option<Arc<Binding>> {
        self.bindings
            .lock()
            .unwrap()
            .get(exchange)
            .and_then(|queue_bindings| queue_bindings.get(queue))
            .cloned()
    }

    pub(crate) fn exists(&self, exchange: &str, queue: &str) -> bool {
        self.get(exchange, queue).is_some()
    }

    pub(crate) fn clear(&self) {
        let mut bindings = self.bindings.lock().unwrap();
        self.mapper.drop_table();
        if let Err(err) = self.mapper.create_table() {
            error!("failed to recreate binding table: {}", err);
        }
        bindings.clear();
    }
}
