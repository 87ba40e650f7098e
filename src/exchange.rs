//! Exchange entities: the in-memory index plus its SQLite mapper. The
//! manager is the only mutation path; durable exchanges are mirrored into
//! the `exchange` table so they survive restarts.

use crate::errors::{Result, StoreSnafu};
use crate::protocol::{encode_args, parse_args, ExchangeType, FieldTable};
use log::error;
use rusqlite::{params, Connection};
use snafu::ResultExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug)]
pub struct Exchange {
    pub name: String,
    pub exchange_type: ExchangeType,
    pub durable: bool,
    pub auto_delete: bool,
    pub args: FieldTable,
}

pub type ExchangeMap = HashMap<String, Arc<Exchange>>;

pub(crate) struct ExchangeMapper {
    conn: Mutex<Connection>,
}

impl ExchangeMapper {
    /// Opens the store and creates the table. Failure here is fatal to
    /// startup, so it propagates instead of degrading to a boolean.
    pub(crate) fn open(dbfile: &Path) -> Result<ExchangeMapper> {
        let conn = Connection::open(dbfile).context(StoreSnafu)?;
        let mapper = ExchangeMapper {
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
                "create table if not exists exchange(
                     name varchar(32) primary key,
                     type tinyint,
                     durable tinyint,
                     auto_delete tinyint,
                     args varchar(128))",
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
            .execute("drop table if exists exchange", []);
        if let Err(err) = ret {
            error!("failed to drop exchange table: {}", err);
            return false;
        }
        true
    }

    pub(crate) fn insert(&self, exchange: &Exchange) -> bool {
        let ret = self.conn.lock().unwrap().execute(
            "insert into exchange values (?1, ?2, ?3, ?4, ?5)",
            params![
                exchange.name,
                exchange.exchange_type.as_db(),
                exchange.durable,
                exchange.auto_delete,
                encode_args(&exchange.args),
            ],
        );
        if let Err(err) = ret {
            error!("failed to insert exchange {}: {}", exchange.name, err);
            return false;
        }
        true
    }

    pub(crate) fn remove(&self, name: &str) -> bool {
        let ret = self
            .conn
            .lock()
            .unwrap()
            .execute("delete from exchange where name = ?1", params![name]);
        if let Err(err) = ret {
            error!("failed to delete exchange {}: {}", name, err);
            return false;
        }
        true
    }

    /// Full scan rebuilding the in-memory index.
    pub(crate) fn recovery(&self) -> ExchangeMap {
        let conn = self.conn.lock().unwrap();
        let mut result = ExchangeMap::new();
        let mut stmt = match conn.prepare("select name, type, durable, auto_delete, args from exchange") {
            Ok(stmt) => stmt,
            Err(err) => {
                error!("failed to scan exchange table: {}", err);
                return result;
            }
        };
        let rows = stmt.query_map([], |row| {
            Ok(Exchange {
                name: row.get(0)?,
                exchange_type: ExchangeType::from_db(row.get(1)?),
                durable: row.get(2)?,
                auto_delete: row.get(3)?,
                args: parse_args(&row.get::<_, String>(4)?),
            })
        });
        match rows {
            Ok(rows) => {
                for exchange in rows.flatten() {
                    result.insert(exchange.name.clone(), Arc::new(exchange));
                }
            }
            Err(err) => error!("failed to scan exchange table: {}", err),
        }
        result
    }
}

pub(crate) struct ExchangeManager {
    mapper: ExchangeMapper,
    exchanges: Mutex<ExchangeMap>,
}

impl ExchangeManager {
    pub(crate) fn open(dbfile: &Path) -> Result<ExchangeManager> {
        let mapper = ExchangeMapper::open(dbfile)?;
        let exchanges = Mutex::new(mapper.recovery());
        Ok(ExchangeManager { mapper, exchanges })
    }

    /// Idempotent: redeclaring an existing name succeeds without touching it.
    pub(crate) fn declare(
        &self,
        name: &str,
        exchange_type: ExchangeType,
        durable: bool,
        auto_delete: bool,
        args: FieldTable,
    ) -> bool {
        let mut exchanges = self.exchanges.lock().unwrap();
        if exchanges.contains_key(name) {
            return true;
        }
        let exchange = Exchange {
            name: name.to_string(),
            exchange_type,
            durable,
            auto_delete,
            args,
        };
        if durable && !self.mapper.insert(&exchange) {
            return false;
        }
        exchanges.insert(name.to_string(), Arc::new(exchange));
        true
    }

    pub(crate) fn delete(&self, name: &str) {
        let mut exchanges = self.exchanges.lock().unwrap();
        let Some(exchange) = exchanges.remove(name) else {
            return;
        };
        if exchange.durable {
            self.mapper.remove(name);
        }
    }

    pub(crate) fn select(&self, name: &str) -> Option<Arc<Exchange>> {
        self.exchanges.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn exists(&self, name: &str) -> bool {
        self.exchanges.lock().unwrap().contains_key(name)
    }

    pub(crate) fn clear(&self) {
        let mut exchanges = self.exchanges.lock().unwrap();
        self.mapper.drop_table();
        if let Err(err) = self.mapper.create_table() {
            error!("failed to recreate exchange table: {}", err);
        }
        exchanges.clear();
    }
}
