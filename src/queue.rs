//! Queue entities. Same mapper/manager split as exchanges; the message
//! pipeline for a queue lives in `message_store`, not here.

use crate::errors::{Result, StoreSnafu};
use crate::protocol::{encode_args, parse_args, FieldTable};
use log::error;
use rusqlite::{params, Connection};
use snafu::ResultExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug)]
pub struct Queue {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub args: FieldTable,
}

pub type QueueMap = HashMap<String, Arc<Queue>>;

pub(crate) struct QueueMapper {
    conn: Mutex<Connection>,
}

impl QueueMapper {
    pub(crate) fn open(dbfile: &Path) -> Result<QueueMapper> {
        let conn = Connection::open(dbfile).context(StoreSnafu)?;
        let mapper = QueueMapper {
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
                "create table if not exists queue(
                     name varchar(32) primary key,
                     durable tinyint,
                     exclusive tinyint,
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
            .execute("drop table if exists queue", []);
        if let Err(err) = ret {
            error!("failed to drop queue table: {}", err);
            return false;
        }
        true
    }

    pub(crate) fn insert(&self, queue: &Queue) -> bool {
        let ret = self.conn.lock().unwrap().execute(
            "insert into queue values (?1, ?2, ?3, ?4, ?5)",
            params![
                queue.name,
                queue.durable,
                queue.exclusive,
                queue.auto_delete,
                encode_args(&queue.args),
            ],
        );
        if let Err(err) = ret {
            error!("failed to insert queue {}: {}", queue.name, err);
            return false;
        }
        true
    }

    pub(crate) fn remove(&self, name: &str) -> bool {
        let ret = self
            .conn
            .lock()
            .unwrap()
            .execute("delete from queue where name = ?1", params![name]);
        if let Err(err) = ret {
            error!("failed to delete queue {}: {}", name, err);
            return false;
        }
        true
    }

    pub(crate) fn recovery(&self) -> QueueMap {
        let conn = self.conn.lock().unwrap();
        let mut result = QueueMap::new();
        let mut stmt = match conn.prepare("select name, durable, exclusive, auto_delete, args from queue") {
            Ok(stmt) => stmt,
            Err(err) => {
                error!("failed to scan queue table: {}", err);
                return result;
            }
        };
        let rows = stmt.query_map([], |row| {
            Ok(Queue {
                name: row.get(0)?,
                durable: row.get(1)?,
                exclusive: row.get(2)?,
                auto_delete: row.get(3)?,
                args: parse_args(&row.get::<_, String>(4)?),
            })
        });
        match rows {
            Ok(rows) => {
                for queue in rows.flatten() {
                    result.insert(queue.name.clone(), Arc::new(queue));
                }
            }
            Err(err) => error!("failed to scan queue table: {}", err),
        }
        result
    }
}

pub(crate) struct QueueManager {
    mapper: QueueMapper,
    queues: Mutex<QueueMap>,
}

impl QueueManager {
    pub(crate) fn open(dbfile: &Path) -> Result<QueueManager> {
        let mapper = QueueMapper::open(dbfile)?;
        let queues = Mutex::new(mapper.recovery());
        Ok(QueueManager { mapper, queues })
    }

    pub(crate) fn declare(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        args: FieldTable,
    ) -> bool {
        let mut queues = self.queues.lock().unwrap();
        if queues.contains_key(name) {
            return true;
        }
        let queue = Queue {
            name: name.to_string(),
            durable,
            exclusive,
            auto_delete,
            args,
        };
        if durable && !self.mapper.insert(&queue) {
            return false;
        }
        queues.insert(name.to_string(), Arc::new(queue));
        true
    }

    pub(crate) fn delete(&self, name: &str) {
        let mut queues = self.queues.lock().unwrap();
        let Some(queue) = queues.remove(name) else {
            return;
        };
        if queue.durable {
            self.mapper.remove(name);
        }
    }

    pub(crate) fn select(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn exists(&self, name: &str) -> bool {
        self.queues.lock().unwrap().contains_key(name)
    }

    pub(crate) fn all(&self) -> QueueMap {
        self.queues.lock().unwrap().clone()
    }

    pub(crate) fn clear(&self) {
        let mut queues = self.queues.lock().unwrap();
        self.mapper.drop_table();
        if let Err(err) = self.mapper.create_table() {
            error!("failed to recreate queue table: {}", err);
        }
        queues.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_manager(dir: &TempDir) -> QueueManager {
        QueueManager::open(&dir.path().join("meta.db")).unwrap()
    }

    #[test]
    fn declare_and_delete() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir);
        assert!(manager.declare("q1", false, false, false, FieldTable::new()));
        assert!(manager.declare("q1", false, false, false, FieldTable::new()));
        assert_eq!(manager.all().len(), 1);
        manager.delete("q1");
        assert!(!manager.exists("q1"));
        // deleting a missing queue is a no-op
        manager.delete("q1");
    }

    #[test]
    fn only_durable_queues_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let manager = open_manager(&dir);
            assert!(manager.declare("keep", true, false, true, FieldTable::new()));
            assert!(manager.declare("lose", false, true, false, FieldTable::new()));
            assert_eq!(manager.all().len(), 2);
        }
        let manager = open_manager(&dir);
        assert!(manager.exists("keep"));
        assert!(!manager.exists("lose"));
        assert!(manager.select("keep").unwrap().auto_delete);
    }
}
