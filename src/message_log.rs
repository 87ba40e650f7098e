//! Per-queue append-only message log. Records are only ever written at the
//! end of the file; acknowledging a message flips its `valid` flag in place,
//! and compaction rewrites the surviving records into a temp file that
//! atomically replaces the data file.

use crate::errors::{CodecSnafu, FrameTooLargeSnafu, IoSnafu, Result};
use crate::protocol::{BasicProperties, Message};
use log::error;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub(crate) const DATA_SUFFIX: &str = ".mqd";
pub(crate) const TMP_SUFFIX: &str = ".mqd.tmp";

/// Length prefix on every record; the payload itself never exceeds a frame.
const LEN_PREFIX: u64 = 8;
const MAX_RECORD_LEN: u64 = crate::codec::MAX_FRAME_LEN;

/// The serialized form of one record. `valid` is a bool, which bincode
/// encodes as a single byte, so flipping it re-serializes to the exact same
/// length. That property is what makes in-place invalidation safe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct MessagePayload {
    pub(crate) properties: BasicProperties,
    pub(crate) body: Vec<u8>,
    pub(crate) valid: bool,
}

/// A record as it sits on disk after an append or a compaction. The offset
/// points at the payload, past the length prefix.
pub(crate) struct StoredRecord {
    pub(crate) payload: MessagePayload,
    pub(crate) offset: u64,
    pub(crate) length: u64,
}

pub(crate) struct MessageLog {
    queue: String,
    data_path: PathBuf,
    tmp_path: PathBuf,
    file: File,
}

impl MessageLog {
    pub(crate) fn open(base_dir: &Path, queue: &str) -> Result<MessageLog> {
        let data_path = base_dir.join(format!("{}{}", queue, DATA_SUFFIX));
        let tmp_path = base_dir.join(format!("{}{}", queue, TMP_SUFFIX));
        // a leftover temp file means a compaction was interrupted before the
        // rename; the data file is still authoritative
        if tmp_path.exists() {
            let _ = fs::remove_file(&tmp_path);
        }
        let file = Self::open_data_file(&data_path)?;
        Ok(MessageLog {
            queue: queue.to_string(),
            data_path,
            tmp_path,
            file,
        })
    }

    fn open_data_file(path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .context(IoSnafu {
                doing: "opening queue data file",
            })
    }

    /// Appends one record and returns its (offset, length).
    pub(crate) fn append(&mut self, payload: &MessagePayload) -> Result<(u64, u64)> {
        let body = bincode::serialize(payload).context(CodecSnafu)?;
        let end = self.file.seek(SeekFrom::End(0)).context(IoSnafu {
            doing: "seeking queue data file",
        })?;
        self.file
            .write_all(&(body.len() as u64).to_le_bytes())
            .context(IoSnafu {
                doing: "writing record length",
            })?;
        self.file.write_all(&body).context(IoSnafu {
            doing: "writing record payload",
        })?;
        Ok((end + LEN_PREFIX, body.len() as u64))
    }

    /// Flips the record at `offset` to invalid, in place. The rewritten
    /// payload must come out at its original length; a mismatch means the
    /// record schema drifted underneath the file and nothing about it can be
    /// trusted, so the process aborts.
    pub(crate) fn invalidate(&mut self, message: &Message, offset: u64, length: u64) -> Result<()> {
        let payload = MessagePayload {
            properties: message.properties.clone(),
            body: message.body.clone(),
            valid: false,
        };
        let body = bincode::serialize(&payload).context(CodecSnafu)?;
        if body.len() as u64 != length {
            error!(
                "queue {}: invalidating message {} re-serialized to {} bytes, expected {}",
                self.queue,
                message.properties.id,
                body.len(),
                length
            );
            std::process::abort();
        }
        self.file
            .seek(SeekFrom::Start(offset))
            .context(IoSnafu {
                doing: "seeking record offset",
            })?;
        self.file.write_all(&body).context(IoSnafu {
            doing: "rewriting record payload",
        })?;
        Ok(())
    }

    /// Scans the whole file and returns the valid payloads in record order.
    fn load(&mut self) -> Result<Vec<MessagePayload>> {
        self.file.seek(SeekFrom::Start(0)).context(IoSnafu {
            doing: "rewinding queue data file",
        })?;
        let mut reader = BufReader::new(&mut self.file);
        let mut result = Vec::new();
        loop {
            let mut len_buf = [0u8; 8];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
                Err(err) => {
                    return Err(err).context(IoSnafu {
                        doing: "reading record length",
                    })
                }
            }
            let len = u64::from_le_bytes(len_buf);
            ensure!(
                len <= MAX_RECORD_LEN,
                FrameTooLargeSnafu {
                    size: len,
                    limit: MAX_RECORD_LEN,
                }
            );
            let mut body = vec![0u8; len as usize];
            reader.read_exact(&mut body).context(IoSnafu {
                doing: "reading record payload",
            })?;
            let payload: MessagePayload = bincode::deserialize(&body).context(CodecSnafu)?;
            if payload.valid {
                result.push(payload);
            }
        }
        Ok(result)
    }

    /// Rewrites the file with only the valid records and returns them with
    /// their new offsets, preserving record order.
    pub(crate) fn compact(&mut self) -> Result<Vec<StoredRecord>> {
        let valid = self.load()?;
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.tmp_path)
            .context(IoSnafu {
                doing: "creating compaction temp file",
            })?;
        let mut records = Vec::with_capacity(valid.len());
        let mut offset = 0u64;
        for payload in valid {
            let body = bincode::serialize(&payload).context(CodecSnafu)?;
            tmp.write_all(&(body.len() as u64).to_le_bytes())
                .context(IoSnafu {
                    doing: "writing compacted record length",
                })?;
            tmp.write_all(&body).context(IoSnafu {
                doing: "writing compacted record payload",
            })?;
            records.push(StoredRecord {
                payload,
                offset: offset + LEN_PREFIX,
                length: body.len() as u64,
            });
            offset += LEN_PREFIX + body.len() as u64;
        }
        tmp.sync_all().context(IoSnafu {
            doing: "syncing compaction temp file",
        })?;
        drop(tmp);
        fs::remove_file(&self.data_path).context(IoSnafu {
            doing: "removing stale queue data file",
        })?;
        fs::rename(&self.tmp_path, &self.data_path).context(IoSnafu {
            doing: "renaming compaction temp file",
        })?;
        self.file = Self::open_data_file(&self.data_path)?;
        Ok(records)
    }

    pub(crate) fn size(&self) -> u64 {
        fs::metadata(&self.data_path).map(|meta| meta.len()).unwrap_or(0)
    }

    pub(crate) fn remove_files(&self) {
        let _ = fs::remove_file(&self.data_path);
        let _ = fs::remove_file(&self.tmp_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeliveryMode;
    use tempfile::TempDir;

    fn payload(id: &str, body: &[u8]) -> MessagePayload {
        MessagePayload {
            properties: BasicProperties {
                id: id.to_string(),
                delivery_mode: DeliveryMode::Durable,
                routing_key: "k".to_string(),
            },
            body: body.to_vec(),
            valid: true,
        }
    }

    fn message(payload: &MessagePayload) -> Message {
        Message {
            properties: payload.properties.clone(),
            body: payload.body.clone(),
        }
    }

    #[test]
    fn append_then_compact_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut log = MessageLog::open(dir.path(), "q1").unwrap();
        let first = payload("m1", b"one");
        let second = payload("m2", b"two");
        log.append(&first).unwrap();
        log.append(&second).unwrap();
        let records = log.compact().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload, first);
        assert_eq!(records[1].payload, second);
        assert_eq!(records[0].offset, LEN_PREFIX);
    }

    #[test]
    fn invalidated_records_are_dropped_by_compaction() {
        let dir = TempDir::new().unwrap();
        let mut log = MessageLog::open(dir.path(), "q1").unwrap();
        let keep = payload("keep", b"keep");
        let drop_me = payload("drop", b"drop");
        log.append(&keep).unwrap();
        let (offset, length) = log.append(&drop_me).unwrap();
        let size_before = log.size();
        log.invalidate(&message(&drop_me), offset, length).unwrap();
        // the flip rewrites in place, so the file size is unchanged
        assert_eq!(log.size(), size_before);
        let records = log.compact().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload.properties.id, "keep");
        assert!(log.size() < size_before);
    }

    #[test]
    fn leftover_temp_file_is_cleaned_on_open() {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join(format!("q1{}", TMP_SUFFIX));
        fs::write(&tmp, b"junk").unwrap();
        let _log = MessageLog::open(dir.path(), "q1").unwrap();
        assert!(!tmp.exists());
    }

    #[test]
    fn offsets_stay_valid_after_compaction() {
        let dir = TempDir::new().unwrap();
        let mut log = MessageLog::open(dir.path(), "q1").unwrap();
        for i in 0..5 {
            log.append(&payload(&format!("m{}", i), b"body")).unwrap();
        }
        let records = log.compact().unwrap();
        // invalidate through a post-compaction offset and compact again
        let target = &records[2];
        log.invalidate(&message(&target.payload), target.offset, target.length)
            .unwrap();
        let survivors = log.compact().unwrap();
        let ids: Vec<&str> = survivors
            .iter()
            .map(|record| record.payload.properties.id.as_str())
            .collect();
        assert_eq!(ids, ["m0", "m1", "m3", "m4"]);
    }
}
