//! Length-prefixed framing over blocking streams. Each frame is a u64
//! little-endian payload length followed by one bincode-encoded record.

use crate::errors::{CodecSnafu, FrameTooLargeSnafu, IoSnafu, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use snafu::{ensure, ResultExt};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};

/// Upper bound on a single frame; anything larger is a protocol error.
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, record: &T) -> Result<()> {
    let payload = bincode::serialize(record).context(CodecSnafu)?;
    ensure!(
        payload.len() as u64 <= MAX_FRAME_LEN,
        FrameTooLargeSnafu {
            size: payload.len() as u64,
            limit: MAX_FRAME_LEN,
        }
    );
    writer
        .write_all(&(payload.len() as u64).to_le_bytes())
        .context(IoSnafu {
            doing: "writing frame length",
        })?;
    writer.write_all(&payload).context(IoSnafu {
        doing: "writing frame payload",
    })?;
    writer.flush().context(IoSnafu {
        doing: "flushing frame",
    })?;
    Ok(())
}

/// Reads one frame. Returns `None` on a clean end of stream (the peer closed
/// between frames).
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut len_buf = [0u8; 8];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => {
            return Err(err).context(IoSnafu {
                doing: "reading frame length",
            })
        }
    }
    let len = u64::from_le_bytes(len_buf);
    ensure!(
        len <= MAX_FRAME_LEN,
        FrameTooLargeSnafu {
            size: len,
            limit: MAX_FRAME_LEN,
        }
    );
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).context(IoSnafu {
        doing: "reading frame payload",
    })?;
    let record = bincode::deserialize(&payload).context(CodecSnafu)?;
    Ok(Some(record))
}

/// Shared writing half of a connection. Clones write to the same socket
/// under one mutex, so frames from concurrent workers never interleave and
/// responses go out in the order their writers acquired the lock.
#[derive(Clone)]
pub struct FrameWriter {
    stream: Arc<Mutex<TcpStream>>,
}

impl FrameWriter {
    pub fn new(stream: TcpStream) -> FrameWriter {
        FrameWriter {
            stream: Arc::new(Mutex::new(stream)),
        }
    }

    pub fn send<T: Serialize>(&self, record: &T) -> Result<()> {
        let mut stream = self.stream.lock().unwrap();
        write_frame(&mut *stream, record)
    }

    pub fn shutdown(&self) {
        let _ = self.stream.lock().unwrap().shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, Response};
    use std::io::Cursor;

    #[test]
    fn frame_round_trip() {
        let request = Request::QueueBind {
            rid: "r1".to_string(),
            cid: "c1".to_string(),
            exchange: "e1".to_string(),
            queue: "q1".to_string(),
            binding_key: "news.#".to_string(),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &request).unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded: Request = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded, request);
        // a second read hits clean EOF
        let next: Option<Request> = read_frame(&mut cursor).unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn back_to_back_frames() {
        let first = Response::Basic {
            rid: "r1".to_string(),
            cid: "c1".to_string(),
            ok: true,
        };
        let second = Response::Basic {
            rid: "r2".to_string(),
            cid: "c1".to_string(),
            ok: false,
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &first).unwrap();
        write_frame(&mut buf, &second).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame::<_, Response>(&mut cursor).unwrap(), Some(first));
        assert_eq!(read_frame::<_, Response>(&mut cursor).unwrap(), Some(second));
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        let mut cursor = Cursor::new(buf);
        assert!(read_frame::<_, Request>(&mut cursor).is_err());
    }
}
