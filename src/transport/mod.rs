//! Message-queue socket primitives over TCP.
//!
//! The bus needs four socket roles, modeled after the classic message-queue
//! socket types:
//!
//! - [`PubSocket`]: bound fanout (every connected peer receives every sent
//!   message) or dialing publisher (sends into a remote intake).
//! - [`SubSocket`]: bound intake (merges all inbound publisher streams) or
//!   dialing subscriber (receives a remote fanout), with subscriber-side
//!   channel filtering.
//! - [`request`]: one-shot request/reply client with a hard deadline.
//! - [`RouterSocket`]: bound replier yielding `(payload, reply handle)`
//!   pairs.
//!
//! All sockets speak the multipart framing from [`crate::encode`] /
//! [`crate::parser`]. A successful TCP connect doubles as the
//! transport-level connect acknowledgement the connection layer relies on.

mod pubsub;
mod request;

pub use pubsub::{PubSocket, SubHandle, SubSocket};
pub use request::{ReplyHandle, RouterSocket, request};

use std::io;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::constants::MAX_MESSAGE_SIZE;
use crate::parser::decode_payload;

/// Read one framed message from the stream.
///
/// Returns `Ok(None)` on a clean EOF at a message boundary; oversized or
/// malformed payloads surface as `InvalidData`.
pub(crate) async fn read_message(stream: &mut TcpStream) -> io::Result<Option<Vec<Bytes>>> {
    let mut size_buf = [0u8; 4];
    match stream.read_exact(&mut size_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let size = u32::from_be_bytes(size_buf) as usize;
    if size > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message of {size} bytes exceeds limit"),
        ));
    }

    let mut payload = vec![0u8; size];
    stream.read_exact(&mut payload).await?;

    decode_payload(Bytes::from(payload))
        .map(Some)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed framing"))
}

/// Keeps the spawned socket tasks alive and aborts them all on drop.
#[derive(Debug, Default)]
pub(crate) struct TaskGuard {
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl TaskGuard {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, handle: JoinHandle<()>) {
        self.handles.lock().expect("task guard poisoned").push(handle);
    }

    pub(crate) fn abort_all(&self) {
        for handle in self.handles.lock().expect("task guard poisoned").drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.abort_all();
    }
}
