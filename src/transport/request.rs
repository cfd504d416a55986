//! Request/reply socket primitives.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::encode::encode_message;
use crate::error::{Error, Result};

use super::{TaskGuard, read_message};

/// Send one payload to `addr` and await the single reply, all within
/// `deadline`.
///
/// Every round trip resolves one way or another: a dial failure surfaces as
/// [`Error::Io`], a blown deadline as [`Error::ConnectTimeout`]. The socket
/// is closed either way.
pub async fn request(addr: SocketAddr, payload: Bytes, deadline: Duration) -> Result<Bytes> {
    let exchange = async move {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&encode_message(&[payload])).await?;
        let frames = read_message(&mut stream)
            .await?
            .ok_or_else(|| Error::Io(io::ErrorKind::UnexpectedEof))?;
        Ok::<Bytes, Error>(frames.into_iter().next().unwrap_or_default())
    };

    match timeout(deadline, exchange).await {
        Ok(result) => result,
        Err(_) => Err(Error::ConnectTimeout(addr.to_string())),
    }
}

/// One pending request's reply slot.
///
/// Dropping the handle without replying sends an empty ack, so a requester
/// never hangs on a handler that lost interest.
#[derive(Debug)]
pub struct ReplyHandle {
    tx: oneshot::Sender<Bytes>,
}

impl ReplyHandle {
    /// Send the reply payload back on the originating stream.
    pub fn reply(self, payload: Bytes) {
        let _ = self.tx.send(payload);
    }
}

/// Bound request/reply socket: accepts connections and yields
/// `(payload, reply handle)` pairs in arrival order.
#[derive(Debug)]
pub struct RouterSocket {
    rx: mpsc::UnboundedReceiver<(Bytes, ReplyHandle)>,
    tasks: Arc<TaskGuard>,
    local_port: u16,
}

impl RouterSocket {
    /// Bind on the given port (0 picks an ephemeral one).
    pub async fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_port = listener.local_addr()?.port();

        let (tx, rx) = mpsc::unbounded_channel();
        let tasks = Arc::new(TaskGuard::new());

        // the accept loop must not keep its own guard alive
        let accept_tasks = Arc::downgrade(&tasks);
        let accept = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                trace!(%peer, "coordination peer connected");
                let Some(tasks) = accept_tasks.upgrade() else {
                    break;
                };
                spawn_replier(&tasks, stream, tx.clone());
            }
        });
        tasks.add(accept);

        Ok(Self {
            rx,
            tasks,
            local_port,
        })
    }

    /// Receive the next request; `None` after the socket closed.
    pub async fn recv(&mut self) -> Option<(Bytes, ReplyHandle)> {
        self.rx.recv().await
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Abort the socket tasks and release the port.
    pub fn close(&self) {
        self.tasks.abort_all();
    }
}

fn spawn_replier(
    tasks: &Arc<TaskGuard>,
    mut stream: TcpStream,
    queue: mpsc::UnboundedSender<(Bytes, ReplyHandle)>,
) {
    let handle = tokio::spawn(async move {
        loop {
            let payload = match read_message(&mut stream).await {
                Ok(Some(frames)) => frames.into_iter().next().unwrap_or_default(),
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "coordination stream failed");
                    break;
                }
            };

            let (tx, rx) = oneshot::channel();
            if queue.send((payload, ReplyHandle { tx })).is_err() {
                break;
            }
            // empty ack when the handler dropped the reply slot
            let reply = rx.await.unwrap_or_default();
            if stream.write_all(&encode_message(&[reply])).await.is_err() {
                break;
            }
        }
    });
    tasks.add(handle);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn test_request_reply_roundtrip() {
        let mut router = RouterSocket::bind(0).await.expect("bind");
        let addr = local(router.local_port());

        let server = tokio::spawn(async move {
            let (payload, reply) = router.recv().await.expect("request");
            assert_eq!(payload, Bytes::from_static(b"ping"));
            reply.reply(Bytes::from_static(b"pong"));
            router
        });

        let reply = request(addr, Bytes::from_static(b"ping"), Duration::from_secs(2))
            .await
            .expect("reply");
        assert_eq!(reply, Bytes::from_static(b"pong"));
        server.await.expect("server");
    }

    #[tokio::test]
    async fn test_dropped_reply_handle_yields_empty_ack() {
        let mut router = RouterSocket::bind(0).await.expect("bind");
        let addr = local(router.local_port());

        let server = tokio::spawn(async move {
            let (_, reply) = router.recv().await.expect("request");
            drop(reply);
            router
        });

        let reply = request(addr, Bytes::from_static(b"x"), Duration::from_secs(2))
            .await
            .expect("reply");
        assert!(reply.is_empty());
        server.await.expect("server");
    }

    #[tokio::test]
    async fn test_request_deadline() {
        let mut router = RouterSocket::bind(0).await.expect("bind");
        let addr = local(router.local_port());

        // hold the reply hostage past the deadline
        let server = tokio::spawn(async move {
            let held = router.recv().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(held);
        });

        let result = request(addr, Bytes::from_static(b"x"), Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::ConnectTimeout(_))));
        server.abort();
    }

    #[tokio::test]
    async fn test_request_against_closed_port_fails_fast() {
        let router = RouterSocket::bind(0).await.expect("bind");
        let addr = local(router.local_port());
        router.close();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = request(addr, Bytes::from_static(b"x"), Duration::from_secs(2)).await;
        assert!(result.is_err());
    }
}
