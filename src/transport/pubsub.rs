//! Publish/subscribe socket primitives.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::encode::encode_message;
use crate::parser::frame_to_string;

use super::{TaskGuard, read_message};

/// Filter matching everything, the equivalent of subscribing to the empty
/// prefix.
const MATCH_ALL: &str = "";

/// Publishing socket.
///
/// In bound mode every connected peer receives every message sent; in
/// dialing mode messages go to the single remote intake. Cheap to clone;
/// all clones share the underlying connections.
#[derive(Clone, Debug)]
pub struct PubSocket {
    inner: Arc<PubInner>,
}

#[derive(Debug)]
struct PubInner {
    /// Write queues of the live peers (one for a dialer).
    clients: Mutex<Vec<mpsc::UnboundedSender<Bytes>>>,
    local_port: Option<u16>,
    tasks: TaskGuard,
}

impl PubSocket {
    /// Bind a fanout on the given port (0 picks an ephemeral one).
    pub async fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_port = listener.local_addr()?.port();

        let inner = Arc::new(PubInner {
            clients: Mutex::new(Vec::new()),
            local_port: Some(local_port),
            tasks: TaskGuard::new(),
        });

        let accept_inner = Arc::downgrade(&inner);
        let accept = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                trace!(%peer, "fanout peer connected");
                let Some(inner) = accept_inner.upgrade() else {
                    break;
                };
                let tx = spawn_writer(&inner.tasks, stream);
                inner.clients.lock().expect("pub clients poisoned").push(tx);
            }
        });
        inner.tasks.add(accept);

        Ok(Self { inner })
    }

    /// Dial a remote intake. Completion of the TCP connect is the
    /// transport-level connect acknowledgement.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let inner = Arc::new(PubInner {
            clients: Mutex::new(Vec::new()),
            local_port: None,
            tasks: TaskGuard::new(),
        });
        let tx = spawn_writer(&inner.tasks, stream);
        inner.clients.lock().expect("pub clients poisoned").push(tx);
        Ok(Self { inner })
    }

    /// Queue a multipart message to every live peer.
    ///
    /// Returns `false` when no peer accepted the message (dialer whose
    /// stream already failed, or fanout with nobody connected).
    pub fn send(&self, frames: &[Bytes]) -> bool {
        let message = encode_message(frames);
        let mut clients = self.inner.clients.lock().expect("pub clients poisoned");
        clients.retain(|tx| tx.send(message.clone()).is_ok());
        !clients.is_empty()
    }

    /// Port of the bound fanout, `None` for a dialer.
    pub fn local_port(&self) -> Option<u16> {
        self.inner.local_port
    }

    /// Abort all socket tasks and drop the connections.
    pub fn close(&self) {
        self.inner.tasks.abort_all();
        self.inner
            .clients
            .lock()
            .expect("pub clients poisoned")
            .clear();
    }
}

fn spawn_writer(tasks: &TaskGuard, mut stream: TcpStream) -> mpsc::UnboundedSender<Bytes> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let handle = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if stream.write_all(&message).await.is_err() {
                break;
            }
        }
    });
    tasks.add(handle);
    tx
}

/// Cloneable control handle of a [`SubSocket`]: filter management and
/// shutdown, usable while the receiving half is owned by a pump task.
#[derive(Clone, Debug)]
pub struct SubHandle {
    filters: Arc<RwLock<HashSet<String>>>,
    tasks: Arc<TaskGuard>,
}

impl SubHandle {
    /// Deliver messages published on `channel`.
    pub fn subscribe(&self, channel: &str) {
        self.filters
            .write()
            .expect("sub filters poisoned")
            .insert(channel.to_string());
    }

    /// Stop delivering messages published on `channel`.
    pub fn unsubscribe(&self, channel: &str) {
        self.filters
            .write()
            .expect("sub filters poisoned")
            .remove(channel);
    }

    /// Deliver every message regardless of channel.
    pub fn subscribe_all(&self) {
        self.subscribe(MATCH_ALL);
    }

    /// Abort the socket tasks; pending `recv` calls complete with `None`.
    pub fn close(&self) {
        self.tasks.abort_all();
    }
}

/// Subscribing socket.
///
/// In bound mode it merges every inbound publisher stream (the broker's
/// intake); in dialing mode it receives a remote fanout. Channel filtering
/// is subscriber-side: a message is delivered when its channel frame matches
/// a filter exactly, or when the match-all filter is set.
#[derive(Debug)]
pub struct SubSocket {
    rx: mpsc::UnboundedReceiver<Vec<Bytes>>,
    handle: SubHandle,
}

impl SubSocket {
    /// Bind an intake on the given port (0 picks an ephemeral one), matching
    /// every channel. Returns the socket and its local port.
    pub async fn bind(port: u16) -> io::Result<(Self, u16)> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_port = listener.local_addr()?.port();

        let (socket, tx) = Self::with_filters([MATCH_ALL.to_string()]);
        let tasks = socket.handle.tasks.clone();
        let filters = socket.handle.filters.clone();

        // the accept loop must not keep its own guard alive
        let accept_tasks = Arc::downgrade(&tasks);
        let accept = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                trace!(%peer, "intake peer connected");
                let Some(tasks) = accept_tasks.upgrade() else {
                    break;
                };
                spawn_reader(&tasks, stream, filters.clone(), tx.clone());
            }
        });
        tasks.add(accept);

        Ok((socket, local_port))
    }

    /// Dial a remote fanout with the given initial filters, applied before
    /// any message can be delivered.
    pub async fn connect(
        addr: SocketAddr,
        filters: impl IntoIterator<Item = String>,
    ) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (socket, tx) = Self::with_filters(filters);
        spawn_reader(
            &socket.handle.tasks,
            stream,
            socket.handle.filters.clone(),
            tx,
        );
        Ok(socket)
    }

    fn with_filters(
        filters: impl IntoIterator<Item = String>,
    ) -> (Self, mpsc::UnboundedSender<Vec<Bytes>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SubHandle {
            filters: Arc::new(RwLock::new(filters.into_iter().collect())),
            tasks: Arc::new(TaskGuard::new()),
        };
        (Self { rx, handle }, tx)
    }

    /// Receive the next delivered message; `None` after the socket closed.
    pub async fn recv(&mut self) -> Option<Vec<Bytes>> {
        self.rx.recv().await
    }

    /// Control handle shared with the pump that owns this socket.
    pub fn handle(&self) -> SubHandle {
        self.handle.clone()
    }
}

fn spawn_reader(
    tasks: &Arc<TaskGuard>,
    mut stream: TcpStream,
    filters: Arc<RwLock<HashSet<String>>>,
    tx: mpsc::UnboundedSender<Vec<Bytes>>,
) {
    let handle = tokio::spawn(async move {
        loop {
            match read_message(&mut stream).await {
                Ok(Some(frames)) => {
                    let Some(channel_frame) = frames.first() else {
                        continue;
                    };
                    let Ok(channel) = frame_to_string(channel_frame) else {
                        debug!("dropping message with non-utf8 channel frame");
                        continue;
                    };
                    let matched = {
                        let filters = filters.read().expect("sub filters poisoned");
                        filters.contains(MATCH_ALL) || filters.contains(channel.as_str())
                    };
                    if matched && tx.send(frames).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "subscribe stream failed");
                    break;
                }
            }
        }
    });
    tasks.add(handle);
}
