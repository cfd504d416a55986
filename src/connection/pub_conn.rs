//! The publishing side of a node's master link.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::constants::CONNECT_TIMEOUT;
use crate::protocol::encode_sender_tag;
use crate::transport::PubSocket;

use super::{ConnEvent, ConnectTarget};

/// Connection publishing this node's messages into the current master's
/// intake.
///
/// While a master switch is in flight the old socket keeps carrying
/// traffic, and everything published during the switching window is also
/// queued and replayed, in order, on the new socket the moment it becomes
/// active; no published message is silently dropped by a switch.
#[derive(Clone, Debug)]
pub struct PubConnection {
    inner: Arc<PubConnInner>,
}

#[derive(Debug)]
struct PubConnInner {
    node_name: String,
    events: mpsc::UnboundedSender<ConnEvent>,
    state: Mutex<PubState>,
    sequence: AtomicU64,
}

#[derive(Debug, Default)]
struct PubState {
    active: Option<(ConnectTarget, PubSocket)>,
    connecting: Option<ConnectTarget>,
    /// Messages published during the switching window, replayed on arrival.
    pending: Vec<Vec<Bytes>>,
    /// Bumped whenever an attempt is superseded or torn down; a completing
    /// dial from an older epoch discards itself.
    epoch: u64,
}

impl PubConnection {
    pub fn new(node_name: impl Into<String>, events: mpsc::UnboundedSender<ConnEvent>) -> Self {
        Self {
            inner: Arc::new(PubConnInner {
                node_name: node_name.into(),
                events,
                state: Mutex::new(PubState::default()),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Point the connection at a master.
    ///
    /// A no-op when already connected or connecting to the same master by
    /// name. Otherwise dials a brand-new socket while any previous one stays
    /// fully usable; the attempt is bounded and a timeout is signaled the
    /// same way as a disconnect.
    pub fn connect(&self, target: ConnectTarget) {
        let epoch = {
            let mut state = self.inner.state.lock().expect("pub connection poisoned");
            if state
                .active
                .as_ref()
                .is_some_and(|(active, _)| active.name == target.name)
            {
                debug!(node = %self.inner.node_name, master = %target.name, "already connected");
                return;
            }
            if state
                .connecting
                .as_ref()
                .is_some_and(|connecting| connecting.name == target.name)
            {
                debug!(node = %self.inner.node_name, master = %target.name, "already connecting");
                return;
            }
            state.connecting = Some(target.clone());
            state.epoch += 1;
            state.epoch
        };

        debug!(
            node = %self.inner.node_name,
            master = %target.name,
            endpoint = %target.endpoint,
            "connecting"
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let dialed = tokio::time::timeout(CONNECT_TIMEOUT, PubSocket::connect(target.endpoint))
                .await
                .ok()
                .and_then(|result| result.ok());

            let Some(socket) = dialed else {
                debug!(
                    node = %inner.node_name,
                    master = %target.name,
                    endpoint = %target.endpoint,
                    "failed to connect"
                );
                {
                    let mut state = inner.state.lock().expect("pub connection poisoned");
                    if state.epoch != epoch {
                        return;
                    }
                    state.connecting = None;
                    state.pending.clear();
                }
                disconnect_inner(&inner);
                return;
            };

            let (previous, replayed) = {
                let mut state = inner.state.lock().expect("pub connection poisoned");
                if state.epoch != epoch {
                    // superseded by a newer connect or a disconnect
                    socket.close();
                    return;
                }
                state.connecting = None;
                let pending = std::mem::take(&mut state.pending);
                let previous = state.active.replace((target.clone(), socket.clone()));
                // replay before releasing the lock so nothing published after
                // the switch can overtake the queued messages
                for frames in &pending {
                    socket.send(frames);
                }
                (previous, pending.len())
            };

            debug!(
                node = %inner.node_name,
                master = %target.name,
                switched = previous.is_some(),
                "connected"
            );

            if replayed > 0 {
                debug!(
                    node = %inner.node_name,
                    count = replayed,
                    "replayed messages published while switching"
                );
            }

            match previous {
                Some((old_target, old_socket)) => {
                    old_socket.close();
                    debug!(
                        node = %inner.node_name,
                        master = %old_target.name,
                        "closed previous connection"
                    );
                }
                None => {
                    let _ = inner.events.send(ConnEvent::Connect);
                }
            }
        });
    }

    /// Close any active or in-progress connection; emits a disconnect event
    /// only when a connection had been active.
    pub fn disconnect(&self) {
        disconnect_inner(&self.inner);
    }

    /// Publish a tagged application message through the active socket.
    ///
    /// During a switch the message also lands in the replay queue; with no
    /// active socket it is dropped (the owning node gates on
    /// [`PubConnection::connected`]).
    pub fn publish(&self, channel: &str, parts: Vec<Bytes>) {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let tag = encode_sender_tag(&self.inner.node_name, sequence);

        let mut frames = Vec::with_capacity(2 + parts.len());
        frames.push(Bytes::copy_from_slice(channel.as_bytes()));
        frames.push(Bytes::from(tag.into_bytes()));
        frames.extend(parts);

        let mut state = self.inner.state.lock().expect("pub connection poisoned");
        let Some(socket) = state.active.as_ref().map(|(_, socket)| socket.clone()) else {
            return;
        };
        socket.send(&frames);
        if state.connecting.is_some() {
            state.pending.push(frames);
        }
    }

    /// Whether an active socket exists.
    pub fn connected(&self) -> bool {
        self.inner
            .state
            .lock()
            .expect("pub connection poisoned")
            .active
            .is_some()
    }

    /// Name of the master the active socket points at.
    pub fn master_name(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .expect("pub connection poisoned")
            .active
            .as_ref()
            .map(|(target, _)| target.name.clone())
    }
}

fn disconnect_inner(inner: &Arc<PubConnInner>) {
    let closed = {
        let mut state = inner.state.lock().expect("pub connection poisoned");
        state.connecting = None;
        state.epoch += 1;
        state.pending.clear();
        state.active.take()
    };
    if let Some((target, socket)) = closed {
        socket.close();
        debug!(node = %inner.node_name, master = %target.name, "disconnected");
        let _ = inner.events.send(ConnEvent::Disconnect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_sender_tag;
    use crate::transport::SubSocket;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn recv_soon(socket: &mut SubSocket) -> Vec<Bytes> {
        timeout(Duration::from_secs(2), socket.recv())
            .await
            .expect("delivery in time")
            .expect("socket open")
    }

    fn target(name: &str, port: u16) -> ConnectTarget {
        ConnectTarget {
            name: name.to_string(),
            endpoint: format!("127.0.0.1:{port}").parse().expect("loopback"),
        }
    }

    #[tokio::test]
    async fn test_first_connect_emits_once_then_publishes() {
        let (mut intake, port) = SubSocket::bind(0).await.expect("bind");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = PubConnection::new("node0001", tx);

        conn.connect(target("master01", port));
        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(ConnEvent::Connect)) => {}
            other => panic!("expected connect event, got {other:?}"),
        }
        assert!(conn.connected());
        assert_eq!(conn.master_name().as_deref(), Some("master01"));

        conn.publish("updates", vec![Bytes::from_static(b"one")]);
        let message = recv_soon(&mut intake).await;
        assert_eq!(message[0], Bytes::from_static(b"updates"));
        let tag = String::from_utf8(message[1].to_vec()).expect("utf8 tag");
        assert_eq!(parse_sender_tag(&tag), Some(("node0001", 1)));
        assert_eq!(message[2], Bytes::from_static(b"one"));
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_monotonic() {
        let (mut intake, port) = SubSocket::bind(0).await.expect("bind");
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = PubConnection::new("node0001", tx);
        conn.connect(target("master01", port));
        tokio::time::sleep(Duration::from_millis(100)).await;

        for payload in [&b"a"[..], b"b", b"c"] {
            conn.publish("updates", vec![Bytes::copy_from_slice(payload)]);
        }
        let mut last = 0;
        for _ in 0..3 {
            let message = recv_soon(&mut intake).await;
            let tag = String::from_utf8(message[1].to_vec()).expect("utf8 tag");
            let (_, sequence) = parse_sender_tag(&tag).expect("tag");
            assert!(sequence > last);
            last = sequence;
        }
    }

    #[tokio::test]
    async fn test_no_message_lost_across_a_switch() {
        let (mut old_intake, old_port) = SubSocket::bind(0).await.expect("bind old");
        let (mut new_intake, new_port) = SubSocket::bind(0).await.expect("bind new");
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = PubConnection::new("node0001", tx);

        conn.connect(target("master01", old_port));
        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.publish("updates", vec![Bytes::from_static(b"before")]);
        assert_eq!(recv_soon(&mut old_intake).await[2], Bytes::from_static(b"before"));

        // switch masters and keep publishing through the window
        conn.connect(target("master02", new_port));
        conn.publish("updates", vec![Bytes::from_static(b"during-1")]);
        conn.publish("updates", vec![Bytes::from_static(b"during-2")]);
        tokio::time::sleep(Duration::from_millis(300)).await;
        conn.publish("updates", vec![Bytes::from_static(b"after")]);

        // every message published at or after the switch reaches the new
        // master, in submission order
        let expected = [&b"during-1"[..], b"during-2", b"after"];
        for payload in expected {
            let message = recv_soon(&mut new_intake).await;
            assert_eq!(message[2], Bytes::copy_from_slice(payload));
        }
        assert_eq!(conn.master_name().as_deref(), Some("master02"));
    }

    #[tokio::test]
    async fn test_connect_is_deduped_by_name() {
        let (_intake, port) = SubSocket::bind(0).await.expect("bind");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = PubConnection::new("node0001", tx);

        conn.connect(target("master01", port));
        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(ConnEvent::Connect)) => {}
            other => panic!("expected connect event, got {other:?}"),
        }

        // same name again: nothing happens, no reconnect, no extra event
        conn.connect(target("master01", port));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_emits_only_when_connected() {
        let (_intake, port) = SubSocket::bind(0).await.expect("bind");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = PubConnection::new("node0001", tx);

        // disconnect before ever connecting: silent
        conn.disconnect();
        assert!(rx.try_recv().is_err());

        conn.connect(target("master01", port));
        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(ConnEvent::Connect)) => {}
            other => panic!("expected connect event, got {other:?}"),
        }

        conn.disconnect();
        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(ConnEvent::Disconnect)) => {}
            other => panic!("expected disconnect event, got {other:?}"),
        }
        assert!(!conn.connected());
    }
}
