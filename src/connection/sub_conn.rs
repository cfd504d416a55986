//! The subscribing side of a node's master link.

use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::cluster::HeartbeatMonitor;
use crate::constants::{CONNECT_TIMEOUT, HEARTBEAT_TIMEOUT, SUB_DRAIN_GRACE};
use crate::parser::frame_to_string;
use crate::protocol::{CHANNEL_HEARTBEATS, CHANNEL_NEW_MASTER, MasterRecord, parse_sender_tag};
use crate::transport::{SubHandle, SubSocket};

use super::{ConnEvent, ConnectTarget, SequenceLedger};

/// Connection receiving the current master's fanout.
///
/// Every new socket subscribes to the internal channels plus the full
/// subscription set before it counts as arrived. On a master switch the
/// previous socket keeps draining for a short grace period so nothing in
/// flight from the old master is lost; the per-publisher sequence ledger
/// absorbs the duplicates the overlap produces. A dedicated watchdog
/// declares the master missing after a silence window and force-disconnects.
#[derive(Clone, Debug)]
pub struct SubConnection {
    inner: Arc<SubConnInner>,
}

#[derive(Debug)]
struct SubConnInner {
    node_name: String,
    events: mpsc::UnboundedSender<ConnEvent>,
    state: Mutex<SubState>,
    subscriptions: Mutex<Vec<String>>,
    ledger: SequenceLedger,
    monitor: HeartbeatMonitor,
}

#[derive(Debug, Default)]
struct SubState {
    active: Option<ActiveSub>,
    connecting: Option<ConnectTarget>,
    epoch: u64,
}

#[derive(Debug)]
struct ActiveSub {
    target: ConnectTarget,
    handle: SubHandle,
    pump: JoinHandle<()>,
}

impl Drop for ActiveSub {
    fn drop(&mut self) {
        self.handle.close();
        self.pump.abort();
    }
}

impl SubConnection {
    pub fn new(node_name: impl Into<String>, events: mpsc::UnboundedSender<ConnEvent>) -> Self {
        Self {
            inner: Arc::new(SubConnInner {
                node_name: node_name.into(),
                events,
                state: Mutex::new(SubState::default()),
                subscriptions: Mutex::new(Vec::new()),
                ledger: SequenceLedger::new(),
                monitor: HeartbeatMonitor::new(HEARTBEAT_TIMEOUT),
            }),
        }
    }

    /// Point the connection at a master's fanout endpoint.
    ///
    /// Same contract as the publishing side: dedupe by master name, bounded
    /// dial, old socket stays live until the switch completes.
    pub fn connect(&self, target: ConnectTarget) {
        let epoch = {
            let mut state = self.inner.state.lock().expect("sub connection poisoned");
            if state
                .active
                .as_ref()
                .is_some_and(|active| active.target.name == target.name)
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
            // internal channels first, then the surviving subscription set,
            // all in place before the socket counts as arrived
            let mut filters = vec![
                CHANNEL_HEARTBEATS.to_string(),
                CHANNEL_NEW_MASTER.to_string(),
            ];
            filters.extend(
                inner
                    .subscriptions
                    .lock()
                    .expect("sub connection poisoned")
                    .iter()
                    .cloned(),
            );

            let dialed = tokio::time::timeout(
                CONNECT_TIMEOUT,
                SubSocket::connect(target.endpoint, filters),
            )
            .await
            .ok()
            .and_then(|result| result.ok());

            let Some(mut socket) = dialed else {
                debug!(
                    node = %inner.node_name,
                    master = %target.name,
                    endpoint = %target.endpoint,
                    "failed to connect"
                );
                {
                    let mut state = inner.state.lock().expect("sub connection poisoned");
                    if state.epoch != epoch {
                        return;
                    }
                    state.connecting = None;
                }
                disconnect_inner(&inner);
                return;
            };

            let handle = socket.handle();
            let weak = Arc::downgrade(&inner);
            let pump = tokio::spawn(async move {
                while let Some(frames) = socket.recv().await {
                    let Some(strong) = weak.upgrade() else {
                        break;
                    };
                    dispatch(&strong, frames);
                }
            });

            let previous = {
                let mut state = inner.state.lock().expect("sub connection poisoned");
                if state.epoch != epoch {
                    handle.close();
                    pump.abort();
                    return;
                }
                state.connecting = None;
                state.active.replace(ActiveSub {
                    target: target.clone(),
                    handle,
                    pump,
                })
            };

            debug!(
                node = %inner.node_name,
                master = %target.name,
                switched = previous.is_some(),
                "connected"
            );

            inner.monitor.touch();
            arm_watchdog(&inner);

            match previous {
                Some(old) => {
                    // keep draining what the old master already sent
                    let node_name = inner.node_name.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(SUB_DRAIN_GRACE).await;
                        old.handle.close();
                        old.pump.abort();
                        debug!(
                            node = %node_name,
                            master = %old.target.name,
                            "closed previous connection"
                        );
                    });
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

    /// Add channels to the subscription set and the live filter.
    pub fn subscribe(&self, channels: &[String]) {
        let mut subscriptions = self
            .inner
            .subscriptions
            .lock()
            .expect("sub connection poisoned");
        let state = self.inner.state.lock().expect("sub connection poisoned");
        for channel in channels {
            if !subscriptions.contains(channel) {
                subscriptions.push(channel.clone());
            }
            if let Some(active) = state.active.as_ref() {
                active.handle.subscribe(channel);
            }
        }
    }

    /// Remove channels from the subscription set and the live filter.
    pub fn unsubscribe(&self, channels: &[String]) {
        let mut subscriptions = self
            .inner
            .subscriptions
            .lock()
            .expect("sub connection poisoned");
        let state = self.inner.state.lock().expect("sub connection poisoned");
        for channel in channels {
            subscriptions.retain(|existing| existing != channel);
            if let Some(active) = state.active.as_ref() {
                active.handle.unsubscribe(channel);
            }
        }
    }

    /// Snapshot of the subscription set.
    pub fn subscribed_channels(&self) -> Vec<String> {
        self.inner
            .subscriptions
            .lock()
            .expect("sub connection poisoned")
            .clone()
    }

    /// Whether an active socket exists.
    pub fn connected(&self) -> bool {
        self.inner
            .state
            .lock()
            .expect("sub connection poisoned")
            .active
            .is_some()
    }

    /// Name of the master the active socket points at.
    pub fn master_name(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .expect("sub connection poisoned")
            .active
            .as_ref()
            .map(|active| active.target.name.clone())
    }
}

fn arm_watchdog(inner: &Arc<SubConnInner>) {
    let weak = Arc::downgrade(inner);
    inner.monitor.start(move || missing_master(weak));
}

fn missing_master(weak: Weak<SubConnInner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    debug!(node = %inner.node_name, "missing master");
    disconnect_inner(&inner);
    let _ = inner.events.send(ConnEvent::MissingMaster);
}

fn disconnect_inner(inner: &Arc<SubConnInner>) {
    let closed = {
        let mut state = inner.state.lock().expect("sub connection poisoned");
        state.connecting = None;
        state.epoch += 1;
        state.active.take()
    };
    inner.monitor.stop();
    if let Some(active) = closed {
        active.handle.close();
        active.pump.abort();
        debug!(node = %inner.node_name, master = %active.target.name, "disconnected");
        let _ = inner.events.send(ConnEvent::Disconnect);
    }
}

fn dispatch(inner: &Arc<SubConnInner>, frames: Vec<Bytes>) {
    inner.monitor.touch();

    let Some(channel_frame) = frames.first() else {
        return;
    };
    let Ok(channel) = frame_to_string(channel_frame) else {
        return;
    };

    match channel.as_str() {
        CHANNEL_HEARTBEATS => {
            trace!(node = %inner.node_name, "heartbeat");
            let _ = inner.events.send(ConnEvent::Heartbeat);
        }
        CHANNEL_NEW_MASTER => {
            let Some(payload) = frames.get(1) else {
                return;
            };
            match serde_json::from_slice::<MasterRecord>(payload) {
                Ok(record) => {
                    debug!(
                        node = %inner.node_name,
                        master = %record.name,
                        "received notice of new master"
                    );
                    let _ = inner.events.send(ConnEvent::NewMaster(record));
                }
                Err(e) => {
                    debug!(node = %inner.node_name, error = %e, "malformed new-master notice");
                }
            }
        }
        _ => {
            let Some(tag_frame) = frames.get(1) else {
                return;
            };
            let Ok(tag) = frame_to_string(tag_frame) else {
                return;
            };
            let Some((publisher, sequence)) = parse_sender_tag(&tag) else {
                debug!(node = %inner.node_name, %tag, "dropping message with malformed tag");
                return;
            };
            if !inner.ledger.accept(publisher, sequence) {
                trace!(node = %inner.node_name, %tag, "dropping duplicate delivery");
                return;
            }
            let _ = inner.events.send(ConnEvent::Message {
                channel,
                parts: frames[2..].to_vec(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PubSocket;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    fn frames(parts: &[&str]) -> Vec<Bytes> {
        parts
            .iter()
            .map(|p| Bytes::copy_from_slice(p.as_bytes()))
            .collect()
    }

    async fn next_event(rx: &mut UnboundedReceiver<ConnEvent>) -> Option<ConnEvent> {
        timeout(Duration::from_secs(2), rx.recv()).await.ok()?
    }

    async fn connected_pair() -> (SubConnection, UnboundedReceiver<ConnEvent>, PubSocket) {
        let fanout = PubSocket::bind(0).await.expect("bind");
        let port = fanout.local_port().expect("port");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = SubConnection::new("tester01", tx);
        conn.subscribe(&["updates".to_string()]);
        conn.connect(ConnectTarget {
            name: "master01".to_string(),
            endpoint: format!("127.0.0.1:{port}").parse().unwrap(),
        });
        match next_event(&mut rx).await {
            Some(ConnEvent::Connect) => {}
            other => panic!("expected connect event, got {other:?}"),
        }
        // allow the fanout's accept loop to register the subscriber
        tokio::time::sleep(Duration::from_millis(50)).await;
        (conn, rx, fanout)
    }

    #[tokio::test]
    async fn test_delivers_subscribed_messages() {
        let (conn, mut rx, fanout) = connected_pair().await;

        fanout.send(&frames(&["updates", "peer0001_1", "hello"]));
        match next_event(&mut rx).await {
            Some(ConnEvent::Message { channel, parts }) => {
                assert_eq!(channel, "updates");
                assert_eq!(parts, vec![Bytes::from_static(b"hello")]);
            }
            other => panic!("expected message, got {other:?}"),
        }
        conn.disconnect();
    }

    #[tokio::test]
    async fn test_duplicate_deliveries_collapse() {
        let (conn, mut rx, fanout) = connected_pair().await;

        fanout.send(&frames(&["updates", "peer0001_5", "once"]));
        fanout.send(&frames(&["updates", "peer0001_5", "once"]));
        fanout.send(&frames(&["updates", "peer0001_6", "twice"]));

        match next_event(&mut rx).await {
            Some(ConnEvent::Message { parts, .. }) => {
                assert_eq!(parts, vec![Bytes::from_static(b"once")]);
            }
            other => panic!("expected message, got {other:?}"),
        }
        match next_event(&mut rx).await {
            Some(ConnEvent::Message { parts, .. }) => {
                assert_eq!(parts, vec![Bytes::from_static(b"twice")]);
            }
            other => panic!("expected message, got {other:?}"),
        }
        conn.disconnect();
    }

    #[tokio::test]
    async fn test_heartbeats_surface_as_events_not_messages() {
        let (conn, mut rx, fanout) = connected_pair().await;

        fanout.send(&frames(&["heartbeats", "master01"]));
        match next_event(&mut rx).await {
            Some(ConnEvent::Heartbeat) => {}
            other => panic!("expected heartbeat event, got {other:?}"),
        }
        conn.disconnect();
    }

    #[tokio::test]
    async fn test_missing_master_fires_after_silence() {
        let (_conn, mut rx, fanout) = connected_pair().await;

        // no traffic at all: the watchdog should force-disconnect
        drop(fanout);
        let mut saw_disconnect = false;
        let mut saw_missing = false;
        for _ in 0..2 {
            match timeout(Duration::from_secs(3), rx.recv()).await {
                Ok(Some(ConnEvent::Disconnect)) => saw_disconnect = true,
                Ok(Some(ConnEvent::MissingMaster)) => saw_missing = true,
                other => panic!("expected disconnect/missing, got {other:?}"),
            }
        }
        assert!(saw_disconnect && saw_missing);
    }

    #[tokio::test]
    async fn test_connect_failure_signals_like_disconnect() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = SubConnection::new("tester01", tx);

        // a port nobody listens on: the dial fails fast
        conn.connect(ConnectTarget {
            name: "ghost".to_string(),
            endpoint: "127.0.0.1:1".parse().unwrap(),
        });

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(!conn.connected());
        // never connected before, so no disconnect event either
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_is_deduped_by_name() {
        let (conn, mut rx, fanout) = connected_pair().await;

        conn.connect(ConnectTarget {
            name: "master01".to_string(),
            endpoint: "127.0.0.1:1".parse().unwrap(),
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(conn.connected());
        assert_eq!(conn.master_name().as_deref(), Some("master01"));

        fanout.send(&frames(&["updates", "peer0001_1", "still-alive"]));
        assert!(matches!(
            next_event(&mut rx).await,
            Some(ConnEvent::Message { .. })
        ));
        conn.disconnect();
    }

    #[tokio::test]
    async fn test_switch_to_new_master_keeps_subscriptions() {
        let (conn, mut rx, _old_fanout) = connected_pair().await;

        let new_fanout = PubSocket::bind(0).await.expect("bind");
        let port = new_fanout.local_port().expect("port");
        conn.connect(ConnectTarget {
            name: "master02".to_string(),
            endpoint: format!("127.0.0.1:{port}").parse().unwrap(),
        });

        // switches are silent: no fresh connect event, but traffic flows on
        // the new socket with the old subscription set applied
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(conn.master_name().as_deref(), Some("master02"));

        new_fanout.send(&frames(&["updates", "peer0001_9", "after-switch"]));
        match next_event(&mut rx).await {
            Some(ConnEvent::Message { parts, .. }) => {
                assert_eq!(parts, vec![Bytes::from_static(b"after-switch")]);
            }
            other => panic!("expected message, got {other:?}"),
        }
        conn.disconnect();
    }
}
