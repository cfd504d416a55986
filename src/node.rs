//! Node orchestration.
//!
//! A [`Node`] wires the cluster components and the two master connections
//! into one externally visible entity with an activate/deactivate lifecycle
//! and a publish/subscribe API. Member nodes vote and can become master;
//! external nodes only discover and follow one.
//!
//! Readiness is a composition: a node is ready exactly when it can publish
//! *and* is receiving. The corresponding events fire only on boundary
//! transitions, never for sub-events that do not cross the boundary.

use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cluster::{
    DnsDirectory, ExternalUpdater, MasterBroker, MasterElector, MasterFinder, PeerDirectory,
};
use crate::config::NodeConfig;
use crate::connection::{ConnEvent, ConnectTarget, PubConnection, SubConnection};
use crate::constants::{HEARTBEAT_INTERVAL_CHECK, MASTER_SETTLE_DELAY, SETTLE_DELAY};
use crate::error::Result;
use crate::identity::NodeId;
use crate::protocol::{CHANNEL_HEARTBEATS, MasterRecord, is_reserved_channel};

/// Capacity of the node event broadcast; slow consumers lag, they never
/// block the bus.
const EVENT_CAPACITY: usize = 256;

/// Kind of participant a node is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeType {
    /// Voting, electable cluster member.
    Member,
    /// Non-voting bus client.
    External,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Member => write!(f, "member"),
            NodeType::External => write!(f, "external"),
        }
    }
}

/// Typed notifications a node emits to its subscribers.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// Both connections are up: the node can publish and is receiving.
    Ready,
    /// One side dropped while the other was still up.
    NotReady,
    CanPublish,
    CannotPublish,
    Receiving,
    NotReceiving,
    /// First time this node became fully connected (re-emitted only after a
    /// complete disconnect, never on silent master switches).
    Connect,
    /// Both sides are gone after the node had been fully connected.
    Disconnect,
    Deactivated,
    /// A bus message delivered on a subscribed channel.
    Message { channel: String, parts: Vec<Bytes> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Inactive,
    Activating,
    Active,
    Deactivating,
}

#[derive(Debug, Default)]
struct Flags {
    can_publish: bool,
    receiving: bool,
    ever_connected: bool,
}

enum Resolver {
    Elector(MasterElector),
    Finder(MasterFinder),
}

struct Receivers {
    pub_rx: mpsc::UnboundedReceiver<ConnEvent>,
    sub_rx: mpsc::UnboundedReceiver<ConnEvent>,
    elected_rx: mpsc::UnboundedReceiver<MasterRecord>,
}

/// A bus node: cluster member or external client.
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    identity: NodeId,
    node_type: NodeType,
    events: broadcast::Sender<NodeEvent>,
    pub_conn: PubConnection,
    sub_conn: SubConnection,
    resolver: Resolver,
    broker: Option<MasterBroker>,
    updater: Option<ExternalUpdater>,
    /// The master this node currently follows; replaced wholesale, readers
    /// get owned snapshots.
    master: Arc<Mutex<Option<MasterRecord>>>,
    /// Serialized form of the current master, republished with heartbeats.
    master_json: Mutex<Option<Bytes>>,
    lifecycle: Mutex<Lifecycle>,
    flags: Mutex<Flags>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    seek: Mutex<Option<JoinHandle<()>>>,
    receivers: Mutex<Option<Receivers>>,
    /// Keeps the elected-master channel open on nodes without an elector.
    _elected_tx: mpsc::UnboundedSender<MasterRecord>,
}

impl Node {
    /// Build a node resolving peers through DNS (`config.host` fanned out
    /// over the coordination port).
    pub fn new(config: NodeConfig) -> Result<Self> {
        let directory = Arc::new(DnsDirectory::new(
            config.host.clone(),
            config.coordination_port,
        ));
        Self::with_directory(config, directory)
    }

    /// Build a node with an injected peer directory.
    pub fn with_directory(config: NodeConfig, directory: Arc<dyn PeerDirectory>) -> Result<Self> {
        config.validate()?;

        let identity = if config.external {
            NodeId::external()
        } else {
            NodeId::member(config.election_priority)
        };
        let node_type = if config.external {
            NodeType::External
        } else {
            NodeType::Member
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (pub_tx, pub_rx) = mpsc::unbounded_channel();
        let (sub_tx, sub_rx) = mpsc::unbounded_channel();
        let (elected_tx, elected_rx) = mpsc::unbounded_channel();

        let pub_conn = PubConnection::new(identity.name(), pub_tx);
        let sub_conn = SubConnection::new(identity.name(), sub_tx);
        let master = Arc::new(Mutex::new(None));

        let (resolver, broker, updater) = if config.external {
            (
                Resolver::Finder(MasterFinder::new(identity.name(), directory)),
                None,
                None,
            )
        } else {
            let broker = MasterBroker::new(identity.name());
            let elector = MasterElector::new(
                identity.clone(),
                &config,
                directory,
                broker.clone(),
                master.clone(),
                elected_tx.clone(),
            );
            (
                Resolver::Elector(elector),
                Some(broker),
                Some(ExternalUpdater::new(config.external_updates_port)),
            )
        };

        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                identity,
                node_type,
                events,
                pub_conn,
                sub_conn,
                resolver,
                broker,
                updater,
                master,
                master_json: Mutex::new(None),
                lifecycle: Mutex::new(Lifecycle::Inactive),
                flags: Mutex::new(Flags::default()),
                dispatcher: Mutex::new(None),
                seek: Mutex::new(None),
                receivers: Mutex::new(Some(Receivers {
                    pub_rx,
                    sub_rx,
                    elected_rx,
                })),
                _elected_tx: elected_tx,
            }),
        })
    }

    /// Activate the node: bind the member sockets and start resolving a
    /// master. Idempotent.
    pub async fn activate(&self) -> Result<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock().expect("node state poisoned");
            if *lifecycle != Lifecycle::Inactive {
                return Ok(());
            }
            *lifecycle = Lifecycle::Activating;
        }
        debug!(node = %self.inner.identity.name(), kind = %self.inner.node_type, "activating");

        if let Some(broker) = &self.inner.broker {
            let bound = async {
                broker.bind().await?;
                if let Resolver::Elector(elector) = &self.inner.resolver {
                    elector.bind().await?;
                }
                if let Some(updater) = &self.inner.updater {
                    updater.bind().await?;
                }
                Ok(())
            }
            .await;

            if let Err(e) = bound {
                broker.unbind();
                if let Resolver::Elector(elector) = &self.inner.resolver {
                    elector.unbind();
                }
                if let Some(updater) = &self.inner.updater {
                    updater.unbind();
                }
                *self.inner.lifecycle.lock().expect("node state poisoned") = Lifecycle::Inactive;
                return Err(e);
            }
        }

        if let Some(receivers) = self
            .inner
            .receivers
            .lock()
            .expect("node state poisoned")
            .take()
        {
            let weak = Arc::downgrade(&self.inner);
            *self.inner.dispatcher.lock().expect("node state poisoned") =
                Some(tokio::spawn(dispatch_loop(weak, receivers)));
        }

        *self.inner.lifecycle.lock().expect("node state poisoned") = Lifecycle::Active;
        if !self.is_ready() {
            spawn_seek(&self.inner);
        }
        Ok(())
    }

    /// Deactivate the node.
    ///
    /// An external node just drops its connections. A member node that is
    /// currently the recognized master first forces the election of a
    /// successor, advertising a throwaway identity that cannot win, and
    /// signals it to the outside world before tearing anything down; a
    /// failed handoff election is logged and teardown proceeds anyway.
    pub async fn deactivate(&self) {
        {
            let mut lifecycle = self.inner.lifecycle.lock().expect("node state poisoned");
            if *lifecycle != Lifecycle::Active {
                return;
            }
            *lifecycle = Lifecycle::Deactivating;
        }
        debug!(node = %self.inner.identity.name(), "deactivating");

        if self.inner.node_type == NodeType::External {
            self.inner.sub_conn.disconnect();
            self.inner.pub_conn.disconnect();
            *self.inner.lifecycle.lock().expect("node state poisoned") = Lifecycle::Inactive;
            debug!(node = %self.inner.identity.name(), "deactivated");
            let _ = self.inner.events.send(NodeEvent::Deactivated);
            return;
        }

        let was_master =
            self.inner.sub_conn.master_name().as_deref() == Some(self.inner.identity.name());

        if was_master {
            debug!(
                node = %self.inner.identity.name(),
                "this node is the master; electing a successor before disconnecting"
            );
            if let Resolver::Elector(elector) = &self.inner.resolver {
                match elector
                    .resolve(Some(self.inner.identity.resignation_id()))
                    .await
                {
                    Ok(successor) => {
                        debug!(
                            node = %self.inner.identity.name(),
                            successor = %successor.name,
                            "successfully elected a successor"
                        );
                        if let Some(broker) = &self.inner.broker {
                            if let Err(e) = broker.signal_new_master(&successor) {
                                warn!(error = %e, "could not signal the successor");
                            }
                        }
                        if let Some(updater) = &self.inner.updater {
                            if let Ok(json) = serde_json::to_vec(&successor) {
                                updater.publish(CHANNEL_HEARTBEATS, Bytes::from(json));
                            }
                        }
                    }
                    Err(e) => {
                        debug!(
                            node = %self.inner.identity.name(),
                            error = %e,
                            "failed to elect a successor; disconnecting anyway"
                        );
                    }
                }
            }
        }

        if let Some(task) = self.inner.seek.lock().expect("node state poisoned").take() {
            task.abort();
        }
        self.inner.sub_conn.disconnect();
        self.inner.pub_conn.disconnect();
        if let Resolver::Elector(elector) = &self.inner.resolver {
            elector.unbind();
        }
        if let Some(updater) = &self.inner.updater {
            updater.unbind();
        }

        // let the handoff signal drain before the relay disappears
        let settle = if was_master {
            MASTER_SETTLE_DELAY
        } else {
            SETTLE_DELAY
        };
        tokio::time::sleep(settle).await;

        if let Some(broker) = &self.inner.broker {
            broker.unbind();
        }
        *self.inner.lifecycle.lock().expect("node state poisoned") = Lifecycle::Inactive;
        debug!(node = %self.inner.identity.name(), "deactivated");
        let _ = self.inner.events.send(NodeEvent::Deactivated);
    }

    /// Publish a message on a channel.
    ///
    /// Reserved channels are rejected with a warning; publishing while the
    /// bus link is down warns and drops, steady-state recovery is the
    /// node's own job.
    pub fn publish<I, B>(&self, channel: &str, parts: I)
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        if is_reserved_channel(channel) {
            warn!(
                node = %self.inner.identity.name(),
                channel,
                "channel is used internally and cannot be published to"
            );
            return;
        }
        if !self.inner.pub_conn.connected() {
            warn!(node = %self.inner.identity.name(), "cannot publish on bus");
            return;
        }
        self.inner
            .pub_conn
            .publish(channel, parts.into_iter().map(Into::into).collect());
    }

    /// Subscribe to one or more channels. Reserved channels are skipped with
    /// a warning; the rest join the subscription set, which survives master
    /// migrations.
    pub fn subscribe<I, S>(&self, channels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let accepted: Vec<String> = channels
            .into_iter()
            .map(Into::into)
            .filter(|channel| {
                if is_reserved_channel(channel) {
                    warn!(
                        node = %self.inner.identity.name(),
                        channel = %channel,
                        "channel is used internally and cannot be subscribed to"
                    );
                    false
                } else {
                    true
                }
            })
            .collect();
        if !accepted.is_empty() {
            self.inner.sub_conn.subscribe(&accepted);
        }
    }

    /// Unsubscribe from one or more channels.
    pub fn unsubscribe<I, S>(&self, channels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let accepted: Vec<String> = channels
            .into_iter()
            .map(Into::into)
            .filter(|channel| {
                if is_reserved_channel(channel) {
                    warn!(
                        node = %self.inner.identity.name(),
                        channel = %channel,
                        "channel is used internally and cannot be unsubscribed from"
                    );
                    false
                } else {
                    true
                }
            })
            .collect();
        if !accepted.is_empty() {
            self.inner.sub_conn.unsubscribe(&accepted);
        }
    }

    /// Subscribe to the node's event stream.
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    pub fn id(&self) -> &str {
        self.inner.identity.id()
    }

    pub fn name(&self) -> &str {
        self.inner.identity.name()
    }

    pub fn node_type(&self) -> NodeType {
        self.inner.node_type
    }

    pub fn settings(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn can_publish(&self) -> bool {
        self.inner.pub_conn.connected()
    }

    pub fn is_receiving(&self) -> bool {
        self.inner.sub_conn.connected()
    }

    pub fn is_ready(&self) -> bool {
        self.can_publish() && self.is_receiving()
    }

    /// Whether the currently known master is this node itself.
    pub fn is_master(&self) -> bool {
        self.inner
            .master
            .lock()
            .expect("node state poisoned")
            .as_ref()
            .is_some_and(|master| master.name == self.inner.identity.name())
    }

    /// Owned snapshot of the currently known master.
    pub fn master(&self) -> Option<MasterRecord> {
        self.inner.master.lock().expect("node state poisoned").clone()
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        self.inner.sub_conn.subscribed_channels()
    }
}

impl NodeInner {
    fn is_active(&self) -> bool {
        matches!(
            *self.lifecycle.lock().expect("node state poisoned"),
            Lifecycle::Activating | Lifecycle::Active
        )
    }

    fn is_ready(&self) -> bool {
        self.pub_conn.connected() && self.sub_conn.connected()
    }

    /// Wire both connections to a resolved master and align the heartbeat
    /// role.
    fn connect_to_master(&self, record: MasterRecord) {
        if !self.is_active() {
            return;
        }

        let (Ok(sub_endpoint), Ok(pub_endpoint)) = (
            record.endpoints.pub_addr.parse(),
            record.endpoints.sub_addr.parse(),
        ) else {
            warn!(
                node = %self.identity.name(),
                master = %record.name,
                "master record carries unparseable endpoints"
            );
            return;
        };

        {
            *self.master.lock().expect("node state poisoned") = Some(record.clone());
            *self.master_json.lock().expect("node state poisoned") =
                serde_json::to_vec(&record).ok().map(Bytes::from);
        }

        self.sub_conn.connect(ConnectTarget {
            name: record.name.clone(),
            endpoint: sub_endpoint,
        });
        self.pub_conn.connect(ConnectTarget {
            name: record.name.clone(),
            endpoint: pub_endpoint,
        });

        if let Some(broker) = &self.broker {
            if record.name == self.identity.name() {
                broker.start_heartbeats();
            } else {
                broker.stop_heartbeats();
            }
        }
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }
}

/// Resolve-and-connect retry loop: runs until the node is ready or
/// inactive. Failed rounds and failed connects simply retry after the check
/// interval, since the cluster is assumed eventually reachable.
fn spawn_seek(inner: &Arc<NodeInner>) {
    let mut seek = inner.seek.lock().expect("node state poisoned");
    if seek.as_ref().is_some_and(|task| !task.is_finished()) {
        return;
    }

    let weak = Arc::downgrade(inner);
    *seek = Some(tokio::spawn(async move {
        loop {
            {
                let Some(inner) = weak.upgrade() else { return };
                if !inner.is_active() || inner.is_ready() {
                    return;
                }
                let resolved = match &inner.resolver {
                    Resolver::Elector(elector) => elector.resolve(None).await,
                    Resolver::Finder(finder) => finder.resolve().await,
                };
                match resolved {
                    Ok(record) => inner.connect_to_master(record),
                    Err(e) => {
                        debug!(node = %inner.identity.name(), error = %e, "master resolution failed; retrying");
                    }
                }
            }
            tokio::time::sleep(HEARTBEAT_INTERVAL_CHECK).await;
        }
    }));
}

async fn dispatch_loop(weak: Weak<NodeInner>, mut rx: Receivers) {
    loop {
        tokio::select! {
            event = rx.pub_rx.recv() => {
                let Some(event) = event else { break };
                let Some(inner) = weak.upgrade() else { break };
                handle_pub_event(&inner, event);
            }
            event = rx.sub_rx.recv() => {
                let Some(event) = event else { break };
                let Some(inner) = weak.upgrade() else { break };
                handle_sub_event(&inner, event);
            }
            record = rx.elected_rx.recv() => {
                let Some(record) = record else { break };
                let Some(inner) = weak.upgrade() else { break };
                inner.connect_to_master(record);
            }
        }
    }
}

fn handle_pub_event(inner: &Arc<NodeInner>, event: ConnEvent) {
    match event {
        ConnEvent::Connect => {
            let mut flags = inner.flags.lock().expect("node state poisoned");
            flags.can_publish = true;
            inner.emit(NodeEvent::CanPublish);
            if flags.receiving {
                if !flags.ever_connected {
                    flags.ever_connected = true;
                    inner.emit(NodeEvent::Connect);
                }
                inner.emit(NodeEvent::Ready);
            }
        }
        ConnEvent::Disconnect => {
            {
                let mut flags = inner.flags.lock().expect("node state poisoned");
                flags.can_publish = false;
                inner.emit(NodeEvent::CannotPublish);
                if flags.receiving {
                    inner.emit(NodeEvent::NotReady);
                }
                emit_full_disconnect(inner, &mut flags);
            }
            spawn_seek(inner);
        }
        _ => {}
    }
}

fn handle_sub_event(inner: &Arc<NodeInner>, event: ConnEvent) {
    match event {
        ConnEvent::Connect => {
            let mut flags = inner.flags.lock().expect("node state poisoned");
            flags.receiving = true;
            inner.emit(NodeEvent::Receiving);
            if flags.can_publish {
                if !flags.ever_connected {
                    flags.ever_connected = true;
                    inner.emit(NodeEvent::Connect);
                }
                inner.emit(NodeEvent::Ready);
            }
        }
        ConnEvent::Disconnect => {
            {
                *inner.master.lock().expect("node state poisoned") = None;
                *inner.master_json.lock().expect("node state poisoned") = None;
            }
            {
                let mut flags = inner.flags.lock().expect("node state poisoned");
                flags.receiving = false;
                inner.emit(NodeEvent::NotReceiving);
                if flags.can_publish {
                    inner.emit(NodeEvent::NotReady);
                }
                emit_full_disconnect(inner, &mut flags);
            }
            spawn_seek(inner);
        }
        ConnEvent::MissingMaster => {
            inner.pub_conn.disconnect();
            spawn_seek(inner);
        }
        ConnEvent::NewMaster(record) => {
            inner.connect_to_master(record);
        }
        ConnEvent::Heartbeat => {
            // republish the master descriptor for passive edge listeners
            if let Some(updater) = &inner.updater {
                let json = inner
                    .master_json
                    .lock()
                    .expect("node state poisoned")
                    .clone();
                if let Some(json) = json {
                    updater.publish(CHANNEL_HEARTBEATS, json);
                }
            }
        }
        ConnEvent::Message { channel, parts } => {
            inner.emit(NodeEvent::Message { channel, parts });
        }
    }
}

fn emit_full_disconnect(inner: &Arc<NodeInner>, flags: &mut Flags) {
    if flags.ever_connected && !flags.can_publish && !flags.receiving {
        flags.ever_connected = false;
        inner.emit(NodeEvent::Disconnect);
    }
}
