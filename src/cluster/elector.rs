//! The voting protocol.
//!
//! Master election here is deliberately lightweight: no terms, no quorum, no
//! log. One round fans a `voteRequest` out to every peer the directory
//! lists (self included), collects the candidate records that arrive before
//! the per-peer deadline, restricts the pool to candidates already reporting
//! the master role when any do, and picks the lexicographically smallest id.
//! The winner is broadcast fire-and-forget; lost messages are healed by the
//! next round, which callers trigger on demand.
//!
//! Concurrent `resolve` calls from one node coalesce onto the same in-flight
//! round; there are never parallel elections from a single caller.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cluster::broker::MasterBroker;
use crate::cluster::directory::PeerDirectory;
use crate::config::NodeConfig;
use crate::constants::BROADCAST_LINGER;
use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::protocol::{
    CandidateRecord, CoordinationMessage, Envelope, MasterRecord, encode_master_reply,
};
use crate::transport::{ReplyHandle, RouterSocket, request};

type SharedElection = Shared<BoxFuture<'static, Result<MasterRecord>>>;

/// Apply the tie-break rule to one round's surviving candidates: restrict
/// the pool to candidates reporting `isMaster` when any do, then take the
/// smallest id. Deterministic for any input set.
pub fn pick_winner(candidates: &[CandidateRecord]) -> Option<&CandidateRecord> {
    let masters: Vec<&CandidateRecord> = candidates.iter().filter(|c| c.is_master).collect();
    let pool = if masters.is_empty() {
        candidates.iter().collect::<Vec<_>>()
    } else {
        masters
    };
    pool.into_iter().min_by(|a, b| a.id.cmp(&b.id))
}

/// Voting-protocol component owned by every member node.
///
/// Cheap to clone; all clones share the coordination socket and election
/// state.
#[derive(Clone)]
pub struct MasterElector {
    inner: Arc<ElectorInner>,
}

struct ElectorInner {
    identity: NodeId,
    coordination_port: u16,
    vote_timeout: Duration,
    directory: Arc<dyn PeerDirectory>,
    broker: MasterBroker,
    /// The master this node is currently connected to, shared with the
    /// owning node; answers `masterRequest`.
    connected_master: Arc<Mutex<Option<MasterRecord>>>,
    /// Elected-master notifications towards the owning node.
    events: mpsc::UnboundedSender<MasterRecord>,
    /// Id advertised instead of the real one while resigning.
    advertise: Mutex<Option<String>>,
    /// Last announced winner, for duplicate suppression.
    known_master_id: Mutex<Option<String>>,
    inflight: Mutex<Option<SharedElection>>,
    inbox_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ElectorInner {
    fn drop(&mut self) {
        if let Some(task) = self.inbox_task.lock().expect("elector state poisoned").take() {
            task.abort();
        }
    }
}

impl MasterElector {
    pub fn new(
        identity: NodeId,
        config: &NodeConfig,
        directory: Arc<dyn PeerDirectory>,
        broker: MasterBroker,
        connected_master: Arc<Mutex<Option<MasterRecord>>>,
        events: mpsc::UnboundedSender<MasterRecord>,
    ) -> Self {
        Self {
            inner: Arc::new(ElectorInner {
                identity,
                coordination_port: config.coordination_port,
                vote_timeout: config.vote_timeout,
                directory,
                broker,
                connected_master,
                events,
                advertise: Mutex::new(None),
                known_master_id: Mutex::new(None),
                inflight: Mutex::new(None),
                inbox_task: Mutex::new(None),
            }),
        }
    }

    /// Bind the coordination socket and start answering peers. Idempotent.
    pub async fn bind(&self) -> Result<()> {
        let mut task = self.inner.inbox_task.lock().expect("elector state poisoned");
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        let router = RouterSocket::bind(self.inner.coordination_port).await?;
        debug!(
            node = %self.inner.identity.name(),
            port = router.local_port(),
            "coordination socket bound"
        );
        let weak = Arc::downgrade(&self.inner);
        *task = Some(tokio::spawn(inbox_loop(weak, router)));
        Ok(())
    }

    /// Stop answering peers and release the coordination port. Idempotent.
    pub fn unbind(&self) {
        if let Some(task) = self.inner.inbox_task.lock().expect("elector state poisoned").take() {
            task.abort();
        }
    }

    /// Whether an election round is currently in flight.
    pub fn is_resolving(&self) -> bool {
        self.inner.inflight.lock().expect("elector state poisoned").is_some()
    }

    /// Run (or join) an election and return the winner.
    ///
    /// `advertise_id` lets a resigning node announce a throwaway identity
    /// that cannot win while still answering votes; the real identity is
    /// never touched.
    pub async fn resolve(&self, advertise_id: Option<String>) -> Result<MasterRecord> {
        let election = {
            let mut inflight = self.inner.inflight.lock().expect("elector state poisoned");
            if let Some(election) = inflight.as_ref() {
                election.clone()
            } else {
                if advertise_id.is_some() {
                    *self.inner.advertise.lock().expect("elector state poisoned") =
                        advertise_id;
                }
                let inner = self.inner.clone();
                let election: SharedElection = run_election(inner).boxed().shared();
                *inflight = Some(election.clone());
                election
            }
        };
        election.await
    }
}

async fn run_election(inner: Arc<ElectorInner>) -> Result<MasterRecord> {
    let result = election_round(&inner).await;

    *inner.advertise.lock().expect("elector state poisoned") = None;
    *inner.inflight.lock().expect("elector state poisoned") = None;

    match &result {
        Ok(master) => {
            debug!(node = %inner.identity.name(), master = %master.name, "elected master")
        }
        Err(e) => warn!(node = %inner.identity.name(), error = %e, "election round failed"),
    }
    result
}

async fn election_round(inner: &Arc<ElectorInner>) -> Result<MasterRecord> {
    let addrs = inner.directory.resolve().await?;
    debug!(
        node = %inner.identity.name(),
        peers = addrs.len(),
        "requesting votes"
    );

    let votes = futures::future::join_all(addrs.iter().map(|addr| request_vote(inner, *addr)));
    let candidates: Vec<CandidateRecord> = votes
        .await
        .into_iter()
        .flatten()
        .filter(|c| c.candidate && c.endpoints.is_some())
        .collect();

    let winner = match pick_winner(&candidates) {
        Some(winner) => winner.clone(),
        None => return Err(Error::ElectionFailed),
    };
    let endpoints = winner.endpoints.ok_or(Error::ElectionFailed)?;
    let record = MasterRecord {
        id: winner.id,
        name: winner.name,
        endpoints,
        is_master: winner.is_master,
    };

    broadcast_elected(inner, &addrs, &record);
    Ok(record)
}

async fn request_vote(inner: &Arc<ElectorInner>, addr: SocketAddr) -> Option<CandidateRecord> {
    let envelope = Envelope::new(
        CoordinationMessage::VoteRequest,
        addr.ip().to_string(),
        Some(inner.identity.name().to_string()),
    );
    let payload = envelope.to_bytes().ok()?;

    match request(addr, payload, inner.vote_timeout).await {
        Ok(reply) if !reply.is_empty() => match serde_json::from_slice::<CandidateRecord>(&reply) {
            Ok(candidate) => {
                if candidate.candidate {
                    debug!(
                        node = %inner.identity.name(),
                        candidate = %candidate.name,
                        is_master = candidate.is_master,
                        "received vote"
                    );
                }
                Some(candidate)
            }
            Err(e) => {
                debug!(node = %inner.identity.name(), %addr, error = %e, "invalid vote reply");
                None
            }
        },
        Ok(_) => None,
        Err(e) => {
            debug!(node = %inner.identity.name(), %addr, error = %e, "missed vote by peer");
            None
        }
    }
}

/// Announce the winner to every peer, fire-and-forget: each request socket
/// closes on the acknowledgement or after the linger period, whichever
/// comes first.
fn broadcast_elected(inner: &Arc<ElectorInner>, addrs: &[SocketAddr], record: &MasterRecord) {
    for addr in addrs {
        let addr = *addr;
        let envelope = Envelope::new(
            CoordinationMessage::MasterElected(record.clone()),
            addr.ip().to_string(),
            Some(inner.identity.name().to_string()),
        );
        tokio::spawn(async move {
            if let Ok(payload) = envelope.to_bytes() {
                let _ = request(addr, payload, BROADCAST_LINGER).await;
            }
        });
    }
}

async fn inbox_loop(weak: std::sync::Weak<ElectorInner>, mut router: RouterSocket) {
    while let Some((payload, reply)) = router.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let envelope = match Envelope::from_bytes(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(
                    node = %inner.identity.name(),
                    error = %e,
                    "ignoring malformed coordination message"
                );
                continue;
            }
        };

        // the dialed address is this node's externally visible one
        if let Ok(ip) = envelope.to_address.parse() {
            inner.broker.set_ip(ip);
        }

        match envelope.message {
            CoordinationMessage::VoteRequest => answer_vote(&inner, envelope.from, reply),
            CoordinationMessage::MasterRequest => {
                let master = inner
                    .connected_master
                    .lock()
                    .expect("elector state poisoned")
                    .clone();
                reply.reply(encode_master_reply(master.as_ref()));
            }
            CoordinationMessage::MasterElected(record) => {
                reply.reply(Bytes::new());
                handle_master_elected(&inner, record);
            }
        }
    }
}

fn answer_vote(inner: &Arc<ElectorInner>, from: Option<String>, reply: ReplyHandle) {
    let advertise = inner.advertise.lock().expect("elector state poisoned").clone();
    let own_name = inner.identity.name();
    debug!(
        node = %own_name,
        to = %from.as_deref().map(|f| if f == own_name { "myself" } else { f }).unwrap_or("unknown"),
        "sending vote"
    );

    let candidate = CandidateRecord {
        id: advertise
            .clone()
            .unwrap_or_else(|| inner.identity.id().to_string()),
        name: own_name.to_string(),
        endpoints: inner.broker.endpoints(),
        is_master: inner.broker.is_master(),
        candidate: advertise.is_none(),
    };
    match serde_json::to_vec(&candidate) {
        Ok(encoded) => reply.reply(Bytes::from(encoded)),
        Err(e) => {
            warn!(node = %own_name, error = %e, "could not encode own candidate record");
        }
    }
}

fn handle_master_elected(inner: &Arc<ElectorInner>, record: MasterRecord) {
    let mut known = inner.known_master_id.lock().expect("elector state poisoned");
    if known.as_deref() == Some(record.id.as_str()) {
        debug!(
            node = %inner.identity.name(),
            master = %record.name,
            "confirmed current master"
        );
        return;
    }
    *known = Some(record.id.clone());
    debug!(
        node = %inner.identity.name(),
        master = %record.name,
        "received notice of master election"
    );
    let _ = inner.events.send(record);
}
