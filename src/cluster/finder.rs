//! Master discovery for non-voting nodes.
//!
//! External nodes never vote; they ask every reachable member for the
//! current master and take the first answer that names one. The race has a
//! single overall deadline; an all-`false` or silent cluster fails the
//! round and the caller retries.

use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::mpsc;
use tracing::debug;

use crate::cluster::directory::PeerDirectory;
use crate::constants::HEARTBEAT_TIMEOUT;
use crate::error::{Error, Result};
use crate::protocol::{CoordinationMessage, Envelope, MasterRecord, decode_master_reply};
use crate::transport::request;

type SharedFind = Shared<BoxFuture<'static, Result<MasterRecord>>>;

/// Discovery component owned by external nodes. Binds no sockets; it only
/// originates request/reply calls.
#[derive(Clone)]
pub struct MasterFinder {
    inner: Arc<FinderInner>,
}

struct FinderInner {
    name: String,
    directory: Arc<dyn PeerDirectory>,
    inflight: Mutex<Option<SharedFind>>,
}

impl MasterFinder {
    pub fn new(name: impl Into<String>, directory: Arc<dyn PeerDirectory>) -> Self {
        Self {
            inner: Arc::new(FinderInner {
                name: name.into(),
                directory,
                inflight: Mutex::new(None),
            }),
        }
    }

    /// Whether a discovery round is currently in flight.
    pub fn is_resolving(&self) -> bool {
        self.inner.inflight.lock().expect("finder state poisoned").is_some()
    }

    /// Run (or join) a discovery round and return the first master any peer
    /// reports.
    pub async fn resolve(&self) -> Result<MasterRecord> {
        let find = {
            let mut inflight = self.inner.inflight.lock().expect("finder state poisoned");
            if let Some(find) = inflight.as_ref() {
                find.clone()
            } else {
                let inner = self.inner.clone();
                let find: SharedFind = run_find(inner).boxed().shared();
                *inflight = Some(find.clone());
                find
            }
        };
        find.await
    }
}

async fn run_find(inner: Arc<FinderInner>) -> Result<MasterRecord> {
    let result = find_round(&inner).await;
    *inner.inflight.lock().expect("finder state poisoned") = None;
    result
}

async fn find_round(inner: &Arc<FinderInner>) -> Result<MasterRecord> {
    let addrs = inner.directory.resolve().await?;
    debug!(node = %inner.name, peers = addrs.len(), "seeking master");

    let (tx, mut rx) = mpsc::unbounded_channel();
    for addr in addrs {
        let tx = tx.clone();
        let name = inner.name.clone();
        tokio::spawn(async move {
            let envelope = Envelope::new(
                CoordinationMessage::MasterRequest,
                addr.ip().to_string(),
                Some(name),
            );
            let Ok(payload) = envelope.to_bytes() else {
                return;
            };
            if let Ok(reply) = request(addr, payload, HEARTBEAT_TIMEOUT).await {
                if let Some(master) = decode_master_reply(&reply) {
                    let _ = tx.send(master);
                }
            }
        });
    }
    drop(tx);

    // first answer wins; recv() also ends early once every peer came back
    // empty-handed
    match tokio::time::timeout(HEARTBEAT_TIMEOUT, rx.recv()).await {
        Ok(Some(master)) => {
            debug!(node = %inner.name, master = %master.name, "discovered master");
            Ok(master)
        }
        _ => {
            debug!(node = %inner.name, "failed to discover a master");
            Err(Error::ElectionFailed)
        }
    }
}
