//! The master's message relay.
//!
//! Every member node carries a dormant broker: a pub/sub endpoint pair bound
//! on ephemeral ports, where every message received on the intake side is
//! re-sent on the fanout side. The pair only matters while this node holds
//! the master role: that is when peers point their connections at it and
//! the broker emits heartbeats.
//!
//! The broker's externally visible IP is never self-reported: it is learned
//! lazily, exactly once, from the address an inbound coordination message
//! was sent to.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use once_cell::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::constants::HEARTBEAT_INTERVAL;
use crate::error::Result;
use crate::protocol::{CHANNEL_HEARTBEATS, CHANNEL_NEW_MASTER, Endpoints, MasterRecord};
use crate::transport::{PubSocket, SubSocket};

/// Relay component owned by every member node.
///
/// Cheap to clone; all clones share the bound sockets and heartbeat state.
#[derive(Clone, Debug)]
pub struct MasterBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug)]
struct BrokerInner {
    name: String,
    ip: OnceCell<IpAddr>,
    bound: Mutex<Option<BoundPair>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    is_master: AtomicBool,
}

#[derive(Debug)]
struct BoundPair {
    fanout: PubSocket,
    relay_task: JoinHandle<()>,
    pub_port: u16,
    sub_port: u16,
}

impl Drop for BoundPair {
    fn drop(&mut self) {
        self.relay_task.abort();
        self.fanout.close();
    }
}

impl Drop for BrokerInner {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat_task.lock().expect("broker state poisoned").take() {
            task.abort();
        }
    }
}

impl MasterBroker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                name: name.into(),
                ip: OnceCell::new(),
                bound: Mutex::new(None),
                heartbeat_task: Mutex::new(None),
                is_master: AtomicBool::new(false),
            }),
        }
    }

    /// Bind the intake/fanout pair on ephemeral ports and start relaying.
    /// Idempotent.
    pub async fn bind(&self) -> Result<()> {
        if self.inner.bound.lock().expect("broker state poisoned").is_some() {
            return Ok(());
        }

        let (mut intake, sub_port) = SubSocket::bind(0).await?;
        let fanout = PubSocket::bind(0).await?;
        let pub_port = fanout.local_port().unwrap_or_default();

        let relay_fanout = fanout.clone();
        let relay_task = tokio::spawn(async move {
            while let Some(frames) = intake.recv().await {
                relay_fanout.send(&frames);
            }
        });

        let mut bound = self.inner.bound.lock().expect("broker state poisoned");
        if bound.is_some() {
            // lost the race against a concurrent bind
            relay_task.abort();
            fanout.close();
            return Ok(());
        }
        debug!(name = %self.inner.name, sub_port, pub_port, "broker bound");
        *bound = Some(BoundPair {
            fanout,
            relay_task,
            pub_port,
            sub_port,
        });
        Ok(())
    }

    /// Stop heartbeats and close the relay pair. Idempotent.
    pub fn unbind(&self) {
        self.stop_heartbeats();
        if let Some(pair) = self.inner.bound.lock().expect("broker state poisoned").take() {
            drop(pair);
            debug!(name = %self.inner.name, "broker unbound");
        }
    }

    /// Record the externally observed IP. First observer wins; subsequent
    /// calls are no-ops.
    pub fn set_ip(&self, ip: IpAddr) {
        if self.inner.ip.set(ip).is_ok() {
            debug!(name = %self.inner.name, %ip, "discovered own IP");
        }
    }

    /// The advertised endpoint pair, available once bound and the IP is
    /// known.
    pub fn endpoints(&self) -> Option<Endpoints> {
        let ip = self.inner.ip.get()?;
        let bound = self.inner.bound.lock().expect("broker state poisoned");
        let pair = bound.as_ref()?;
        Some(Endpoints {
            pub_addr: format!("{ip}:{}", pair.pub_port),
            sub_addr: format!("{ip}:{}", pair.sub_port),
        })
    }

    /// Whether this node currently emits master heartbeats.
    pub fn is_master(&self) -> bool {
        self.inner.is_master.load(Ordering::SeqCst)
    }

    /// Start emitting heartbeats through the fanout. Idempotent: a second
    /// call never produces a duplicate timer.
    pub fn start_heartbeats(&self) {
        self.inner.is_master.store(true, Ordering::SeqCst);

        let mut task = self.inner.heartbeat_task.lock().expect("broker state poisoned");
        if task.is_some() {
            return;
        }

        if self.fanout().is_none() {
            return;
        }
        debug!(name = %self.inner.name, "starting heartbeats");

        let weak = Arc::downgrade(&self.inner);
        let name = self.inner.name.clone();
        *task = Some(tokio::spawn(async move {
            let beat = [
                Bytes::from_static(CHANNEL_HEARTBEATS.as_bytes()),
                Bytes::from(name.into_bytes()),
            ];
            loop {
                let fanout = match weak.upgrade() {
                    Some(inner) => inner.fanout(),
                    None => break,
                };
                let Some(fanout) = fanout else { break };
                trace!("heartbeat");
                fanout.send(&beat);
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            }
        }));
    }

    /// Stop emitting heartbeats. Idempotent.
    pub fn stop_heartbeats(&self) {
        self.inner.is_master.store(false, Ordering::SeqCst);
        if let Some(task) = self.inner.heartbeat_task.lock().expect("broker state poisoned").take()
        {
            debug!(name = %self.inner.name, "stopping heartbeats");
            task.abort();
        }
    }

    /// Announce a just-elected master to every connected node, so lingering
    /// subscribers learn of a handoff without waiting for a silence timeout.
    pub fn signal_new_master(&self, record: &MasterRecord) -> Result<()> {
        if let Some(fanout) = self.fanout() {
            debug!(name = %self.inner.name, new_master = %record.name, "signaling new master");
            let payload = Bytes::from(serde_json::to_vec(record)?);
            fanout.send(&[
                Bytes::from_static(CHANNEL_NEW_MASTER.as_bytes()),
                payload,
            ]);
        }
        Ok(())
    }

    fn fanout(&self) -> Option<PubSocket> {
        self.inner.fanout()
    }
}

impl BrokerInner {
    fn fanout(&self) -> Option<PubSocket> {
        self.bound
            .lock()
            .expect("broker state poisoned")
            .as_ref()
            .map(|pair| pair.fanout.clone())
    }
}
