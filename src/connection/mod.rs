//! Per-node connections to the current master.
//!
//! [`PubConnection`] and [`SubConnection`] share one shape: a connection
//! manager that can re-point itself at a new master while the old link stays
//! live, so a master switch never drops in-flight traffic. They differ only
//! in direction: publishing into the master's intake versus receiving its
//! fanout.
//!
//! Both report to their owning node through a typed event channel instead of
//! callbacks; the node folds those events into its readiness state.

mod pub_conn;
mod sub_conn;

pub use pub_conn::PubConnection;
pub use sub_conn::SubConnection;

use std::net::SocketAddr;

use bytes::Bytes;
use dashmap::DashMap;

use crate::protocol::MasterRecord;

/// Where a connection should point: the master's name (used to suppress
/// redundant reconnects) and one of its transport endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectTarget {
    pub name: String,
    pub endpoint: SocketAddr,
}

/// Notifications a connection sends its owning node.
#[derive(Clone, Debug)]
pub enum ConnEvent {
    /// First successful connection of this connection's lifetime segment;
    /// silent master switches do not re-emit it.
    Connect,
    /// The active connection closed.
    Disconnect,
    /// The silence watchdog declared the master missing; the connection has
    /// already force-disconnected itself.
    MissingMaster,
    /// A master heartbeat arrived on the subscribe side.
    Heartbeat,
    /// The master announced a successor.
    NewMaster(MasterRecord),
    /// An application message passed filtering and deduplication.
    Message { channel: String, parts: Vec<Bytes> },
}

/// Highest sequence number seen per publisher name.
///
/// The grace-period overlap between the old and new master sockets delivers
/// some messages twice; dropping any sequence that is not strictly greater
/// than the last seen absorbs the duplicates. The key space is bounded by
/// the set of concurrently publishing node names, so the map never needs
/// eviction; it survives master migrations and only resets with the
/// process.
#[derive(Debug, Default)]
pub struct SequenceLedger {
    last_seen: DashMap<String, u64>,
}

impl SequenceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `sequence` for `publisher`; returns whether the message is
    /// fresh and should be delivered.
    pub fn accept(&self, publisher: &str, sequence: u64) -> bool {
        match self.last_seen.entry(publisher.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if *entry.get() >= sequence {
                    false
                } else {
                    entry.insert(sequence);
                    true
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(sequence);
                true
            }
        }
    }
}
