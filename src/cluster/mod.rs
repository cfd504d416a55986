//! Cluster coordination: peer discovery, master election, liveness.
//!
//! # Architecture
//!
//! ```text
//!            ┌─────────────┐  voteRequest / masterElected  ┌─────────────┐
//!            │   member    │◄─────────────────────────────►│   member    │
//!            │ (elector)   │                               │ (elector)   │
//!            └──────┬──────┘                               └──────┬──────┘
//!                   │            elected master                   │
//!                   └────────────────┐  ┌────────────────────────┘
//!                                    ▼  ▼
//!                              ┌────────────┐  heartbeats + relay
//!                              │   master   │◄────────────────────┐
//!                              │  (broker)  │────────────────────►│ all nodes
//!                              └────────────┘   pub/sub traffic   │
//!                                    ▲
//!                   masterRequest    │
//!            ┌─────────────┐─────────┘
//!            │  external   │
//!            │  (finder)   │
//!            └─────────────┘
//! ```
//!
//! Every member binds a [`MasterElector`] answering votes and a dormant
//! [`MasterBroker`]; whichever member wins an election starts heartbeating
//! through its broker, and everyone else points their connections at it.
//! [`MasterFinder`] serves non-voting externals, [`HeartbeatMonitor`] turns
//! silence into re-elections, and [`ExternalUpdater`] republishes liveness
//! for passive edge listeners.

mod broker;
mod directory;
mod elector;
mod finder;
mod monitor;
mod updater;

pub use broker::MasterBroker;
pub use directory::{DnsDirectory, PeerDirectory, StaticDirectory};
pub use elector::{MasterElector, pick_winner};
pub use finder::MasterFinder;
pub use monitor::HeartbeatMonitor;
pub use updater::ExternalUpdater;
