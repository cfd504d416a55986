//! # dnsbus
//! Self-organizing message bus over DNS-discovered peers.
//!
//! A set of peer nodes, discovered by resolving one DNS name, elects one
//! member as master, routes all publish/subscribe traffic through that
//! master, detects master failure via heartbeats, and re-elects to keep the
//! bus available. Two kinds of node participate: full cluster members
//! (voting, electable) and external clients (non-voting consumers of the
//! bus).
//!
//! # Goals
//! - No fixed broker: any member can take the master role, and the role
//!   migrates on failure or graceful shutdown
//! - No master switch ever loses a published message; duplicate deliveries
//!   from the switch window are deduplicated by sequence number
//! - Lightweight coordination: a bounded, deterministic election round in
//!   place of heavyweight consensus
//!
//! # Getting started
//!
//! ```rust,no_run
//! use dnsbus::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::new(NodeConfig::new("bus.internal"))?;
//!     node.activate().await?;
//!
//!     let mut events = node.events();
//!     node.subscribe(["orders"]);
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             NodeEvent::Ready => node.publish("orders", ["hello".as_bytes().to_vec()]),
//!             NodeEvent::Message { channel, parts } => {
//!                 println!("{channel}: {} frames", parts.len());
//!             }
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Member nodes must all listen on the same coordination port, reachable
//! through the addresses the DNS name resolves to. External nodes only need
//! the same DNS name; they never bind anything.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod config;
pub mod connection;
pub mod constants;
mod encode;
pub mod error;
pub mod identity;
mod parser;
pub mod protocol;
pub mod telemetry;
pub mod transport;

mod node;

pub use config::NodeConfig;
pub use error::{Error, Result};
pub use node::{Node, NodeEvent, NodeType};

pub mod prelude {
    //! The node-facing API surface.
    pub use crate::cluster::{DnsDirectory, PeerDirectory, StaticDirectory};
    pub use crate::config::NodeConfig;
    pub use crate::error::{Error, Result};
    pub use crate::node::{Node, NodeEvent, NodeType};
    pub use crate::protocol::{Endpoints, MasterRecord};
}
