//! Peer discovery.
//!
//! Every broadcast and vote operation starts from the current set of peer
//! coordination addresses. Production deployments resolve them from a DNS
//! name whose A records list the member hosts; tests inject a static list so
//! several nodes can share one host on distinct ports.

use std::net::SocketAddr;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};

/// Source of the current peer coordination addresses.
#[async_trait]
pub trait PeerDirectory: Send + Sync + 'static {
    /// Resolve the current set of peer coordination addresses.
    async fn resolve(&self) -> Result<Vec<SocketAddr>>;
}

/// DNS-backed directory: resolves the configured hostname and fans its IPv4
/// records out over the fixed coordination port.
#[derive(Clone, Debug)]
pub struct DnsDirectory {
    host: String,
    coordination_port: u16,
}

impl DnsDirectory {
    pub fn new(host: impl Into<String>, coordination_port: u16) -> Self {
        Self {
            host: host.into(),
            coordination_port,
        }
    }
}

#[async_trait]
impl PeerDirectory for DnsDirectory {
    async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> =
            tokio::net::lookup_host((self.host.as_str(), self.coordination_port))
                .await
                .map_err(|e| Error::Discovery {
                    host: self.host.clone(),
                    reason: e.to_string(),
                })?
                .filter(|addr| addr.is_ipv4())
                .collect();

        if addrs.is_empty() {
            return Err(Error::Discovery {
                host: self.host.clone(),
                reason: "no IPv4 records".to_string(),
            });
        }

        debug!(host = %self.host, peers = addrs.len(), "resolved peer addresses");
        Ok(addrs)
    }
}

/// Fixed-address directory for tests and static deployments.
#[derive(Clone, Debug)]
pub struct StaticDirectory {
    addrs: Vec<SocketAddr>,
}

impl StaticDirectory {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self { addrs }
    }
}

#[async_trait]
impl PeerDirectory for StaticDirectory {
    async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        Ok(self.addrs.clone())
    }
}
