//! Node configuration.
//!
//! Settings are validated synchronously at node construction; invalid
//! settings are fatal ([`Error::Config`]) and never retried. Everything has
//! a sensible default except `host`, which names the DNS entry resolving to
//! the cluster's peer addresses and is always required.

use std::time::Duration;

use tracing::warn;

use crate::constants::{
    DEFAULT_COORDINATION_PORT, DEFAULT_EXTERNAL_UPDATES_PORT, DEFAULT_VOTE_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::identity::MAX_ELECTION_PRIORITY;

/// Configuration for a bus node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeConfig {
    /// DNS name resolving to the IPv4 addresses of the member nodes.
    pub host: String,

    /// Whether this node is a non-voting external client.
    ///
    /// External nodes only discover and follow the master; they never vote,
    /// are never electable, and bind no sockets.
    pub external: bool,

    /// Election priority, `0..=99`. Lower numbers are more preferred: the
    /// priority forms the leading, zero-padded prefix of the node id and
    /// elections pick the smallest id.
    pub election_priority: u8,

    /// Port of the coordination (vote/discovery) request socket every member
    /// node binds.
    pub coordination_port: u16,

    /// Port of the fanout socket on which member nodes republish master
    /// heartbeats for passive external listeners.
    pub external_updates_port: u16,

    /// Per-peer deadline for a vote reply within one election round.
    pub vote_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            external: false,
            election_priority: 0,
            coordination_port: DEFAULT_COORDINATION_PORT,
            external_updates_port: DEFAULT_EXTERNAL_UPDATES_PORT,
            vote_timeout: DEFAULT_VOTE_TIMEOUT,
        }
    }
}

impl NodeConfig {
    /// Configuration with the given discovery host and default settings.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables.
    ///
    /// - `DNSBUS_HOST`: peer-discovery hostname (required here too)
    /// - `DNSBUS_EXTERNAL`: `true`/`1` for a non-voting external node
    /// - `DNSBUS_ELECTION_PRIORITY`: `0..=99` (default: 0)
    /// - `DNSBUS_COORDINATION_PORT`: coordination socket port (default: 50061)
    /// - `DNSBUS_EXTERNAL_UPDATES_PORT`: updates fanout port (default: 50081)
    /// - `DNSBUS_VOTE_TIMEOUT_MS`: vote reply deadline (default: 50)
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let host = std::env::var("DNSBUS_HOST")
            .map_err(|_| Error::Config("DNSBUS_HOST is mandatory".to_string()))?;

        let external = std::env::var("DNSBUS_EXTERNAL")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE"))
            .unwrap_or(defaults.external);

        let election_priority = std::env::var("DNSBUS_ELECTION_PRIORITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.election_priority);

        let coordination_port = std::env::var("DNSBUS_COORDINATION_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.coordination_port);

        let external_updates_port = std::env::var("DNSBUS_EXTERNAL_UPDATES_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.external_updates_port);

        let vote_timeout = std::env::var("DNSBUS_VOTE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.vote_timeout);

        let config = Self {
            host,
            external,
            election_priority,
            coordination_port,
            external_updates_port,
            vote_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Returns [`Error::Config`] on the first violation. A very small
    /// `vote_timeout` is legal but logged, since it requires a performant
    /// network to avoid losing member votes.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host is mandatory".to_string()));
        }
        if self.coordination_port == 0 {
            return Err(Error::Config(
                "coordination_port should be a positive integer".to_string(),
            ));
        }
        if self.external_updates_port == 0 {
            return Err(Error::Config(
                "external_updates_port should be a positive integer".to_string(),
            ));
        }
        if self.coordination_port == self.external_updates_port {
            return Err(Error::Config(
                "coordination_port and external_updates_port should be different".to_string(),
            ));
        }
        if !self.external {
            if self.election_priority > MAX_ELECTION_PRIORITY {
                return Err(Error::Config(
                    "election_priority should be an integer between 0 and 99".to_string(),
                ));
            }
            if self.vote_timeout.is_zero() {
                return Err(Error::Config(
                    "vote_timeout should be a positive duration".to_string(),
                ));
            }
            if self.vote_timeout < DEFAULT_VOTE_TIMEOUT {
                warn!(
                    vote_timeout_ms = self.vote_timeout.as_millis() as u64,
                    "low vote_timeout requires a performant network to avoid losing member votes"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::new("bus.internal");
        assert_eq!(config.host, "bus.internal");
        assert!(!config.external);
        assert_eq!(config.election_priority, 0);
        assert_eq!(config.coordination_port, 50061);
        assert_eq!(config.external_updates_port, 50081);
        assert_eq!(config.vote_timeout, Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_host_rejected() {
        let config = NodeConfig::new("  ");
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_ports_rejected() {
        let mut config = NodeConfig::new("bus.internal");
        config.coordination_port = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::new("bus.internal");
        config.external_updates_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_colliding_ports_rejected() {
        let mut config = NodeConfig::new("bus.internal");
        config.external_updates_port = config.coordination_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_vote_timeout_rejected_for_members() {
        let mut config = NodeConfig::new("bus.internal");
        config.vote_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        // external nodes never vote, so the timeout is not checked
        config.external = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_out_of_range_priority_rejected() {
        let mut config = NodeConfig::new("bus.internal");
        config.election_priority = 100;
        assert!(config.validate().is_err());
    }
}
