//! Centralized timing and framing constants.
//!
//! This module consolidates the magic numbers used throughout the bus.
//! Having them in one place makes it easier to:
//!
//! - Understand the relationships between the timing constants
//! - Update values consistently
//! - Document the rationale for each constant
//!
//! # Categories
//!
//! - **Heartbeat Constants**: master liveness emission and detection
//! - **Election Constants**: vote collection and winner broadcast deadlines
//! - **Connection Constants**: master-switch timing
//! - **Framing Constants**: wire message bounds
//! - **Port Constants**: default coordination/update ports

use std::time::Duration;

// =============================================================================
// Heartbeat Constants
// =============================================================================

/// Interval between heartbeats emitted by the master's broadcast relay.
///
/// Must be well below [`HEARTBEAT_TIMEOUT`] so that a healthy master is
/// never declared missing between two beats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(350);

/// Cadence of the silence checks run by nodes that are not master, and the
/// retry delay of the master-resolution loop.
pub const HEARTBEAT_INTERVAL_CHECK: Duration = Duration::from_millis(200);

/// Silence threshold after which the master is declared missing.
///
/// Any traffic on the subscribe connection (heartbeat or data) re-arms the
/// watchdog; only complete silence for this long triggers a re-election.
/// Also bounds a non-voting node's master discovery round.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(1000);

// =============================================================================
// Election Constants
// =============================================================================

/// Default per-peer deadline for a vote reply.
///
/// Votes that arrive after the deadline are simply absent from the round;
/// there is no retry within one round. Can be overridden via
/// `NodeConfig.vote_timeout`.
pub const DEFAULT_VOTE_TIMEOUT: Duration = Duration::from_millis(50);

/// How long a fire-and-forget broadcast keeps its request socket open
/// waiting for the acknowledgement before closing it anyway.
pub const BROADCAST_LINGER: Duration = Duration::from_millis(300);

// =============================================================================
// Connection Constants
// =============================================================================

/// Deadline for a pub/sub connection attempt to a master endpoint.
///
/// An attempt that neither acknowledges nor delivers a message within this
/// bound is abandoned and treated as a connect failure.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Grace period during which the previous subscribe socket keeps draining
/// after a master switch.
///
/// Closing the old socket only after the switch avoids a gap where neither
/// socket is listening; sequence-number dedup absorbs the resulting
/// duplicate deliveries.
pub const SUB_DRAIN_GRACE: Duration = Duration::from_millis(300);

/// Settle delay before a resigning master unbinds its relay sockets, so the
/// handoff signal can propagate to connected nodes.
pub const MASTER_SETTLE_DELAY: Duration = Duration::from_millis(1000);

/// Settle delay before a non-master member unbinds on deactivation.
pub const SETTLE_DELAY: Duration = Duration::from_millis(1);

// =============================================================================
// Framing Constants
// =============================================================================

/// Maximum size of a single wire message (16 MiB).
///
/// Prevents memory exhaustion from malformed length prefixes.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum number of frames in a multipart message.
///
/// Bus messages carry `[channel, senderTag, ...payload]`; 64 frames is
/// generous but bounded.
pub const MAX_FRAMES_PER_MESSAGE: u32 = 64;

// =============================================================================
// Port Constants
// =============================================================================

/// Default port of the coordination (vote/discovery) socket.
pub const DEFAULT_COORDINATION_PORT: u16 = 50061;

/// Default port of the external-updates fanout socket.
pub const DEFAULT_EXTERNAL_UPDATES_PORT: u16 = 50081;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_interval_below_timeout() {
        // A healthy master must beat at least twice per timeout window
        assert!(HEARTBEAT_INTERVAL * 2 <= HEARTBEAT_TIMEOUT);
    }

    #[test]
    fn test_check_interval_below_timeout() {
        assert!(HEARTBEAT_INTERVAL_CHECK < HEARTBEAT_TIMEOUT);
    }

    #[test]
    fn test_connect_timeout_within_heartbeat_timeout() {
        // A reconnect attempt must fit inside the silence window it reacts to
        assert!(CONNECT_TIMEOUT < HEARTBEAT_TIMEOUT);
    }

    #[test]
    fn test_default_ports_differ() {
        assert_ne!(DEFAULT_COORDINATION_PORT, DEFAULT_EXTERNAL_UPDATES_PORT);
    }

    #[test]
    #[allow(clippy::assertions_on_constants)]
    fn test_frame_bounds_are_bounded() {
        assert!(MAX_FRAMES_PER_MESSAGE >= 3);
        assert!(MAX_MESSAGE_SIZE <= 64 * 1024 * 1024);
    }
}
