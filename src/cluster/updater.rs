//! Passive-discovery fanout for edge listeners.
//!
//! Member nodes republish every observed master heartbeat, carrying the
//! full master descriptor, on a well-known port. Edge processes that never
//! vote can confirm the master is still alive, or learn of a handoff,
//! without touching the coordination protocol.

use std::sync::Mutex;

use bytes::Bytes;
use tracing::debug;

use crate::error::Result;
use crate::transport::PubSocket;

/// Fanout bound on the configured external-updates port.
#[derive(Debug)]
pub struct ExternalUpdater {
    port: u16,
    fanout: Mutex<Option<PubSocket>>,
}

impl ExternalUpdater {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            fanout: Mutex::new(None),
        }
    }

    /// Bind the fanout. Idempotent.
    pub async fn bind(&self) -> Result<()> {
        if self.fanout.lock().expect("updater state poisoned").is_some() {
            return Ok(());
        }
        let socket = PubSocket::bind(self.port).await?;
        debug!(port = self.port, "external updates fanout bound");

        let mut fanout = self.fanout.lock().expect("updater state poisoned");
        if fanout.is_none() {
            *fanout = Some(socket);
        } else {
            socket.close();
        }
        Ok(())
    }

    /// Close the fanout and release the port. Idempotent.
    pub fn unbind(&self) {
        if let Some(socket) = self.fanout.lock().expect("updater state poisoned").take() {
            socket.close();
        }
    }

    /// Publish a payload to every connected edge listener. A no-op while
    /// unbound.
    pub fn publish(&self, channel: &str, payload: Bytes) {
        if let Some(fanout) = self.fanout.lock().expect("updater state poisoned").as_ref() {
            fanout.send(&[Bytes::copy_from_slice(channel.as_bytes()), payload]);
        }
    }
}
