//! Crate level errors.
//!
//! # Error Policy
//!
//! The crate uses a single error enum with two very different audiences:
//!
//! - **Construction errors** ([`Error::Config`]) are surfaced synchronously
//!   from constructors and validation; they are fatal and never retried.
//! - **Steady-state errors** (`Discovery`, `ElectionFailed`,
//!   `ConnectTimeout`, `Io`) are recovered locally by retry loops; sustained
//!   failure keeps a node not-ready, it never crashes the process.
//!
//! The enum is `Clone` so an election result can be fanned out to every
//! caller coalesced onto the same in-flight round.

use bytes::Bytes;
use std::{io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Errors produced by the bus components.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
    /// An error in the network.
    #[error("IO error: {0:?}")]
    Io(io::ErrorKind),

    /// Invalid node settings, detected at construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// The peer-discovery hostname could not be resolved.
    #[error("cannot resolve host '{host}': {reason}")]
    Discovery { host: String, reason: String },

    /// No candidate survived an election round before its deadline.
    #[error("could not elect a master")]
    ElectionFailed,

    /// A pub/sub connection attempt ran past its deadline.
    #[error("connection attempt to {0} timed out")]
    ConnectTimeout(String),

    /// Could not parse wire framing.
    #[error("framing error: invalid data ({} bytes)", .0.len())]
    Parsing(Bytes),

    /// Could not decode a coordination payload.
    #[error("payload error: {0}")]
    Payload(String),

    /// Operation requires an established master connection.
    #[error("not connected to a master")]
    NotConnected,
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::Io(a), Error::Io(b)) => a == b,
            (Error::Config(a), Error::Config(b)) => a == b,
            (
                Error::Discovery { host: a, reason: ar },
                Error::Discovery { host: b, reason: br },
            ) => a == b && ar == br,
            (Error::ElectionFailed, Error::ElectionFailed) => true,
            (Error::ConnectTimeout(a), Error::ConnectTimeout(b)) => a == b,
            (Error::Parsing(a), Error::Parsing(b)) => a == b,
            (Error::Payload(a), Error::Payload(b)) => a == b,
            (Error::NotConnected, Error::NotConnected) => true,
            _ => false,
        }
    }
}

impl Eq for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.kind())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Payload(e.to_string())
    }
}
