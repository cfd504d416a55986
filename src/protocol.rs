//! Coordination protocol messages and bus channel conventions.
//!
//! # Coordination protocol
//!
//! Member nodes exchange JSON envelopes over request/reply sockets:
//!
//! | type            | sent by | payload              | reply                     |
//! |-----------------|---------|----------------------|---------------------------|
//! | `voteRequest`   | elector | none                 | [`CandidateRecord`]       |
//! | `masterRequest` | finder  | none                 | [`MasterRecord`] or `false` |
//! | `masterElected` | elector | [`MasterRecord`]     | empty ack                 |
//!
//! Every envelope carries `toAddress`, the address the sender dialed; the
//! receiver uses it to learn its own externally visible IP exactly once.
//!
//! # Bus messages
//!
//! Application messages travel as multipart frames
//! `[channel, senderTag, ...payload]` where the sender tag is
//! `<publisherName>_<sequence>`. The reserved channels `heartbeats` and
//! `newmaster` carry no sender tag and bypass deduplication.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Channel used for master liveness beats.
pub const CHANNEL_HEARTBEATS: &str = "heartbeats";

/// Channel used to announce an elected or resigning master.
pub const CHANNEL_NEW_MASTER: &str = "newmaster";

/// Channel names the bus uses internally, including the spellings of
/// superseded wire revisions; applications can neither publish to nor
/// subscribe to any of them.
pub const RESERVED_CHANNELS: &[&str] = &[
    "connect",
    "disconnect",
    "connection:failure",
    "heartbeats",
    "newmaster",
    "newMaster",
    "changedMaster",
];

/// Whether a channel name is reserved for internal use.
pub fn is_reserved_channel(channel: &str) -> bool {
    RESERVED_CHANNELS.contains(&channel)
}

/// The pair of transport addresses a master exposes: `sub` receives
/// published messages, `pub` fans relayed messages out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Address other nodes subscribe to (the master's fanout side).
    #[serde(rename = "pub")]
    pub pub_addr: String,
    /// Address other nodes publish to (the master's intake side).
    #[serde(rename = "sub")]
    pub sub_addr: String,
}

/// Description of the resolved master, propagated to the cluster.
///
/// Replaced wholesale on change, never mutated; readers always receive an
/// owned snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterRecord {
    pub id: String,
    pub name: String,
    pub endpoints: Endpoints,
    #[serde(rename = "isMaster", default)]
    pub is_master: bool,
}

/// A member's self-description sent in reply to a `voteRequest`.
///
/// `candidate: false` means "do not count me" and is sent by a node that is
/// advertising a resignation id for the round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub id: String,
    pub name: String,
    /// Absent until the node has learned its own externally visible IP.
    #[serde(default)]
    pub endpoints: Option<Endpoints>,
    #[serde(rename = "isMaster")]
    pub is_master: bool,
    pub candidate: bool,
}

/// Coordination message kinds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoordinationMessage {
    VoteRequest,
    MasterRequest,
    MasterElected(MasterRecord),
}

/// The envelope exactly as it travels: `{type, data?, toAddress, from?}`.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(rename = "toAddress")]
    to_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<String>,
}

/// A coordination envelope: the message plus sender-visible addressing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub message: CoordinationMessage,
    /// The address the sender dialed, i.e. the receiver's external address.
    pub to_address: String,
    /// The sender's display name, when known.
    pub from: Option<String>,
}

impl Envelope {
    pub fn new(message: CoordinationMessage, to_address: String, from: Option<String>) -> Self {
        Self {
            message,
            to_address,
            from,
        }
    }

    pub fn to_bytes(&self) -> crate::error::Result<Bytes> {
        let (kind, data) = match &self.message {
            CoordinationMessage::VoteRequest => ("voteRequest", None),
            CoordinationMessage::MasterRequest => ("masterRequest", None),
            CoordinationMessage::MasterElected(record) => {
                ("masterElected", Some(serde_json::to_value(record)?))
            }
        };
        let wire = WireEnvelope {
            kind: kind.to_string(),
            data,
            to_address: self.to_address.clone(),
            from: self.from.clone(),
        };
        Ok(Bytes::from(serde_json::to_vec(&wire)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::error::Result<Self> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)?;
        let message = match wire.kind.as_str() {
            "voteRequest" => CoordinationMessage::VoteRequest,
            "masterRequest" => CoordinationMessage::MasterRequest,
            "masterElected" => {
                let data = wire
                    .data
                    .ok_or_else(|| Error::Payload("masterElected without data".to_string()))?;
                CoordinationMessage::MasterElected(serde_json::from_value(data)?)
            }
            other => {
                return Err(Error::Payload(format!(
                    "unknown coordination message type '{other}'"
                )));
            }
        };
        Ok(Self {
            message,
            to_address: wire.to_address,
            from: wire.from,
        })
    }
}

/// Encode a `masterRequest` reply: the record JSON, or the literal `false`
/// when no master is known.
pub fn encode_master_reply(master: Option<&MasterRecord>) -> Bytes {
    let value = match master {
        Some(record) => serde_json::to_vec(record).unwrap_or_else(|_| b"false".to_vec()),
        None => b"false".to_vec(),
    };
    Bytes::from(value)
}

/// Decode a `masterRequest` reply; `false`, `null` and malformed payloads all
/// mean "no master known".
pub fn decode_master_reply(bytes: &[u8]) -> Option<MasterRecord> {
    serde_json::from_slice::<MasterRecord>(bytes).ok()
}

/// Render the dedup tag a publisher attaches to an application message.
pub fn encode_sender_tag(name: &str, sequence: u64) -> String {
    format!("{name}_{sequence}")
}

/// Split a sender tag into publisher name and sequence number.
///
/// The sequence is the portion after the last underscore, so publisher names
/// containing underscores still round-trip.
pub fn parse_sender_tag(tag: &str) -> Option<(&str, u64)> {
    let (name, seq) = tag.rsplit_once('_')?;
    let sequence = seq.parse().ok()?;
    Some((name, sequence))
}
