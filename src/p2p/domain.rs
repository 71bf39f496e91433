//! Domain models and error types for peer probing
//!
//! This module defines the handshake messages exchanged with a peer, the
//! per-node probe outcome, and the error taxonomy of every layer between the
//! socket and the coordinator.

use crate::p2p::node::NodeRecord;
use crate::p2p::wire::DisconnectReason;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while moving encrypted frames over a stream
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("connection closed by peer")]
    Closed,

    #[error("network i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("secure channel error: {0}")]
    Noise(#[from] snow::Error),

    #[error("frame too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },

    #[error("truncated frame of {len} bytes")]
    Truncated { len: usize },

    #[error("malformed {message} payload: {reason}")]
    Malformed {
        message: &'static str,
        reason: String,
    },
}

/// Failures of transport security, capability negotiation or status ordering
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("secure channel setup failed: {0}")]
    SecureChannel(#[source] FrameError),

    #[error("remote static key {received} does not match node key {expected}")]
    KeyMismatch { expected: String, received: String },

    #[error("expected hello, got message code {code:#04x}")]
    ExpectedHello { code: u16 },

    #[error("hello public key does not match the secure channel identity")]
    IdentityMismatch,

    #[error("duplicate hello")]
    DuplicateHello,

    #[error("no common capabilities")]
    NoCommonCapabilities,

    #[error("status out of order")]
    StatusOutOfOrder { code: u16 },

    #[error("peer disconnected: {0}")]
    Disconnected(DisconnectReason),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Failures of the post-handshake message loop
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("no message received for {0:?}")]
    Idle(Duration),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Terminal error of a single node's probe
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dial {addr} timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("read failed: {0}")]
    Read(#[from] ReadError),
}

/// A named sub-protocol and version advertised in a hello
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct Capability {
    pub name: String,
    pub version: u32,
}

impl Capability {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// First in-band message on every connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Hello {
    /// Base protocol version
    pub protocol_version: u64,

    /// Free-form client identifier, e.g. `p2p_ping/v0.1.0`
    pub client_id: String,

    /// Advertised sub-protocols
    pub capabilities: Vec<Capability>,

    /// TCP port the peer accepts connections on, zero if none
    pub listen_port: u16,

    /// Static public key as presented by the peer
    #[serde(with = "hex_bytes")]
    pub node_key: [u8; 32],
}

/// Fork identifier carried in a status message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct ForkId {
    #[serde(with = "hex_bytes")]
    pub hash: [u8; 4],
    pub next: u64,
}

/// First message of a status-bearing sub-protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Status {
    /// Negotiated sub-protocol version
    pub protocol_version: u32,

    /// Network (chain) identifier
    pub network_id: u64,

    /// Cumulative chain weight
    pub total_difficulty: u128,

    /// Hash of the peer's head block
    #[serde(with = "hex_bytes")]
    pub head: [u8; 32],

    /// Hash of the genesis block
    #[serde(with = "hex_bytes")]
    pub genesis: [u8; 32],

    pub fork_id: ForkId,
}

/// Terminal record of one node's probe
#[derive(Debug, Clone, Serialize)]
pub struct PeerOutcome {
    pub record: NodeRecord,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hello: Option<Hello>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PeerOutcome {
    /// Empty outcome for `record`, filled in as the probe progresses
    pub fn new(record: NodeRecord) -> Self {
        Self {
            record,
            hello: None,
            status: None,
            error: None,
        }
    }

    /// Outcome carrying only an error description
    pub fn failed(record: NodeRecord, error: impl fmt::Display) -> Self {
        let mut outcome = Self::new(record);
        outcome.error = Some(error.to_string());
        outcome
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Serde adapter rendering fixed-size byte arrays as lowercase hex strings
pub mod hex_bytes {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(text).map_err(D::Error::custom)?;
        bytes.try_into().map_err(|bytes: Vec<u8>| {
            D::Error::custom(format!("expected {} bytes, got {}", N, bytes.len()))
        })
    }
}
