//! Frame layout, message codes and capability negotiation
//!
//! Every decrypted frame starts with a big-endian `u16` message code followed by
//! the message body. Codes below [`BASE_PROTOCOL_LENGTH`] belong to the base
//! protocol (hello, disconnect, ping, pong). Negotiated sub-protocols occupy
//! consecutive code ranges above it, assigned in protocol-name order.

use crate::p2p::counter::MessageKey;
use crate::p2p::domain::{Capability, FrameError, Hello, Status};
use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;
use std::fmt;

/// Version of the base protocol advertised in hello
pub const BASE_PROTOCOL_VERSION: u64 = 5;

/// Namespace of base protocol messages
pub const BASE_PROTOCOL: &str = "p2p";

/// Namespace of codes outside every negotiated range
pub const UNKNOWN_PROTOCOL: &str = "unknown";

/// Number of codes reserved for the base protocol
pub const BASE_PROTOCOL_LENGTH: u16 = 0x10;

/// Base protocol message codes
pub mod codes {
    pub const HELLO: u16 = 0x00;
    pub const DISCONNECT: u16 = 0x01;
    pub const PING: u16 = 0x02;
    pub const PONG: u16 = 0x03;

    /// Status code relative to its sub-protocol's offset
    pub const STATUS: u16 = 0x00;
}

/// A locally supported sub-protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSpec {
    pub name: &'static str,
    pub version: u32,
    /// Number of message codes the protocol uses
    pub length: u16,
    /// Whether the protocol opens with a status message
    pub has_status: bool,
}

impl ProtocolSpec {
    pub fn capability(&self) -> Capability {
        Capability::new(self.name, self.version)
    }
}

pub const ETH_66: ProtocolSpec = ProtocolSpec {
    name: "eth",
    version: 66,
    length: 17,
    has_status: true,
};

pub const ETH_67: ProtocolSpec = ProtocolSpec {
    name: "eth",
    version: 67,
    length: 17,
    has_status: true,
};

pub const ETH_68: ProtocolSpec = ProtocolSpec {
    name: "eth",
    version: 68,
    length: 17,
    has_status: true,
};

pub const SNAP_1: ProtocolSpec = ProtocolSpec {
    name: "snap",
    version: 1,
    length: 8,
    has_status: false,
};

/// Sub-protocols advertised by default
pub const DEFAULT_PROTOCOLS: &[ProtocolSpec] = &[ETH_66, ETH_67, ETH_68, SNAP_1];

/// A sub-protocol both sides support, with its code offset on this connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedProtocol {
    pub spec: ProtocolSpec,
    pub offset: u16,
}

impl NegotiatedProtocol {
    /// Absolute wire code of a protocol-relative code
    pub fn code(&self, relative: u16) -> u16 {
        self.offset + relative
    }

    fn contains(&self, code: u16) -> bool {
        code >= self.offset && code < self.offset + self.spec.length
    }
}

/// Intersect local and remote capabilities.
///
/// Only exact name and version matches count. For each name the highest shared
/// version wins, and surviving protocols are laid out from
/// [`BASE_PROTOCOL_LENGTH`] upward in name order.
pub fn negotiate(local: &[ProtocolSpec], remote: &[Capability]) -> Vec<NegotiatedProtocol> {
    let mut shared: BTreeMap<&'static str, ProtocolSpec> = BTreeMap::new();

    for spec in local {
        let advertised = remote
            .iter()
            .any(|cap| cap.name == spec.name && cap.version == spec.version);
        if !advertised {
            continue;
        }
        shared
            .entry(spec.name)
            .and_modify(|current| {
                if spec.version > current.version {
                    *current = *spec;
                }
            })
            .or_insert(*spec);
    }

    let mut offset = BASE_PROTOCOL_LENGTH;
    shared
        .into_values()
        .map(|spec| {
            let negotiated = NegotiatedProtocol { spec, offset };
            offset += spec.length;
            negotiated
        })
        .collect()
}

/// Map an absolute message code to its counter key
pub fn classify(negotiated: &[NegotiatedProtocol], code: u16) -> MessageKey {
    if code < BASE_PROTOCOL_LENGTH {
        return MessageKey::new(BASE_PROTOCOL, code);
    }
    negotiated
        .iter()
        .find(|protocol| protocol.contains(code))
        .map(|protocol| MessageKey::new(protocol.spec.name, code - protocol.offset))
        .unwrap_or(MessageKey::new(UNKNOWN_PROTOCOL, code))
}

/// Reason carried by a disconnect message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    NetworkError,
    ProtocolBreach,
    UselessPeer,
    TooManyPeers,
    AlreadyConnected,
    IncompatibleVersion,
    InvalidIdentity,
    ClientQuitting,
    UnexpectedIdentity,
    SelfConnect,
    PingTimeout,
    SubprotocolError,
    Unknown(u8),
}

impl DisconnectReason {
    pub fn code(self) -> u8 {
        match self {
            DisconnectReason::Requested => 0x00,
            DisconnectReason::NetworkError => 0x01,
            DisconnectReason::ProtocolBreach => 0x02,
            DisconnectReason::UselessPeer => 0x03,
            DisconnectReason::TooManyPeers => 0x04,
            DisconnectReason::AlreadyConnected => 0x05,
            DisconnectReason::IncompatibleVersion => 0x06,
            DisconnectReason::InvalidIdentity => 0x07,
            DisconnectReason::ClientQuitting => 0x08,
            DisconnectReason::UnexpectedIdentity => 0x09,
            DisconnectReason::SelfConnect => 0x0a,
            DisconnectReason::PingTimeout => 0x0b,
            DisconnectReason::SubprotocolError => 0x10,
            DisconnectReason::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => DisconnectReason::Requested,
            0x01 => DisconnectReason::NetworkError,
            0x02 => DisconnectReason::ProtocolBreach,
            0x03 => DisconnectReason::UselessPeer,
            0x04 => DisconnectReason::TooManyPeers,
            0x05 => DisconnectReason::AlreadyConnected,
            0x06 => DisconnectReason::IncompatibleVersion,
            0x07 => DisconnectReason::InvalidIdentity,
            0x08 => DisconnectReason::ClientQuitting,
            0x09 => DisconnectReason::UnexpectedIdentity,
            0x0a => DisconnectReason::SelfConnect,
            0x0b => DisconnectReason::PingTimeout,
            0x10 => DisconnectReason::SubprotocolError,
            other => DisconnectReason::Unknown(other),
        }
    }

    /// Decode a disconnect body; an empty body means a plain request
    pub fn from_payload(payload: &[u8]) -> Self {
        payload
            .first()
            .map_or(DisconnectReason::Requested, |code| Self::from_code(*code))
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::Requested => "disconnect requested",
            DisconnectReason::NetworkError => "network error",
            DisconnectReason::ProtocolBreach => "breach of protocol",
            DisconnectReason::UselessPeer => "useless peer",
            DisconnectReason::TooManyPeers => "too many peers",
            DisconnectReason::AlreadyConnected => "already connected",
            DisconnectReason::IncompatibleVersion => "incompatible p2p protocol version",
            DisconnectReason::InvalidIdentity => "invalid node identity",
            DisconnectReason::ClientQuitting => "client quitting",
            DisconnectReason::UnexpectedIdentity => "unexpected identity",
            DisconnectReason::SelfConnect => "connected to self",
            DisconnectReason::PingTimeout => "read timeout",
            DisconnectReason::SubprotocolError => "subprotocol error",
            DisconnectReason::Unknown(code) => return write!(f, "unknown reason {:#04x}", code),
        };
        f.write_str(text)
    }
}

/// One decrypted protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(code: u16, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }

    /// Frame without a body, such as ping or pong
    pub fn empty(code: u16) -> Self {
        Self::new(code, Vec::new())
    }

    pub fn hello(hello: &Hello) -> Result<Self, FrameError> {
        Self::message(codes::HELLO, hello)
    }

    pub fn status(protocol: &NegotiatedProtocol, status: &Status) -> Result<Self, FrameError> {
        Self::message(protocol.code(codes::STATUS), status)
    }

    pub fn disconnect(reason: DisconnectReason) -> Self {
        Self::new(codes::DISCONNECT, vec![reason.code()])
    }

    fn message<T: BorshSerialize>(code: u16, body: &T) -> Result<Self, FrameError> {
        Ok(Self::new(code, borsh::to_vec(body)?))
    }

    /// Decode the body as `T`; `message` names it in errors
    pub fn body<T: BorshDeserialize>(&self, message: &'static str) -> Result<T, FrameError> {
        T::try_from_slice(&self.payload).map_err(|e| FrameError::Malformed {
            message,
            reason: e.to_string(),
        })
    }

    /// Plaintext bytes handed to the secure channel
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + self.payload.len());
        bytes.extend_from_slice(&self.code.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn decode(mut bytes: Vec<u8>) -> Result<Self, FrameError> {
        if bytes.len() < 2 {
            return Err(FrameError::Truncated { len: bytes.len() });
        }
        let payload = bytes.split_off(2);
        let code = u16::from_be_bytes([bytes[0], bytes[1]]);
        Ok(Self { code, payload })
    }
}
