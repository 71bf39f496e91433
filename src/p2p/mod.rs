//! Peer probing engine
//!
//! This module contains the networking core of the probe:
//! - Node records and target loading
//! - The Noise secure channel and frame layout
//! - Capability handshake, status exchange and the message loop
//! - The bounded coordinator with its shared message counter

/// Capability handshake and message loop over a secure channel
pub mod connection;

/// Bounded fan-out across target nodes with periodic counter flushes
pub mod coordinator;

/// Shared message counter with atomic snapshot-and-reset
pub mod counter;

/// Outbound TCP connect plus secure channel setup
pub mod dial;

/// Handshake messages, probe outcomes and error types
pub mod domain;

/// Node records, `enode://` URLs and nodes files
pub mod node;

/// Per-node probe pipeline behind the `Prober` trait
pub mod prober;

/// Inbound side of the protocol for serve mode
pub mod responder;

/// Noise_XX transport and node keys
pub mod transport;

/// Frame codec, message codes and capability negotiation
pub mod wire;

// Re-export public types for easier access
pub use connection::{Connection, HandshakeConfig, LoopExit};
pub use coordinator::{Coordinator, CoordinatorConfig, FlushStats, ResultSet, RunReport};
pub use counter::{CountSnapshot, MessageCounter, MessageKey};
pub use dial::{dial, ProbeConfig};
pub use domain::{
    Capability, FrameError, HandshakeError, Hello, PeerError, PeerOutcome, ReadError, Status,
};
pub use node::{load_targets, NodeId, NodeParseError, NodeRecord};
pub use prober::{NetworkProber, Prober};
pub use responder::{Responder, ResponderConfig};
pub use transport::{KeyError, NodeKey, SecureStream};
pub use wire::{DisconnectReason, Frame, ProtocolSpec, DEFAULT_PROTOCOLS};
