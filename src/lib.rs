//! # P2P Ping
//!
//! A Rust library for probing peer-to-peer network nodes. It dials each
//! target, performs a Noise secure channel and capability handshake, captures
//! the peer's hello and status, and optionally keeps listening to count the
//! protocol messages the peer sends, across many nodes at bounded concurrency.

/// CLI argument parsing and configuration management
pub mod arguments_parser;

/// Probe engine: transport, handshake, message loop and coordinator
pub mod p2p;

/// JSON report serialization
pub mod report;

/// Structured logging and telemetry infrastructure
pub mod telemetry;

// Re-export commonly used types for easier access
pub use arguments_parser::Args;
pub use p2p::{Coordinator, NetworkProber, NodeKey, NodeRecord, PeerOutcome, Responder, ResultSet};
pub use report::write_report;
pub use telemetry::setup_telemetry;
