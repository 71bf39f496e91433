//! Command-line argument parsing and configuration management
//!
//! This module provides CLI argument parsing using clap for configuring
//! probe runs and the serve-mode responder.

use crate::p2p::connection::HandshakeConfig;
use crate::p2p::coordinator::CoordinatorConfig;
use crate::p2p::dial::ProbeConfig;
use crate::p2p::responder::ResponderConfig;
use crate::p2p::transport::{KeyError, NodeKey};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Shortest flush interval accepted on the command line
const MIN_FLUSH_INTERVAL_MS: u64 = 100;

/// Command-line arguments for the p2p ping application
#[derive(Parser, Debug, Clone)]
#[command(
    name = "p2p_ping",
    version,
    about = "Probe p2p nodes: handshake, capture hello and status, count messages",
    long_about = "Dials every target node, runs the secure channel and capability handshake, records the peer's hello and status, then optionally keeps listening and reports per-protocol message counts."
)]
pub struct Args {
    /// Nodes file (JSON array of enode:// URLs) or a single enode:// URL
    #[arg(help = "Nodes file or a single enode:// URL (required in ping mode)")]
    pub target: Option<String>,

    /// Application mode
    #[arg(
        short = 'm',
        long = "mode",
        default_value = "ping",
        help = "Application mode: ping (probe targets) or serve (accept probes)"
    )]
    pub mode: ApplicationMode,

    /// Report destination; stdout when absent
    #[arg(short = 'o', long = "output", help = "Write the JSON report to this file")]
    pub output: Option<PathBuf>,

    /// Maximum number of probes in flight
    #[arg(
        short = 'p',
        long = "parallel",
        default_value = "16",
        help = "Maximum number of nodes probed concurrently"
    )]
    pub parallel: usize,

    /// Keep reading after a successful handshake
    #[arg(
        short = 'l',
        long = "listen",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Keep listening and counting messages after the handshake (true, false)"
    )]
    pub listen: bool,

    #[arg(
        long = "dial-timeout",
        default_value = "5",
        help = "TCP connect timeout in seconds"
    )]
    pub dial_timeout_secs: u64,

    #[arg(
        long = "handshake-timeout",
        default_value = "15",
        help = "Secure channel and hello/status handshake timeout in seconds"
    )]
    pub handshake_timeout_secs: u64,

    #[arg(
        long = "read-timeout",
        help = "Fail a listening probe after this many idle seconds (default: wait forever)"
    )]
    pub read_timeout_secs: Option<u64>,

    #[arg(
        long = "flush-interval",
        default_value = "2000",
        help = "Interval between message count reports in milliseconds"
    )]
    pub flush_interval_ms: u64,

    /// Listen address for serve mode
    #[arg(
        short = 'b',
        long = "bind",
        default_value = "0.0.0.0:30303",
        help = "Address to accept connections on in serve mode"
    )]
    pub bind_address: SocketAddr,

    /// Hex-encoded static private key; random when absent
    #[arg(long = "node-key", help = "Hex-encoded 32-byte static private key")]
    pub node_key: Option<String>,

    #[arg(
        long = "network-id",
        default_value = "1",
        help = "Network id announced in the serve-mode status"
    )]
    pub network_id: u64,

    /// Log level for application output, recommended by environment if unset
    #[arg(long = "log-level", help = "Log level (trace, debug, info, warn, error)")]
    pub log_level: Option<LogLevel>,

    /// Output log format, recommended by environment if unset
    #[arg(long = "log-format", help = "Log output format (pretty, json)")]
    pub log_format: Option<LogFormat>,
}

impl Args {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_secs.map(Duration::from_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// The configured static key, or a freshly generated one
    pub fn node_key(&self) -> Result<NodeKey, KeyError> {
        match &self.node_key {
            Some(hex) => NodeKey::from_hex(hex),
            None => Ok(NodeKey::generate()),
        }
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            dial_timeout: self.dial_timeout(),
            handshake_timeout: self.handshake_timeout(),
            read_timeout: self.read_timeout(),
            handshake: HandshakeConfig::default(),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_concurrency: self.parallel,
            listen: self.listen,
            flush_interval: self.flush_interval(),
        }
    }

    pub fn responder_config(&self) -> ResponderConfig {
        let mut config = ResponderConfig::new(self.network_id);
        config.handshake_timeout = self.handshake_timeout();
        config
    }

    /// Validate the provided arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.parallel == 0 {
            return Err("Parallelism must be at least 1".to_string());
        }

        if self.dial_timeout_secs == 0 || self.handshake_timeout_secs == 0 {
            return Err("Timeouts must be greater than 0 seconds".to_string());
        }

        if self.read_timeout_secs == Some(0) {
            return Err("Read timeout must be greater than 0 seconds".to_string());
        }

        if self.flush_interval_ms < MIN_FLUSH_INTERVAL_MS {
            return Err(format!(
                "Flush interval must be at least {} milliseconds",
                MIN_FLUSH_INTERVAL_MS
            ));
        }

        if matches!(self.mode, ApplicationMode::Ping) && self.target.is_none() {
            return Err("Ping mode requires a nodes file or enode:// URL".to_string());
        }

        if let Some(hex) = &self.node_key {
            NodeKey::from_hex(hex).map_err(|e| format!("Invalid --node-key: {}", e))?;
        }

        Ok(())
    }
}

/// Application operating mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplicationMode {
    /// Ping mode - dial and probe target nodes
    Ping,
    /// Serve mode - accept and answer probes
    Serve,
}

impl FromStr for ApplicationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ping" | "probe" | "client" => Ok(ApplicationMode::Ping),
            "serve" | "server" | "listen" => Ok(ApplicationMode::Serve),
            _ => Err(format!(
                "Invalid application mode: '{}'. Valid options: ping, serve",
                s
            )),
        }
    }
}

/// Log level configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!(
                "Invalid log level: '{}'. Valid options: trace, debug, info, warn, error",
                s
            )),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty formatted logs for development
    Pretty,
    /// JSON formatted logs for production
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" | "human" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!(
                "Invalid log format: '{}'. Valid options: pretty, json",
                s
            )),
        }
    }
}
