//! Node records and target loading
//!
//! A node is addressed by an `enode://` URL carrying its static public key in
//! hex, followed by host and TCP port:
//!
//! ```text
//! enode://<64 hex chars>@10.0.0.7:30303?discport=30301
//! ```
//!
//! A nodes file is a JSON array of such URLs.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const SCHEME: &str = "enode://";
const SIGNED_RECORD_PREFIX: &str = "enr:";

/// Errors raised while loading dial targets
#[derive(Error, Debug)]
pub enum NodeParseError {
    #[error("missing enode:// scheme in '{0}'")]
    MissingScheme(String),

    #[error("signed node records are not supported, use the enode:// form: '{0}'")]
    SignedRecord(String),

    #[error("missing '@' between key and address in '{0}'")]
    MissingSeparator(String),

    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("invalid query '{0}'")]
    InvalidQuery(String),

    #[error("failed to read nodes file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed nodes file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Fixed-width identifier of a node: BLAKE3 of its public key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Immutable description of a dial target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRecord {
    public_key: [u8; 32],
    host: String,
    port: u16,
    discovery_port: Option<u16>,
}

impl NodeRecord {
    pub fn new(public_key: [u8; 32], host: impl Into<String>, port: u16) -> Self {
        Self {
            public_key,
            host: host.into(),
            port,
            discovery_port: None,
        }
    }

    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = Some(port);
        self
    }

    pub fn id(&self) -> NodeId {
        NodeId(*blake3::hash(&self.public_key).as_bytes())
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn discovery_port(&self) -> Option<u16> {
        self.discovery_port
    }

    /// `host:port`, with IPv6 hosts bracketed
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}@{}",
            SCHEME,
            hex::encode(self.public_key),
            self.address()
        )?;
        if let Some(port) = self.discovery_port.filter(|port| *port != self.port) {
            write!(f, "?discport={}", port)?;
        }
        Ok(())
    }
}

impl FromStr for NodeRecord {
    type Err = NodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().starts_with(SIGNED_RECORD_PREFIX) {
            return Err(NodeParseError::SignedRecord(s.to_string()));
        }
        let rest = s
            .trim()
            .strip_prefix(SCHEME)
            .ok_or_else(|| NodeParseError::MissingScheme(s.to_string()))?;
        let (key_hex, location) = rest
            .split_once('@')
            .ok_or_else(|| NodeParseError::MissingSeparator(s.to_string()))?;

        let key_bytes =
            hex::decode(key_hex).map_err(|e| NodeParseError::InvalidKey(e.to_string()))?;
        let public_key: [u8; 32] = key_bytes.try_into().map_err(|bytes: Vec<u8>| {
            NodeParseError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len()))
        })?;

        let (address, query) = match location.split_once('?') {
            Some((address, query)) => (address, Some(query)),
            None => (location, None),
        };
        let (host, port) = split_host_port(address)?;

        let mut record = NodeRecord::new(public_key, host, port);
        if let Some(query) = query {
            let discport = query
                .strip_prefix("discport=")
                .ok_or_else(|| NodeParseError::InvalidQuery(query.to_string()))?;
            let discport = discport
                .parse()
                .map_err(|_| NodeParseError::InvalidPort(discport.to_string()))?;
            record = record.with_discovery_port(discport);
        }
        Ok(record)
    }
}

fn split_host_port(address: &str) -> Result<(&str, u16), NodeParseError> {
    let invalid = || NodeParseError::InvalidAddress(address.to_string());

    let (host, port) = if let Some(bracketed) = address.strip_prefix('[') {
        let (host, tail) = bracketed.split_once(']').ok_or_else(invalid)?;
        (host, tail.strip_prefix(':').ok_or_else(invalid)?)
    } else {
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        if host.contains(':') {
            return Err(invalid());
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(invalid());
    }
    let port = port
        .parse()
        .map_err(|_| NodeParseError::InvalidPort(port.to_string()))?;
    Ok((host, port))
}

impl Serialize for NodeRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let url = String::deserialize(deserializer)?;
        url.parse().map_err(serde::de::Error::custom)
    }
}

/// Read a JSON nodes file
pub fn read_node_set(path: &Path) -> Result<Vec<NodeRecord>, NodeParseError> {
    let contents = std::fs::read_to_string(path).map_err(|source| NodeParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| NodeParseError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolve the command-line target into dial targets.
///
/// An existing file is read as a nodes file; anything else must be a single
/// `enode://` URL.
pub fn load_targets(target: &str) -> Result<Vec<NodeRecord>, NodeParseError> {
    let path = Path::new(target);
    if path.is_file() {
        return read_node_set(path);
    }
    Ok(vec![target.parse()?])
}
