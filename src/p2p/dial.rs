//! Outbound connection establishment

use crate::p2p::connection::{Connection, HandshakeConfig};
use crate::p2p::domain::{HandshakeError, PeerError};
use crate::p2p::node::NodeRecord;
use crate::p2p::transport::{NodeKey, SecureStream};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, instrument};

/// Default timeout for the TCP connect (5 seconds)
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for the secure channel and capability handshake (15 seconds)
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-node probe settings
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Idle limit of the message loop; `None` waits indefinitely
    pub read_timeout: Option<Duration>,
    pub handshake: HandshakeConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            read_timeout: None,
            handshake: HandshakeConfig::default(),
        }
    }
}

/// Open one TCP connection to `node` and secure it.
///
/// The responder must authenticate with the record's public key. There is a
/// single attempt, no retries.
#[instrument(skip_all, fields(node = %node.address()))]
pub async fn dial(
    node: &NodeRecord,
    key: &NodeKey,
    config: &ProbeConfig,
) -> Result<Connection<TcpStream>, PeerError> {
    let addr = node.address();

    let connected = timeout(config.dial_timeout, TcpStream::connect(addr.as_str())).await;
    let stream = match connected {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(PeerError::Dial { addr, source }),
        Err(_) => {
            return Err(PeerError::DialTimeout {
                addr,
                timeout: config.dial_timeout,
            })
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    debug!("TCP connection established");

    // one deadline covers the noise handshake, hello and status
    let deadline = Instant::now() + config.handshake_timeout;
    let secure = match timeout_at(
        deadline,
        SecureStream::initiate(stream, key, node.public_key()),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => return Err(HandshakeError::Timeout(config.handshake_timeout).into()),
    };

    Ok(Connection::new(secure, &config.handshake, key)
        .with_handshake_deadline(deadline, config.handshake_timeout)
        .with_read_timeout(config.read_timeout))
}
