//! Listening side of the protocol
//!
//! The responder accepts TCP connections, completes the Noise responder role
//! and the hello/status handshake, then serves the connection until the peer
//! leaves. It is the peer that probes talk to when pointed at a local node.

use crate::p2p::connection::{Connection, HandshakeConfig, LoopExit};
use crate::p2p::counter::MessageCounter;
use crate::p2p::dial::DEFAULT_HANDSHAKE_TIMEOUT;
use crate::p2p::domain::{ForkId, HandshakeError, PeerError, Status};
use crate::p2p::node::NodeRecord;
use crate::p2p::transport::{NodeKey, SecureStream};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Handshake parameters of a responder
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub handshake: HandshakeConfig,
    /// Status sent when a status-bearing protocol is negotiated
    pub status: Status,
    pub handshake_timeout: Duration,
}

impl ResponderConfig {
    /// Config with a synthetic chain derived from `network_id`
    pub fn new(network_id: u64) -> Self {
        let seed = format!("p2p_ping genesis {}", network_id);
        let genesis = *blake3::hash(seed.as_bytes()).as_bytes();
        let fork = blake3::hash(&genesis);
        let fork_hash = [
            fork.as_bytes()[0],
            fork.as_bytes()[1],
            fork.as_bytes()[2],
            fork.as_bytes()[3],
        ];

        Self {
            handshake: HandshakeConfig::default(),
            status: Status {
                protocol_version: 0,
                network_id,
                total_difficulty: 1,
                head: genesis,
                genesis,
                fork_id: ForkId {
                    hash: fork_hash,
                    next: 0,
                },
            },
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

pub struct Responder {
    key: NodeKey,
    config: Arc<ResponderConfig>,
    listener: TcpListener,
}

impl Responder {
    #[instrument(skip(key, config))]
    pub async fn bind(
        addr: SocketAddr,
        key: NodeKey,
        mut config: ResponderConfig,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            error!(error = %e, bind_addr = %addr, "Failed to bind responder");
            e
        })?;
        let local_addr = listener.local_addr()?;
        config.handshake.listen_port = local_addr.port();

        info!(local_addr = %local_addr, "Responder listening");

        Ok(Self {
            key,
            config: Arc::new(config),
            listener,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Dialable record of this responder; a wildcard bind maps to loopback
    pub fn record(&self) -> std::io::Result<NodeRecord> {
        let addr = self.local_addr()?;
        let ip = match addr.ip() {
            ip if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            ip => ip,
        };
        Ok(NodeRecord::new(*self.key.public(), ip.to_string(), addr.port()))
    }

    /// Accept connections forever, serving each on its own task
    pub async fn run(self) -> std::io::Result<()> {
        let mut accept_failures = 0u32;
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => {
                    accept_failures = 0;
                    accepted
                }
                Err(e) => {
                    accept_failures = accept_failures.saturating_add(1);
                    let backoff = accept_backoff(accept_failures);
                    warn!(
                        error = %e,
                        failures = accept_failures,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        "Failed to accept connection"
                    );
                    // errors such as EMFILE repeat until a descriptor frees up
                    sleep(backoff).await;
                    continue;
                }
            };
            debug!(peer_addr = %peer_addr, "Accepted connection");

            let key = self.key.clone();
            let config = Arc::clone(&self.config);
            tokio::spawn(
                async move {
                    let counter = MessageCounter::new();
                    match serve_connection(stream, &key, &config, &counter).await {
                        Ok(exit) => info!(exit = %exit, "Connection finished"),
                        Err(e) => warn!(error = %e, "Connection failed"),
                    }
                    let snapshot = counter.snapshot_and_reset();
                    if !snapshot.is_empty() {
                        info!(counts = %snapshot, "Messages received");
                    }
                }
                .instrument(tracing::info_span!("connection", peer_addr = %peer_addr)),
            );
        }
    }
}

/// Pause after the `failures`-th consecutive accept error: 10 ms doubling up
/// to one second
fn accept_backoff(failures: u32) -> Duration {
    const BASE: Duration = Duration::from_millis(10);
    const MAX: Duration = Duration::from_secs(1);

    let exponent = failures.saturating_sub(1).min(7);
    (BASE * 2u32.pow(exponent)).min(MAX)
}

/// Handshake with an inbound peer and serve it until it goes away, counting
/// its messages into `counter`
pub async fn serve_connection(
    stream: TcpStream,
    key: &NodeKey,
    config: &ResponderConfig,
    counter: &MessageCounter,
) -> Result<LoopExit, PeerError> {
    let handshake = async {
        let secure = SecureStream::respond(stream, key).await?;
        let mut conn = Connection::new(secure, &config.handshake, key);
        let (hello, status) = conn.accept_peer(Some(&config.status)).await?;
        Ok::<_, HandshakeError>((conn, hello, status))
    };
    let (mut conn, hello, status) = match timeout(config.handshake_timeout, handshake).await {
        Ok(result) => result?,
        Err(_) => return Err(HandshakeError::Timeout(config.handshake_timeout).into()),
    };
    info!(
        client_id = %hello.client_id,
        remote_key = %hex::encode(hello.node_key),
        network_id = status.as_ref().map(|s| s.network_id),
        "Peer connected"
    );

    let result = conn.read_and_serve(counter).await;
    conn.close().await;
    Ok(result?)
}
