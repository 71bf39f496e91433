//! Scripted loopback peers shared by the integration tests

#![allow(dead_code)]

use p2p_ping::p2p::domain::{ForkId, Status};
use p2p_ping::p2p::{
    Connection, HandshakeConfig, NetworkProber, NodeKey, NodeRecord, ProbeConfig, SecureStream,
};
use std::future::Future;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// A peer accepting exactly one connection on loopback
pub struct FakePeer {
    pub record: NodeRecord,
    pub handle: JoinHandle<()>,
}

/// Spawn a peer that completes the Noise responder role with default
/// capabilities and then hands the connection to `script`
pub async fn spawn_peer<F, Fut>(script: F) -> FakePeer
where
    F: FnOnce(Connection<TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    spawn_peer_with(HandshakeConfig::default(), script).await
}

pub async fn spawn_peer_with<F, Fut>(config: HandshakeConfig, script: F) -> FakePeer
where
    F: FnOnce(Connection<TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    spawn_delayed_peer(config, Duration::ZERO, script).await
}

/// Like [`spawn_peer_with`], but the peer waits `delay` after accepting
/// before it answers the Noise handshake
pub async fn spawn_delayed_peer<F, Fut>(
    config: HandshakeConfig,
    delay: Duration,
    script: F,
) -> FakePeer
where
    F: FnOnce(Connection<TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let key = NodeKey::generate();
    let public = *key.public();

    spawn_raw_peer_with_key(public, move |stream| async move {
        sleep(delay).await;
        let Ok(secure) = SecureStream::respond(stream, &key).await else {
            return;
        };
        script(Connection::new(secure, &config, &key)).await;
    })
    .await
}

/// Spawn a peer that gets the bare TCP stream
pub async fn spawn_raw_peer<F, Fut>(script: F) -> FakePeer
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    spawn_raw_peer_with_key(*NodeKey::generate().public(), script).await
}

async fn spawn_raw_peer_with_key<F, Fut>(public: [u8; 32], script: F) -> FakePeer
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            script(stream).await;
        }
    });

    FakePeer {
        record: NodeRecord::new(public, "127.0.0.1", port),
        handle,
    }
}

/// Record of a loopback port nothing listens on
pub async fn refused_record() -> NodeRecord {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    NodeRecord::new(*NodeKey::generate().public(), "127.0.0.1", port)
}

/// Prober with timeouts short enough for tests
pub fn test_prober() -> NetworkProber {
    test_prober_with(|_| {})
}

pub fn test_prober_with(configure: impl FnOnce(&mut ProbeConfig)) -> NetworkProber {
    let mut config = ProbeConfig {
        dial_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        read_timeout: Some(Duration::from_secs(5)),
        handshake: HandshakeConfig::default(),
    };
    configure(&mut config);
    NetworkProber::new(NodeKey::generate(), config)
}

pub fn sample_status(network_id: u64) -> Status {
    Status {
        protocol_version: 68,
        network_id,
        total_difficulty: 58_750_003_716_598_352_816_469,
        head: [0x11; 32],
        genesis: [0xd4; 32],
        fork_id: ForkId {
            hash: [0x9f, 0x3d, 0x22, 0x54],
            next: 0,
        },
    }
}
