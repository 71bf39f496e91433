//! Capability handshake and message loop over a secure channel
//!
//! A [`Connection`] wraps an established [`SecureStream`] and drives the
//! in-band protocol: hello exchange, the optional status step, and the
//! read-and-count loop that follows.

use crate::p2p::counter::MessageCounter;
use crate::p2p::domain::{FrameError, HandshakeError, Hello, ReadError, Status};
use crate::p2p::transport::{NodeKey, SecureStream};
use crate::p2p::wire::{
    classify, codes, negotiate, DisconnectReason, Frame, NegotiatedProtocol, ProtocolSpec,
    BASE_PROTOCOL_LENGTH, BASE_PROTOCOL_VERSION, DEFAULT_PROTOCOLS,
};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace};

/// What the local side advertises in its hello
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub client_id: String,
    pub protocols: Vec<ProtocolSpec>,
    pub listen_port: u16,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            client_id: format!("p2p_ping/v{}", env!("CARGO_PKG_VERSION")),
            protocols: DEFAULT_PROTOCOLS.to_vec(),
            listen_port: 0,
        }
    }
}

impl HandshakeConfig {
    pub fn hello(&self, key: &NodeKey) -> Hello {
        Hello {
            protocol_version: BASE_PROTOCOL_VERSION,
            client_id: self.client_id.clone(),
            capabilities: self.protocols.iter().map(ProtocolSpec::capability).collect(),
            listen_port: self.listen_port,
            node_key: *key.public(),
        }
    }
}

/// How a message loop ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The peer sent a disconnect message
    Disconnected(DisconnectReason),

    /// The peer closed the stream between frames
    Closed,
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopExit::Disconnected(reason) => write!(f, "peer disconnected: {}", reason),
            LoopExit::Closed => f.write_str("connection closed by peer"),
        }
    }
}

/// Point in time by which [`Connection::peer`] must finish, with the limit it
/// was derived from
#[derive(Debug, Clone, Copy)]
struct HandshakeDeadline {
    at: Instant,
    limit: Duration,
}

/// A secured peer session
pub struct Connection<S> {
    stream: SecureStream<S>,
    local_hello: Hello,
    protocols: Vec<ProtocolSpec>,
    remote_hello: Option<Hello>,
    negotiated: Vec<NegotiatedProtocol>,
    read_timeout: Option<Duration>,
    handshake_deadline: Option<HandshakeDeadline>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: SecureStream<S>, config: &HandshakeConfig, key: &NodeKey) -> Self {
        Self {
            stream,
            local_hello: config.hello(key),
            protocols: config.protocols.clone(),
            remote_hello: None,
            negotiated: Vec::new(),
            read_timeout: None,
            handshake_deadline: None,
        }
    }

    /// Fail the message loop when no frame arrives within `limit`
    pub fn with_read_timeout(mut self, limit: Option<Duration>) -> Self {
        self.read_timeout = limit;
        self
    }

    /// Fail the handshake with [`HandshakeError::Timeout`] once `at` passes.
    ///
    /// `limit` is the configured timeout `at` was computed from; the secure
    /// channel setup usually consumed part of it already.
    pub fn with_handshake_deadline(mut self, at: Instant, limit: Duration) -> Self {
        self.handshake_deadline = Some(HandshakeDeadline { at, limit });
        self
    }

    /// Hello received from the peer, once the exchange got that far
    pub fn remote_hello(&self) -> Option<&Hello> {
        self.remote_hello.as_ref()
    }

    pub fn negotiated(&self) -> &[NegotiatedProtocol] {
        &self.negotiated
    }

    pub fn remote_static(&self) -> &[u8; 32] {
        self.stream.remote_static()
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        trace!(code = frame.code, len = frame.payload.len(), "write frame");
        self.stream.send(&frame.encode()).await
    }

    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        let frame = Frame::decode(self.stream.recv().await?)?;
        trace!(code = frame.code, len = frame.payload.len(), "read frame");
        Ok(frame)
    }

    /// Send the local hello, require the peer's first frame to be a hello and
    /// negotiate the shared sub-protocols.
    pub async fn exchange_hello(&mut self) -> Result<Hello, HandshakeError> {
        let hello = Frame::hello(&self.local_hello)?;
        self.write_frame(&hello).await?;

        let frame = self.read_frame().await?;
        match frame.code {
            codes::HELLO => {}
            codes::DISCONNECT => {
                return Err(HandshakeError::Disconnected(DisconnectReason::from_payload(
                    &frame.payload,
                )))
            }
            code => return Err(HandshakeError::ExpectedHello { code }),
        }

        let remote: Hello = frame.body("hello")?;
        if &remote.node_key != self.stream.remote_static() {
            self.disconnect(DisconnectReason::UnexpectedIdentity).await;
            return Err(HandshakeError::IdentityMismatch);
        }
        self.remote_hello = Some(remote.clone());

        self.negotiated = negotiate(&self.protocols, &remote.capabilities);
        if self.negotiated.is_empty() {
            debug!(
                remote_caps = ?remote.capabilities,
                "No shared capabilities with peer"
            );
            self.disconnect(DisconnectReason::UselessPeer).await;
            return Err(HandshakeError::NoCommonCapabilities);
        }

        debug!(
            client_id = %remote.client_id,
            negotiated = ?self
                .negotiated
                .iter()
                .map(|p| p.spec.capability().to_string())
                .collect::<Vec<_>>(),
            "Hello exchanged"
        );
        Ok(remote)
    }

    /// Initiator side of the handshake.
    ///
    /// After the hello exchange, a negotiated status-bearing protocol requires
    /// the peer's status; it is echoed back unchanged.
    pub async fn peer(&mut self) -> Result<(Hello, Option<Status>), HandshakeError> {
        within(self.handshake_deadline, self.initiate_peer()).await
    }

    async fn initiate_peer(&mut self) -> Result<(Hello, Option<Status>), HandshakeError> {
        let hello = self.exchange_hello().await?;

        let Some(protocol) = self.status_protocol() else {
            return Ok((hello, None));
        };
        let status = self.read_status(protocol).await?;
        self.write_frame(&Frame::status(&protocol, &status)?).await?;

        Ok((hello, Some(status)))
    }

    /// Responder side of the handshake.
    ///
    /// When a status-bearing protocol is negotiated and `local_status` is set,
    /// the local status goes out first, stamped with the negotiated version,
    /// and the initiator's status is read back.
    pub async fn accept_peer(
        &mut self,
        local_status: Option<&Status>,
    ) -> Result<(Hello, Option<Status>), HandshakeError> {
        within(self.handshake_deadline, self.respond_peer(local_status)).await
    }

    async fn respond_peer(
        &mut self,
        local_status: Option<&Status>,
    ) -> Result<(Hello, Option<Status>), HandshakeError> {
        let hello = self.exchange_hello().await?;

        let (Some(protocol), Some(local)) = (self.status_protocol(), local_status) else {
            return Ok((hello, None));
        };
        let mut status = local.clone();
        status.protocol_version = protocol.spec.version;
        self.write_frame(&Frame::status(&protocol, &status)?).await?;

        let remote = self.read_status(protocol).await?;
        Ok((hello, Some(remote)))
    }

    fn status_protocol(&self) -> Option<NegotiatedProtocol> {
        self.negotiated
            .iter()
            .find(|protocol| protocol.spec.has_status)
            .copied()
    }

    async fn read_status(&mut self, protocol: NegotiatedProtocol) -> Result<Status, HandshakeError> {
        let status_code = protocol.code(codes::STATUS);
        loop {
            let frame = self.read_frame().await?;
            match frame.code {
                code if code == status_code => return Ok(frame.body("status")?),
                codes::PING => self.write_frame(&Frame::empty(codes::PONG)).await?,
                codes::PONG => {}
                codes::DISCONNECT => {
                    return Err(HandshakeError::Disconnected(DisconnectReason::from_payload(
                        &frame.payload,
                    )))
                }
                codes::HELLO => return Err(HandshakeError::DuplicateHello),
                code if code >= BASE_PROTOCOL_LENGTH => {
                    self.disconnect(DisconnectReason::ProtocolBreach).await;
                    return Err(HandshakeError::StatusOutOfOrder { code });
                }
                code => trace!(code, "ignoring base protocol message before status"),
            }
        }
    }

    /// Read until the peer goes away, answering pings and counting every
    /// other message except pong and disconnect.
    ///
    /// Counts recorded before an error remain in `counter`.
    pub async fn read_and_serve(&mut self, counter: &MessageCounter) -> Result<LoopExit, ReadError> {
        loop {
            let frame = match self.next_frame().await {
                Ok(frame) => frame,
                Err(ReadError::Frame(FrameError::Closed)) => return Ok(LoopExit::Closed),
                Err(e) => return Err(e),
            };

            match frame.code {
                codes::PING => self.write_frame(&Frame::empty(codes::PONG)).await?,
                codes::PONG => {}
                codes::DISCONNECT => {
                    return Ok(LoopExit::Disconnected(DisconnectReason::from_payload(
                        &frame.payload,
                    )))
                }
                code => counter.increment(classify(&self.negotiated, code)),
            }
        }
    }

    async fn next_frame(&mut self) -> Result<Frame, ReadError> {
        match self.read_timeout {
            Some(limit) => match timeout(limit, self.read_frame()).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(ReadError::Idle(limit)),
            },
            None => Ok(self.read_frame().await?),
        }
    }

    /// Send a disconnect, ignoring write failures
    pub async fn disconnect(&mut self, reason: DisconnectReason) {
        if let Err(e) = self.write_frame(&Frame::disconnect(reason)).await {
            debug!(error = %e, reason = %reason, "Failed to send disconnect");
        }
    }

    /// Shut the stream down; the socket is released when `self` drops
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!(error = %e, "Failed to shut down connection");
        }
    }
}

async fn within<T>(
    deadline: Option<HandshakeDeadline>,
    handshake: impl Future<Output = Result<T, HandshakeError>>,
) -> Result<T, HandshakeError> {
    let Some(deadline) = deadline else {
        return handshake.await;
    };
    match timeout_at(deadline.at, handshake).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout(deadline.limit)),
    }
}
