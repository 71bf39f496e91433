//! Noise_XX secure channel over a byte stream
//!
//! Both sides hold a long-term X25519 static key. The XX pattern transmits both
//! static keys encrypted, so the handshake authenticates each side to the other.
//! Afterwards every frame travels as one Noise transport message with a 2-byte
//! big-endian length prefix:
//!
//! ```text
//! [len: u16 BE] [ciphertext: len bytes = plaintext + 16-byte tag]
//! ```

use crate::p2p::domain::{FrameError, HandshakeError};
use rand::rngs::OsRng;
use snow::{Builder, HandshakeState, TransportState};
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};
use x25519_dalek::{PublicKey, StaticSecret};

/// Noise protocol pattern used for every connection
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Largest message the Noise protocol permits
pub const MAX_NOISE_MESSAGE_LEN: usize = 65535;

const TAG_LEN: usize = 16;

/// Largest plaintext that fits in one transport message
pub const MAX_FRAME_LEN: usize = MAX_NOISE_MESSAGE_LEN - TAG_LEN;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("invalid node key hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("node key must be 32 bytes, got {0}")]
    Length(usize),
}

/// Long-term static X25519 keypair of the local node
#[derive(Clone)]
pub struct NodeKey {
    secret: StaticSecret,
    public: [u8; 32],
}

impl NodeKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_bytes(private: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(private))
    }

    /// Parse a hex-encoded private key
    pub fn from_hex(text: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(text.trim())?;
        let private: [u8; 32] = bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| KeyError::Length(bytes.len()))?;
        Ok(Self::from_bytes(private))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = *PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }

    pub fn public(&self) -> &[u8; 32] {
        &self.public
    }

    fn builder_params(&self) -> Result<(snow::params::NoiseParams, [u8; 32]), FrameError> {
        Ok((NOISE_PATTERN.parse()?, self.secret.to_bytes()))
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKey")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// An authenticated, encrypted stream established by a completed Noise_XX
/// handshake
pub struct SecureStream<S> {
    stream: S,
    transport: TransportState,
    remote_static: [u8; 32],
    buffer: Vec<u8>,
}

impl<S> SecureStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Run the initiator role and require the responder to prove ownership of
    /// `expected_remote`
    pub async fn initiate(
        mut stream: S,
        key: &NodeKey,
        expected_remote: &[u8; 32],
    ) -> Result<Self, HandshakeError> {
        let (mut state, mut buffer) = initiator_start(&mut stream, key)
            .await
            .map_err(HandshakeError::SecureChannel)?;
        let remote_static = remote_static(&state).map_err(HandshakeError::SecureChannel)?;

        // an unexpected responder never receives our static key
        if &remote_static != expected_remote {
            return Err(HandshakeError::KeyMismatch {
                expected: hex::encode(expected_remote),
                received: hex::encode(remote_static),
            });
        }

        initiator_finish(&mut stream, &mut state, &mut buffer)
            .await
            .map_err(HandshakeError::SecureChannel)?;
        Self::establish(stream, state, remote_static, buffer)
    }

    /// Run the responder role, accepting any initiator key
    pub async fn respond(mut stream: S, key: &NodeKey) -> Result<Self, HandshakeError> {
        let (state, buffer) = responder_handshake(&mut stream, key)
            .await
            .map_err(HandshakeError::SecureChannel)?;
        let remote_static = remote_static(&state).map_err(HandshakeError::SecureChannel)?;

        Self::establish(stream, state, remote_static, buffer)
    }

    fn establish(
        stream: S,
        state: HandshakeState,
        remote_static: [u8; 32],
        buffer: Vec<u8>,
    ) -> Result<Self, HandshakeError> {
        let transport = state
            .into_transport_mode()
            .map_err(|e| HandshakeError::SecureChannel(e.into()))?;

        debug!(
            remote_static = %hex::encode(remote_static),
            "Secure channel established"
        );

        Ok(Self {
            stream,
            transport,
            remote_static,
            buffer,
        })
    }

    /// Static public key the remote side authenticated with
    pub fn remote_static(&self) -> &[u8; 32] {
        &self.remote_static
    }

    /// Encrypt and send one frame
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), FrameError> {
        if plaintext.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge {
                len: plaintext.len(),
                max: MAX_FRAME_LEN,
            });
        }
        let len = self.transport.write_message(plaintext, &mut self.buffer)?;
        write_noise_message(&mut self.stream, &self.buffer[..len]).await
    }

    /// Receive and decrypt one frame.
    ///
    /// A clean end of stream between frames yields [`FrameError::Closed`].
    pub async fn recv(&mut self) -> Result<Vec<u8>, FrameError> {
        let message = read_noise_message(&mut self.stream).await?;
        let len = self.transport.read_message(&message, &mut self.buffer)?;
        Ok(self.buffer[..len].to_vec())
    }

    /// Shut down the write half of the underlying stream
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

// -> e
// <- e, ee, s, es
async fn initiator_start<S>(
    stream: &mut S,
    key: &NodeKey,
) -> Result<(HandshakeState, Vec<u8>), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (params, private) = key.builder_params()?;
    let mut state = Builder::new(params)
        .local_private_key(&private)
        .build_initiator()?;
    let mut buffer = vec![0u8; MAX_NOISE_MESSAGE_LEN];

    let len = state.write_message(&[], &mut buffer)?;
    write_noise_message(stream, &buffer[..len]).await?;
    trace!("sent noise message 1");

    let message = read_noise_message(stream).await?;
    state.read_message(&message, &mut buffer)?;
    trace!("received noise message 2");

    Ok((state, buffer))
}

// -> s, se
async fn initiator_finish<S>(
    stream: &mut S,
    state: &mut HandshakeState,
    buffer: &mut [u8],
) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = state.write_message(&[], buffer)?;
    write_noise_message(stream, &buffer[..len]).await?;
    trace!("sent noise message 3");
    Ok(())
}

async fn responder_handshake<S>(
    stream: &mut S,
    key: &NodeKey,
) -> Result<(HandshakeState, Vec<u8>), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (params, private) = key.builder_params()?;
    let mut state = Builder::new(params)
        .local_private_key(&private)
        .build_responder()?;
    let mut buffer = vec![0u8; MAX_NOISE_MESSAGE_LEN];

    let message = read_noise_message(stream).await?;
    state.read_message(&message, &mut buffer)?;
    trace!("received noise message 1");

    let len = state.write_message(&[], &mut buffer)?;
    write_noise_message(stream, &buffer[..len]).await?;
    trace!("sent noise message 2");

    let message = read_noise_message(stream).await?;
    state.read_message(&message, &mut buffer)?;
    trace!("received noise message 3");

    Ok((state, buffer))
}

fn remote_static(state: &HandshakeState) -> Result<[u8; 32], FrameError> {
    let key = state.get_remote_static().ok_or(FrameError::Malformed {
        message: "noise",
        reason: "handshake finished without a remote static key".to_string(),
    })?;
    key.try_into().map_err(|_| FrameError::Malformed {
        message: "noise",
        reason: format!("remote static key has {} bytes", key.len()),
    })
}

pub(crate) async fn write_noise_message<W>(writer: &mut W, message: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(message.len()).map_err(|_| FrameError::TooLarge {
        len: message.len(),
        max: MAX_NOISE_MESSAGE_LEN,
    })?;
    writer.write_u16(len).await?;
    writer.write_all(message).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_noise_message<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u16().await {
        Ok(len) => usize::from(len),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(e) => return Err(e.into()),
    };
    let mut message = vec![0u8; len];
    reader.read_exact(&mut message).await?;
    Ok(message)
}
