//! Per-node probe pipeline: dial, handshake, optional message loop

use crate::p2p::connection::Connection;
use crate::p2p::counter::MessageCounter;
use crate::p2p::dial::{dial, ProbeConfig};
use crate::p2p::domain::{PeerError, PeerOutcome};
use crate::p2p::node::NodeRecord;
use crate::p2p::transport::NodeKey;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, instrument, warn};

/// Produces exactly one outcome for a node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe `node`; when `listen` is set and the handshake succeeds, keep
    /// reading and count messages into `counter` until the peer goes away.
    async fn probe(&self, node: &NodeRecord, listen: bool, counter: &MessageCounter)
        -> PeerOutcome;
}

/// Prober that talks to real peers over TCP
#[derive(Debug, Clone)]
pub struct NetworkProber {
    key: NodeKey,
    config: ProbeConfig,
}

impl NetworkProber {
    pub fn new(key: NodeKey, config: ProbeConfig) -> Self {
        Self { key, config }
    }

    async fn drive<S>(
        &self,
        conn: &mut Connection<S>,
        outcome: &mut PeerOutcome,
        listen: bool,
        counter: &MessageCounter,
    ) -> Result<(), PeerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (hello, status) = match conn.peer().await {
            Ok(result) => result,
            Err(e) => {
                outcome.hello = conn.remote_hello().cloned();
                return Err(e.into());
            }
        };
        info!(
            client_id = %hello.client_id,
            status = status.is_some(),
            "Handshake completed"
        );
        outcome.hello = Some(hello);
        outcome.status = status;

        if listen {
            let exit = conn.read_and_serve(counter).await?;
            debug!(exit = %exit, "Message loop finished");
        }
        Ok(())
    }
}

#[async_trait]
impl Prober for NetworkProber {
    #[instrument(skip_all, fields(node_id = %node.id(), addr = %node.address()))]
    async fn probe(
        &self,
        node: &NodeRecord,
        listen: bool,
        counter: &MessageCounter,
    ) -> PeerOutcome {
        let mut outcome = PeerOutcome::new(node.clone());

        let mut conn = match dial(node, &self.key, &self.config).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Dial failed");
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };

        if let Err(e) = self.drive(&mut conn, &mut outcome, listen, counter).await {
            warn!(error = %e, "Probe failed");
            outcome.error = Some(e.to_string());
        }
        conn.close().await;

        outcome
    }
}
