//! Bounded fan-out over target nodes with a periodic counter flush

use crate::p2p::counter::{CountSnapshot, MessageCounter};
use crate::p2p::domain::PeerOutcome;
use crate::p2p::node::{NodeId, NodeRecord};
use crate::p2p::prober::Prober;
use crate::telemetry::generate_correlation_id;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, error, info, instrument, Instrument};

/// Default admission limit
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// Default period between counter flushes (2 seconds)
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum number of probes past admission at once
    pub max_concurrency: usize,
    /// Run the message loop after a successful handshake
    pub listen: bool,
    pub flush_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            listen: true,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Outcomes keyed by node identifier
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ResultSet(BTreeMap<NodeId, PeerOutcome>);

impl ResultSet {
    /// Record `outcome` for its node, returning any outcome it replaces
    pub fn insert(&mut self, outcome: PeerOutcome) -> Option<PeerOutcome> {
        self.0.insert(outcome.record.id(), outcome)
    }

    pub fn get(&self, id: &NodeId) -> Option<&PeerOutcome> {
        self.0.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.0.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &PeerOutcome)> {
        self.0.iter()
    }

    pub fn successful_count(&self) -> usize {
        self.0.values().filter(|outcome| outcome.is_success()).count()
    }
}

/// Totals over the non-empty flushes of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub flushes: usize,
    pub messages: u64,
}

/// Everything a run produced
#[derive(Debug, Default)]
pub struct RunReport {
    pub results: ResultSet,
    pub flush_stats: FlushStats,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    prober: Arc<dyn Prober>,
    counter: Arc<MessageCounter>,
    flush_sink: Option<mpsc::UnboundedSender<CountSnapshot>>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, prober: Arc<dyn Prober>) -> Self {
        Self {
            config,
            prober,
            counter: Arc::new(MessageCounter::new()),
            flush_sink: None,
        }
    }

    /// Also hand every non-empty snapshot to `sink` after it is logged
    pub fn with_flush_sink(mut self, sink: mpsc::UnboundedSender<CountSnapshot>) -> Self {
        self.flush_sink = Some(sink);
        self
    }

    /// Probe every node and block until each has an outcome.
    ///
    /// At most `max_concurrency` probes run at once. A task is admitted before
    /// it is spawned, so pending nodes hold no resources.
    #[instrument(skip_all, fields(run_id = %generate_correlation_id(), nodes = nodes.len()))]
    pub async fn run(&self, nodes: Vec<NodeRecord>) -> RunReport {
        let started = Instant::now();
        let nodes = dedup(nodes);
        let max_concurrency = self.config.max_concurrency.max(1);
        info!(
            unique_nodes = nodes.len(),
            max_concurrency,
            listen = self.config.listen,
            "Starting probe run"
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let flusher = tokio::spawn(
            flush_counts(
                Arc::clone(&self.counter),
                self.config.flush_interval,
                stop_rx,
                self.flush_sink.clone(),
            )
            .in_current_span(),
        );

        let gate = Arc::new(Semaphore::new(max_concurrency));
        let results = Arc::new(Mutex::new(ResultSet::default()));
        let mut tasks = JoinSet::new();

        for node in &nodes {
            let permit = match Arc::clone(&gate).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "Admission gate closed");
                    break;
                }
            };
            let node = node.clone();
            let prober = Arc::clone(&self.prober);
            let counter = Arc::clone(&self.counter);
            let results = Arc::clone(&results);
            let listen = self.config.listen;

            tasks.spawn(
                async move {
                    let _permit = permit;
                    let outcome = prober.probe(&node, listen, &counter).await;
                    results.lock().await.insert(outcome);
                }
                .in_current_span(),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Probe task failed");
            }
        }

        let mut results = std::mem::take(&mut *results.lock().await);
        for node in nodes {
            if !results.contains(&node.id()) {
                results.insert(PeerOutcome::failed(node, "probe task aborted"));
            }
        }

        // The receiver only disappears if the flusher panicked, reported below.
        let _ = stop_tx.send(());
        let flush_stats = match flusher.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Counter flush task failed");
                FlushStats::default()
            }
        };

        info!(
            total = results.len(),
            succeeded = results.successful_count(),
            flushes = flush_stats.flushes,
            messages = flush_stats.messages,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Probe run finished"
        );
        RunReport {
            results,
            flush_stats,
        }
    }
}

fn dedup(nodes: Vec<NodeRecord>) -> Vec<NodeRecord> {
    let mut seen = HashSet::new();
    nodes
        .into_iter()
        .filter(|node| {
            let fresh = seen.insert(node.id());
            if !fresh {
                debug!(node = %node, "Skipping duplicate node");
            }
            fresh
        })
        .collect()
}

/// Drain `counter` every `period` until `stop` fires, then drain once more.
///
/// Only non-empty snapshots are logged, forwarded to `sink` and counted;
/// nothing is retained between ticks. The first drain happens one full period
/// after start.
pub async fn flush_counts(
    counter: Arc<MessageCounter>,
    period: Duration,
    mut stop: oneshot::Receiver<()>,
    sink: Option<mpsc::UnboundedSender<CountSnapshot>>,
) -> FlushStats {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats = FlushStats::default();

    loop {
        tokio::select! {
            _ = ticker.tick() => drain(&counter, &mut stats, sink.as_ref()),
            _ = &mut stop => break,
        }
    }
    drain(&counter, &mut stats, sink.as_ref());
    stats
}

fn drain(
    counter: &MessageCounter,
    stats: &mut FlushStats,
    sink: Option<&mpsc::UnboundedSender<CountSnapshot>>,
) {
    let snapshot = counter.snapshot_and_reset();
    if snapshot.is_empty() {
        return;
    }
    info!(
        messages = snapshot.total(),
        kinds = snapshot.len(),
        counts = %snapshot,
        "Message counts"
    );
    stats.flushes += 1;
    stats.messages += snapshot.total();
    if let Some(sink) = sink {
        if sink.send(snapshot).is_err() {
            debug!("Flush sink dropped");
        }
    }
}
