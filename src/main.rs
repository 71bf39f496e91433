use anyhow::Context;
use clap::Parser;
use p2p_ping::{
    arguments_parser::{ApplicationMode, Args},
    p2p::{load_targets, Coordinator, NetworkProber, NodeKey, Responder},
    report::write_report,
    telemetry::{log_run_failure, log_run_success, setup_telemetry, Deployment},
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Argument validation error: {}", e);
        std::process::exit(1);
    }

    // Command-line log settings win over the deployment defaults
    let deployment = Deployment::from_env();
    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| deployment.log_level());
    let log_format = args
        .log_format
        .clone()
        .unwrap_or_else(|| deployment.log_format());
    setup_telemetry(log_level, log_format).context("Failed to setup telemetry")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        deployment = ?deployment,
        mode = ?args.mode,
        "Starting p2p ping application"
    );

    let start_time = Instant::now();

    let key = args.node_key().context("Failed to load node key")?;
    info!(node_key = %hex::encode(key.public()), "Using static node key");

    let mode = match args.mode {
        ApplicationMode::Ping => "ping",
        ApplicationMode::Serve => "serve",
    };
    let result = match args.mode {
        ApplicationMode::Ping => run_ping_mode(&args, key).await,
        ApplicationMode::Serve => run_serve_mode(&args, key).await,
    };

    let duration = start_time.elapsed();

    match result {
        Ok(_) => log_run_success(mode, duration),
        Err(e) => {
            log_run_failure(mode, e.as_ref(), duration);
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Probe every target and write the report
async fn run_ping_mode(args: &Args, key: NodeKey) -> anyhow::Result<()> {
    let target = args
        .target
        .as_deref()
        .context("Ping mode requires a target")?;
    let nodes = load_targets(target).context("Failed to load targets")?;
    if nodes.is_empty() {
        warn!(input = target, "No nodes to probe");
    }

    info!(
        node_count = nodes.len(),
        parallel = args.parallel,
        listen = args.listen,
        "Running in ping mode"
    );

    let prober = Arc::new(NetworkProber::new(key, args.probe_config()));
    let coordinator = Coordinator::new(args.coordinator_config(), prober);
    let report = coordinator.run(nodes).await;

    info!(
        total_nodes = report.results.len(),
        successful = report.results.successful_count(),
        flushes = report.flush_stats.flushes,
        messages = report.flush_stats.messages,
        "Probe run completed"
    );

    write_report(&report.results, args.output.as_deref()).context("Failed to write report")?;
    Ok(())
}

/// Accept probes until the process is stopped
async fn run_serve_mode(args: &Args, key: NodeKey) -> anyhow::Result<()> {
    let responder = Responder::bind(args.bind_address, key, args.responder_config())
        .await
        .with_context(|| format!("Failed to bind {}", args.bind_address))?;

    let record = responder
        .record()
        .context("Failed to get local address")?;
    info!(enode = %record, "Responder ready for probes");

    tokio::select! {
        result = responder.run() => result.context("Responder stopped")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
    }

    Ok(())
}
