//! Log subscriber setup and run-level log helpers
//!
//! Logs always go to stderr; stdout is reserved for the probe report.

use crate::arguments_parser::{LogFormat, LogLevel};
use std::time::Duration;
use thiserror::Error;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "p2p_ping";

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log directive: {0}")]
    Directive(#[from] ParseError),

    #[error("log subscriber already installed: {0}")]
    Init(#[from] TryInitError),
}

/// Install the global subscriber.
///
/// `RUST_LOG` directives are honoured and `log_level` is added for this crate.
/// [`LogFormat::Json`] emits Bunyan records, [`LogFormat::Pretty`] compact
/// lines.
pub fn setup_telemetry(log_level: LogLevel, log_format: LogFormat) -> Result<(), TelemetryError> {
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("{}={}", SERVICE_NAME, log_level.as_str()).parse()?);

    let json = matches!(log_format, LogFormat::Json);
    let compact = (!json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .compact()
    });
    let storage = json.then_some(JsonStorageLayer);
    let bunyan = json.then(|| BunyanFormattingLayer::new(SERVICE_NAME.to_string(), std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(storage)
        .with(bunyan)
        .with(compact)
        .try_init()?;

    tracing::debug!(format = ?log_format, "Logging initialized");
    Ok(())
}

/// Where the binary runs, read from `ENVIRONMENT`; picks log defaults when
/// the command line leaves them unset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Deployment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Deployment {
    pub fn from_env() -> Self {
        std::env::var("ENVIRONMENT")
            .map(|value| Self::parse(&value))
            .unwrap_or_default()
    }

    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "production" | "prod" => Deployment::Production,
            "staging" | "stage" => Deployment::Staging,
            _ => Deployment::Development,
        }
    }

    /// Machine-readable logs in production
    pub fn log_format(self) -> LogFormat {
        match self {
            Deployment::Production => LogFormat::Json,
            Deployment::Staging | Deployment::Development => LogFormat::Pretty,
        }
    }

    pub fn log_level(self) -> LogLevel {
        match self {
            Deployment::Staging => LogLevel::Debug,
            Deployment::Production | Deployment::Development => LogLevel::Info,
        }
    }
}

/// Identifier attached to a coordinator run's span
pub fn generate_correlation_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let random_component: u32 = rand::random();
    format!("{:x}{:08x}", timestamp, random_component)
}

pub fn log_run_success(mode: &str, duration: Duration) {
    tracing::info!(
        mode,
        duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        "Run completed"
    );
}

/// Log a failed run with every error in its source chain
pub fn log_run_failure(mode: &str, error: &(dyn std::error::Error + 'static), duration: Duration) {
    tracing::error!(
        mode,
        duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        error = %error,
        error.chain = ?error_chain(error),
        "Run failed"
    );
}

fn error_chain(error: &(dyn std::error::Error + 'static)) -> Vec<String> {
    std::iter::successors(Some(error), |err| err.source())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::domain::{FrameError, HandshakeError, PeerError};

    #[test]
    fn test_correlation_ids_differ() {
        let first = generate_correlation_id();
        let second = generate_correlation_id();

        assert_ne!(first, second);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_error_chain_follows_handshake_sources() {
        let error = PeerError::from(HandshakeError::SecureChannel(FrameError::Closed));

        assert_eq!(
            error_chain(&error),
            vec![
                "handshake failed: secure channel setup failed: connection closed by peer"
                    .to_string(),
                "secure channel setup failed: connection closed by peer".to_string(),
                "connection closed by peer".to_string(),
            ]
        );
    }

    #[test]
    fn test_deployment_log_defaults() {
        assert_eq!(Deployment::parse("PROD"), Deployment::Production);
        assert_eq!(Deployment::parse("stage"), Deployment::Staging);
        assert_eq!(Deployment::parse("laptop"), Deployment::Development);

        assert_eq!(Deployment::Production.log_format(), LogFormat::Json);
        assert_eq!(Deployment::Production.log_level(), LogLevel::Info);
        assert_eq!(Deployment::Staging.log_format(), LogFormat::Pretty);
        assert_eq!(Deployment::Staging.log_level(), LogLevel::Debug);
        assert_eq!(Deployment::default().log_format(), LogFormat::Pretty);
    }
}
