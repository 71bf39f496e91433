//! JSON report output

use crate::p2p::coordinator::ResultSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write report to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write report to stdout: {0}")]
    Stdout(#[source] std::io::Error),
}

/// Pretty-printed JSON object keyed by node id, with a trailing newline
pub fn render_report(results: &ResultSet) -> Result<Vec<u8>, ReportError> {
    let mut bytes = serde_json::to_vec_pretty(results)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Write the report to `path`, or to stdout when no path is given
pub fn write_report(results: &ResultSet, path: Option<&Path>) -> Result<(), ReportError> {
    let bytes = render_report(results)?;

    match path {
        Some(path) => std::fs::write(path, &bytes).map_err(|source| ReportError::Write {
            path: path.to_path_buf(),
            source,
        }),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(&bytes)
                .and_then(|_| stdout.flush())
                .map_err(ReportError::Stdout)
        }
    }
}
