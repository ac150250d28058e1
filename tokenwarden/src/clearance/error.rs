use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures of the external clearance scraper.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to spawn scraper: {0}")]
    SpawnFailed(#[source] io::Error),

    #[error("scraper script not found at {}", .0.display())]
    ScriptMissing(PathBuf),

    #[error("scraper failed with code {}: {output}", exit_code_label(.code))]
    NonZeroExit { code: Option<i32>, output: String },

    #[error("scraper timed out after {0:?}")]
    Timeout(Duration),

    #[error("no clearance data found for domain {0} (checked both \"{0}\" and \".{0}\")")]
    MissingDomain(String),

    #[error("could not extract clearance from scraper output")]
    UnparsableOutput,

    #[error("failed to parse scraper result: {0}")]
    Malformed(String),

    #[error("failed waiting on scraper: {0}")]
    Wait(#[source] io::Error),
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

/// Failures surfaced by the clearance cache.
#[derive(Debug, Error)]
pub enum ClearanceError {
    #[error(transparent)]
    Acquisition(#[from] BrokerError),

    /// A concurrent acquisition for the same key failed; carries its message.
    #[error("shared acquisition failed: {0}")]
    Shared(String),

    #[error("failed to persist clearance cache: {0}")]
    Persist(#[source] crate::Error),

    #[error("invalid proxy: {0}")]
    InvalidProxy(String),

    #[error("invalid target URL: {0}")]
    InvalidTarget(String),

    #[error("acquisition cancelled")]
    Cancelled,
}
