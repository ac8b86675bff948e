use thiserror::Error;

use crate::firewall::FirewallError;
use crate::ingest::IngestError;

/// Errors that can stop the limiter from starting
#[derive(Error, Debug)]
pub enum LimiterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Firewall error: {0}")]
    Firewall(#[from] FirewallError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Telemetry error: {0}")]
    Telemetry(String),
}

pub type Result<T> = std::result::Result<T, LimiterError>;
