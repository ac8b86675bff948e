//! Access-log ingestion.
//!
//! nginx ships access-log lines over syslog (`access_log syslog:server=...`).
//! The receiver decodes the RFC 3164 envelope and forwards each record, in
//! arrival order, over an unbounded channel to the decision loop.

mod framing;
mod server;
pub mod syslog;

pub use server::IngestServer;
pub use syslog::parse_message;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded syslog message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogRecord {
    pub priority: Option<u8>,
    pub hostname: Option<String>,
    pub tag: Option<String>,
    /// The formatted access-log line, e.g. `1.2.3.4 - - [...] "GET / HTTP/1.1" ...`
    pub content: String,
    /// Peer the message arrived from, when the transport reports one.
    pub received_from: Option<String>,
}

impl LogRecord {
    pub fn from_content(content: impl Into<String>) -> Self {
        Self { content: content.into(), ..Self::default() }
    }

    /// Source address token of the access-log line.
    pub fn address(&self) -> Option<&str> {
        extract_address(&self.content)
    }
}

/// Leading whitespace-delimited token of an access-log line.
///
/// The token is not validated here; classification decides whether it is an
/// address at all.
pub fn extract_address(content: &str) -> Option<&str> {
    content.split_whitespace().next()
}
