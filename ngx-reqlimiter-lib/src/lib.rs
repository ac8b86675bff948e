#![forbid(unsafe_code)]

pub mod config;
pub mod decision;
pub mod error;
pub mod firewall;
pub mod ingest;
pub mod lifecycle;
pub mod security;
pub mod telemetry;

pub use config::{load_from_path, Config, IngestConfig, LedgerConfig};
pub use decision::DecisionLoop;
pub use error::{LimiterError, Result};
pub use firewall::{BanEvent, Enforcer, Family, FirewallError, IptablesCli, MemoryFilter, PacketFilter};
pub use ingest::{extract_address, IngestServer, LogRecord};
pub use lifecycle::Controller;
pub use security::{classify, AddressClass, RateLedger, TokenBucket};
