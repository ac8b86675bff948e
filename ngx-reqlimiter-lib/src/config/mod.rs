mod loader;
pub mod types;

pub use loader::{load_from_path, validate};
pub use types::{Config, IngestConfig, LedgerConfig, LoggingConfig, TelemetryConfig};
