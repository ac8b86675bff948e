use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Sustained requests per second permitted for one source address
    /// Default: 50
    #[serde(default = "default_rate")]
    pub rate: f64,
    /// Bucket capacity, the largest burst one address may send at once
    /// Default: 100
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Destination ports the drop rules cover
    /// At most 15 entries (iptables multiport limit)
    /// Default: [80, 443]
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    /// Provision and enforce through ip6tables as well
    /// Default: false
    #[serde(default)]
    pub ipv6: bool,
    /// Keep all rules in memory instead of touching the kernel
    /// Default: false
    #[serde(default)]
    pub dry_run: bool,
    /// Networks that are never rate limited nor banned
    /// Supports CIDR notation: ["127.0.0.0/8", "::1/128"]
    /// Default: empty
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_ip_networks")]
    pub allowlist: Vec<IpNet>,
    /// Syslog ingestion configuration
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Rate ledger sizing and expiry
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Telemetry configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            burst: default_burst(),
            ports: default_ports(),
            ipv6: false,
            dry_run: false,
            allowlist: vec![],
            ingest: IngestConfig::default(),
            ledger: LedgerConfig::default(),
            logging: LoggingConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Config {
    /// Port list in the form iptables multiport expects ("80,443")
    pub fn ports_spec(&self) -> String {
        self.ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Syslog ingestion configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct IngestConfig {
    /// Address for the UDP and TCP syslog listeners
    /// Default: "127.0.0.1:514"
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Unix datagram socket nginx writes to
    /// (`access_log syslog:server=unix:/var/run/go-ngx-limiter.sock limiter;`)
    /// Default: "/var/run/go-ngx-limiter.sock"
    #[serde(default = "default_unix_socket")]
    pub unix_socket: PathBuf,
    /// Only listen on the unix socket
    /// Default: false
    #[serde(default)]
    pub unix_only: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { listen: default_listen(), unix_socket: default_unix_socket(), unix_only: false }
    }
}

/// Rate ledger eviction policy
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Maximum number of tracked addresses
    /// Default: 65536
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Entries not seen for this many seconds are dropped, 0 disables expiry
    /// Default: 600
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl LedgerConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    /// Default: "info"
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Show module path (target) in log messages
    /// Default: false
    #[serde(default)]
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), show_target: false }
    }
}

/// Telemetry configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelemetryConfig {
    /// Port for the metrics and health server, disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Custom deserializer for IP networks that handles parsing errors gracefully
fn deserialize_ip_networks<'de, D>(deserializer: D) -> Result<Vec<IpNet>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let strings: Vec<String> = Vec::deserialize(deserializer)?;
    let mut networks = Vec::with_capacity(strings.len());

    for s in strings {
        match s.parse::<IpNet>() {
            Ok(net) => networks.push(net),
            Err(e) => {
                return Err(serde::de::Error::custom(format!("Invalid IP network '{s}': {e}")));
            }
        }
    }

    Ok(networks)
}

fn default_rate() -> f64 {
    50.0
}

fn default_burst() -> u32 {
    100
}

fn default_ports() -> Vec<u16> {
    vec![80, 443]
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 514))
}

fn default_unix_socket() -> PathBuf {
    PathBuf::from("/var/run/go-ngx-limiter.sock")
}

fn default_max_entries() -> usize {
    65536
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}
