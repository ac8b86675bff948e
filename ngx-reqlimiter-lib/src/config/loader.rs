use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::error::{LimiterError, Result};

/// iptables `-m multiport` accepts at most 15 ports
const MAX_MULTIPORT_PORTS: usize = 15;

/// Read and parse a TOML file.
///
/// The result is not validated: command-line overrides may still replace
/// file values, so callers run [`validate`] on the merged configuration.
pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| LimiterError::Config(format!("Failed to read config file: {e}")))?;
    let cfg: Config = toml::from_str(&txt)
        .map_err(|e| LimiterError::Config(format!("Failed to parse config: {e}")))?;
    Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
    if !cfg.rate.is_finite() || cfg.rate <= 0.0 {
        return Err(LimiterError::Config(format!("rate must be a positive number, got {}", cfg.rate)));
    }
    if cfg.burst == 0 {
        return Err(LimiterError::Config("burst must be >= 1".into()));
    }
    if cfg.ports.is_empty() {
        return Err(LimiterError::Config("at least one protected port is required".into()));
    }
    if cfg.ports.len() > MAX_MULTIPORT_PORTS {
        return Err(LimiterError::Config(format!(
            "at most {MAX_MULTIPORT_PORTS} protected ports are supported, got {}",
            cfg.ports.len()
        )));
    }
    if cfg.ports.contains(&0) {
        return Err(LimiterError::Config("port 0 cannot be protected".into()));
    }
    let unique: HashSet<_> = cfg.ports.iter().collect();
    if unique.len() != cfg.ports.len() {
        return Err(LimiterError::Config("protected ports must be unique".into()));
    }
    if cfg.ledger.max_entries == 0 {
        return Err(LimiterError::Config("ledger.max_entries must be > 0".into()));
    }
    if cfg.ingest.unix_socket.as_os_str().is_empty() && cfg.ingest.unix_only {
        return Err(LimiterError::Config(
            "ingest.unix_socket is required when ingest.unix_only = true".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_rejects_non_positive_rate() {
        let cfg = Config { rate: 0.0, ..Config::default() };
        assert!(validate(&cfg).is_err());

        let cfg = Config { rate: f64::NAN, ..Config::default() };
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_rejects_zero_burst() {
        let cfg = Config { burst: 0, ..Config::default() };
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_rejects_bad_port_sets() {
        let cfg = Config { ports: vec![], ..Config::default() };
        assert!(validate(&cfg).is_err());

        let cfg = Config { ports: vec![80, 0], ..Config::default() };
        assert!(validate(&cfg).is_err());

        let cfg = Config { ports: vec![80, 80], ..Config::default() };
        assert!(validate(&cfg).is_err());

        let cfg = Config { ports: (1..=16).collect(), ..Config::default() };
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_ports_spec() {
        let cfg = Config { ports: vec![80, 443, 8080], ..Config::default() };
        assert_eq!(cfg.ports_spec(), "80,443,8080");
    }

    #[test]
    fn test_load_defers_validation() -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "rate = 0.0\nburst = 4")?;

        let mut cfg = load_from_path(file.path())?;
        assert_eq!(cfg.burst, 4);
        assert!(validate(&cfg).is_err());

        cfg.rate = 5.0;
        assert!(validate(&cfg).is_ok());
        Ok(())
    }
}
