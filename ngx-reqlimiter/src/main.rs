#![forbid(unsafe_code)]

use clap::Parser;
use ngx_reqlimiter_lib::config::{load_from_path, validate, Config};
use ngx_reqlimiter_lib::telemetry::{init_metrics, init_tracing};
use ngx_reqlimiter_lib::Controller;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Rate-limit nginx clients from their access log and ban offenders with iptables")]
struct Cli {
    /// Path to configuration TOML file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Requests per second allowed per address
    #[arg(short, long)]
    rate: Option<f64>,

    /// Burst capacity per address
    #[arg(short, long)]
    burst: Option<u32>,

    /// Syslog listen address
    #[arg(short, long)]
    ip: Option<IpAddr>,

    /// Syslog listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Only listen on the unix socket
    #[arg(short, long)]
    unix_only: bool,

    /// Unix datagram socket path
    #[arg(long, value_name = "PATH")]
    unix_socket: Option<PathBuf>,

    /// Protected destination ports, e.g. 80,443
    #[arg(long, value_delimiter = ',')]
    ports: Option<Vec<u16>>,

    /// Also enforce through ip6tables
    #[arg(long)]
    ipv6: bool,

    /// Log decisions without touching the kernel firewall
    #[arg(long)]
    dry_run: bool,

    /// Serve /metrics and /health on this port
    #[arg(long)]
    metrics_port: Option<u16>,
}

impl Cli {
    fn apply(self, mut cfg: Config) -> Config {
        if let Some(rate) = self.rate {
            cfg.rate = rate;
        }
        if let Some(burst) = self.burst {
            cfg.burst = burst;
        }
        if let Some(ip) = self.ip {
            cfg.ingest.listen.set_ip(ip);
        }
        if let Some(port) = self.port {
            cfg.ingest.listen.set_port(port);
        }
        if self.unix_only {
            cfg.ingest.unix_only = true;
        }
        if let Some(path) = self.unix_socket {
            cfg.ingest.unix_socket = path;
        }
        if let Some(ports) = self.ports {
            cfg.ports = ports;
        }
        if self.ipv6 {
            cfg.ipv6 = true;
        }
        if self.dry_run {
            cfg.dry_run = true;
        }
        if let Some(port) = self.metrics_port {
            cfg.telemetry.metrics_port = Some(port);
        }
        cfg
    }
}

/// File values first, then command-line overrides; the merged result is
/// validated once.
fn load(cli: Cli) -> Result<Config, Box<dyn std::error::Error + Send + Sync>> {
    let base = match &cli.config {
        Some(path) => load_from_path(path)?,
        None => Config::default(),
    };
    let cfg = cli.apply(base);
    validate(&cfg)?;
    Ok(cfg)
}

#[tokio::main]
async fn main() {
    let cfg = match load(Cli::parse()) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = init_tracing(&cfg.logging) {
        eprintln!("failed to initialize tracing: {err}");
        std::process::exit(1);
    }

    info!(
        rate = cfg.rate,
        burst = cfg.burst,
        ports = %cfg.ports_spec(),
        ipv6 = cfg.ipv6,
        dry_run = cfg.dry_run,
        "configuration loaded"
    );

    let metrics = if cfg.telemetry.metrics_port.is_some() {
        match init_metrics() {
            Ok(pair) => Some(pair),
            Err(err) => {
                error!(%err, "failed to initialize metrics");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let controller = match Controller::from_config(cfg).await {
        Ok(controller) => controller,
        Err(err) => {
            error!(%err, "failed to provision firewall");
            std::process::exit(1);
        }
    };
    let controller = match metrics {
        Some((metrics, registry)) => controller.with_metrics(metrics, registry),
        None => controller,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(err) = spawn_signal_handler(shutdown_tx) {
        error!(%err, "failed to install signal handlers");
        controller.enforcer().teardown().await;
        std::process::exit(1);
    }

    if let Err(err) = controller.run(shutdown_rx).await {
        error!(%err, "ReqLimiter exited with error");
        std::process::exit(1);
    }
}

fn spawn_signal_handler(shutdown: watch::Sender<bool>) -> std::io::Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        let _ = shutdown.send(true);
    });
    Ok(())
}
