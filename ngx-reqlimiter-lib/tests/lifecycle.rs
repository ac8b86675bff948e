use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ngx_reqlimiter_lib::decision::Decision;
use ngx_reqlimiter_lib::firewall::{
    BanOutcome, ChainState, Enforcer, Family, IptablesCli, MemoryFilter, PacketFilter, FILTER_TABLE,
    MANAGED_CHAIN,
};
use ngx_reqlimiter_lib::telemetry::Metrics;
use ngx_reqlimiter_lib::{Config, Controller, DecisionLoop, LogRecord, RateLedger};
use tempfile::TempDir;
use tokio::net::UnixDatagram;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};

type TestResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

const OFFENDER_LINE: &str = "10.0.0.5 - - \"GET / HTTP/1.1\" 200";

fn strict_config() -> Config {
    Config { rate: 1.0, burst: 1, dry_run: true, ..Config::default() }
}

async fn wait_for_rules(enforcer: &Enforcer, expected: usize) -> TestResult {
    for _ in 0..100 {
        if enforcer.rules(Family::Ipv4).await?.len() == expected {
            return Ok(());
        }
        sleep(Duration::from_millis(20)).await;
    }
    Err(format!("chain never reached {expected} rules").into())
}

/// Shell script standing in for iptables: checking a rule in the managed
/// chain hangs, everything else succeeds silently.
fn iptables_hanging_on_ban(dir: &Path) -> std::io::Result<PathBuf> {
    let path = dir.join("iptables");
    std::fs::write(
        &path,
        format!("#!/bin/sh\ncase \"$*\" in\n  *\"-C {MANAGED_CHAIN} \"*) exec sleep 30 ;;\nesac\nexit 0\n"),
    )?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

fn assert_offender_rules(rules: &[Vec<String>]) {
    let rendered: Vec<String> = rules.iter().map(|rule| rule.join(" ")).collect();
    assert_eq!(
        rendered,
        vec![
            "-s 10.0.0.5 -p tcp -m multiport --dports 80,443 -j DROP".to_string(),
            "-s 10.0.0.5 -p udp -m multiport --dports 80,443 -j DROP".to_string(),
        ]
    );
}

#[tokio::test]
async fn burst_of_five_allows_one_and_denies_four() -> TestResult {
    let filter = MemoryFilter::new(Family::Ipv4);
    let enforcer = Enforcer::new(Box::new(filter.clone()), None, "80,443");
    enforcer.setup().await?;
    let decisions = DecisionLoop::new(
        Arc::new(RateLedger::new(1.0, 1)),
        Arc::new(enforcer),
        Arc::new(Metrics::default()),
    );

    let record = LogRecord::from_content(OFFENDER_LINE);
    let now = Instant::now();
    let mut outcomes = Vec::new();
    for _ in 0..5 {
        outcomes.push(decisions.process_at(&record, now).await);
    }

    let allowed = outcomes.iter().filter(|d| **d == Decision::Allowed).count();
    let denied = outcomes.iter().filter(|d| matches!(d, Decision::Denied(_))).count();
    assert_eq!((allowed, denied), (1, 4));
    assert_eq!(outcomes.get(1), Some(&Decision::Denied(BanOutcome::Added)));
    assert!(outcomes
        .iter()
        .skip(2)
        .all(|d| *d == Decision::Denied(BanOutcome::AlreadyBanned)));

    assert_eq!(decisions.ledger().len(), 1);
    assert_offender_rules(&filter.list_rules(FILTER_TABLE, MANAGED_CHAIN).await?);
    Ok(())
}

#[tokio::test]
async fn repeated_offender_is_banned_once() -> TestResult {
    let filter = MemoryFilter::new(Family::Ipv4);
    let enforcer = Enforcer::new(Box::new(filter.clone()), None, "80,443");
    let controller = Controller::new(strict_config(), enforcer).await?;
    let enforcer = Arc::clone(controller.enforcer());
    let ledger = Arc::clone(controller.ledger());

    let (records, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(controller.run_with(rx, shutdown_rx));

    for _ in 0..5 {
        records.send(LogRecord::from_content(OFFENDER_LINE))?;
    }
    wait_for_rules(&enforcer, 2).await?;
    assert_eq!(ledger.len(), 1);
    assert_offender_rules(&enforcer.rules(Family::Ipv4).await?);

    shutdown_tx.send(true)?;
    timeout(Duration::from_secs(2), running).await???;

    assert_eq!(enforcer.state(Family::Ipv4).await, Some(ChainState::TornDown));
    assert!(filter.chain_exists(FILTER_TABLE, MANAGED_CHAIN).await?);
    assert!(filter.list_rules(FILTER_TABLE, MANAGED_CHAIN).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn closed_record_stream_tears_down() -> TestResult {
    let filter = MemoryFilter::new(Family::Ipv4);
    let enforcer = Enforcer::new(Box::new(filter.clone()), None, "80,443");
    let controller = Controller::new(strict_config(), enforcer).await?;

    let (records, rx) = mpsc::unbounded_channel();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    records.send(LogRecord::from_content("10.0.0.8 GET /"))?;
    records.send(LogRecord::from_content("10.0.0.8 GET /"))?;
    drop(records);

    timeout(Duration::from_secs(2), controller.run_with(rx, shutdown_rx)).await??;
    assert!(filter.list_rules(FILTER_TABLE, MANAGED_CHAIN).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn provisioning_failure_is_fatal() {
    let filter = MemoryFilter::new(Family::Ipv4);
    filter.set_failing(true);
    let enforcer = Enforcer::new(Box::new(filter), None, "80,443");
    assert!(Controller::new(strict_config(), enforcer).await.is_err());
}

#[tokio::test]
async fn shutdown_is_bounded_when_iptables_hangs() -> TestResult {
    let dir = TempDir::new()?;
    let binary = iptables_hanging_on_ban(dir.path())?;
    let cli = IptablesCli::with_command(Family::Ipv4, &binary.to_string_lossy()).await?;
    let enforcer = Enforcer::new(Box::new(cli), None, "80,443");
    let config = Config { rate: 1.0, burst: 1, ..Config::default() };
    let controller = Controller::new(config, enforcer).await?;

    let (records, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(controller.run_with(rx, shutdown_rx));

    // The second record is denied and its ban blocks on the hanging `-C`.
    records.send(LogRecord::from_content("10.0.0.5 GET /"))?;
    records.send(LogRecord::from_content("10.0.0.5 GET /"))?;
    sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    shutdown_tx.send(true)?;
    timeout(Duration::from_secs(5), running).await???;
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[tokio::test]
async fn dry_run_shutdown_over_unix_socket() -> TestResult {
    let dir = TempDir::new()?;
    let socket = dir.path().join("limiter.sock");
    let mut config = strict_config();
    config.ingest.listen = SocketAddr::from(([127, 0, 0, 1], 0));
    config.ingest.unix_socket = socket.clone();
    config.ingest.unix_only = true;

    let controller = Controller::from_config(config).await?;
    let enforcer = Arc::clone(controller.enforcer());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(controller.run(shutdown_rx));

    for _ in 0..50 {
        if socket.exists() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    let client = UnixDatagram::unbound()?;
    for _ in 0..5 {
        client
            .send_to(b"<190>Oct 16 12:00:00 web-1 limiter: 10.0.0.5 - - \"GET / HTTP/1.1\" 200", &socket)
            .await?;
    }
    wait_for_rules(&enforcer, 2).await?;
    assert_offender_rules(&enforcer.rules(Family::Ipv4).await?);

    shutdown_tx.send(true)?;
    timeout(Duration::from_secs(2), running).await???;

    assert!(enforcer.rules(Family::Ipv4).await?.is_empty());
    assert!(!socket.exists());
    Ok(())
}
