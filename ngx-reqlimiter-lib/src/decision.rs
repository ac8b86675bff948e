use std::sync::Arc;
use std::time::Instant;

use ipnet::IpNet;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::firewall::{BanOutcome, Enforcer};
use crate::ingest::LogRecord;
use crate::security::{classify, is_allowlisted, RateLedger};
use crate::telemetry::metrics::{values, Metrics};

/// Why a record never reached the rate ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No address token in the record content.
    Malformed,
    /// The leading token is not an IP address.
    InvalidAddress,
    /// The address belongs to an allowlisted network.
    Allowlisted,
}

/// What the loop did with one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skipped(SkipReason),
    Allowed,
    Denied(BanOutcome),
}

/// Consumer of the record stream: extract, classify, account, enforce.
///
/// Records are handled strictly in arrival order. Nothing in here is fatal:
/// bad records are skipped and enforcement failures are logged, so one
/// record can never stop ingestion.
pub struct DecisionLoop {
    ledger: Arc<RateLedger>,
    enforcer: Arc<Enforcer>,
    allowlist: Vec<IpNet>,
    metrics: Arc<Metrics>,
}

impl DecisionLoop {
    pub fn new(ledger: Arc<RateLedger>, enforcer: Arc<Enforcer>, metrics: Arc<Metrics>) -> Self {
        Self { ledger, enforcer, allowlist: Vec::new(), metrics }
    }

    pub fn with_allowlist(mut self, allowlist: Vec<IpNet>) -> Self {
        self.allowlist = allowlist;
        self
    }

    /// Process records until the stream closes or `shutdown` flips.
    ///
    /// Shutdown is only observed between two records, so the record in hand
    /// is always finished.
    pub async fn run(
        &self,
        mut records: mpsc::UnboundedReceiver<LogRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let record = tokio::select! {
                biased;
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        debug!("shutdown requested, decision loop finished");
                        return;
                    }
                    continue;
                }
                record = records.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };
            self.process(&record).await;
        }
        info!("record stream closed, decision loop finished");
    }

    pub async fn process(&self, record: &LogRecord) -> Decision {
        self.process_at(record, Instant::now()).await
    }

    /// [`DecisionLoop::process`] against an explicit instant.
    pub async fn process_at(&self, record: &LogRecord, now: Instant) -> Decision {
        self.metrics.record_received();

        let Some(token) = record.address() else {
            debug!(from = ?record.received_from, "record without address token, skipping");
            self.metrics.record_skipped(values::SKIP_MALFORMED);
            return Decision::Skipped(SkipReason::Malformed);
        };

        let class = classify(token);
        let Some((ip, family)) = class.ip().zip(class.family()) else {
            warn!(token, "not an IP address, skipping record");
            self.metrics.record_skipped(values::SKIP_INVALID_ADDRESS);
            return Decision::Skipped(SkipReason::InvalidAddress);
        };

        if is_allowlisted(ip, &self.allowlist) {
            self.metrics.record_skipped(values::SKIP_ALLOWLISTED);
            return Decision::Skipped(SkipReason::Allowlisted);
        }

        let evictions_before = self.ledger.evictions();
        let allowed = self.ledger.check_at(&ip.to_string(), now);
        self.metrics
            .record_evictions(self.ledger.evictions().saturating_sub(evictions_before));
        self.metrics.record_decision(allowed);
        if allowed {
            return Decision::Allowed;
        }

        let outcome = self.enforcer.ban(ip).await;
        match outcome {
            BanOutcome::Added => {
                warn!(address = %ip, %family, "Too many requests, banned");
                self.metrics.record_ban(family);
            }
            BanOutcome::AlreadyBanned => {
                debug!(address = %ip, %family, "Too many requests, already banned");
            }
            BanOutcome::Failed => {
                error!(address = %ip, %family, "failed to ban");
                self.metrics.record_ban_failure(family);
            }
        }
        Decision::Denied(outcome)
    }

    pub fn ledger(&self) -> &Arc<RateLedger> {
        &self.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{Family, FirewallError, MemoryFilter, PacketFilter, FILTER_TABLE, MANAGED_CHAIN};

    async fn setup(rate: f64, burst: u32) -> Result<(DecisionLoop, MemoryFilter), FirewallError> {
        let filter = MemoryFilter::new(Family::Ipv4);
        let enforcer = Enforcer::new(Box::new(filter.clone()), None, "80,443");
        enforcer.setup().await?;
        let decisions = DecisionLoop::new(
            Arc::new(RateLedger::new(rate, burst)),
            Arc::new(enforcer),
            Arc::new(Metrics::default()),
        );
        Ok((decisions, filter))
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped() -> Result<(), FirewallError> {
        let (decisions, _) = setup(1.0, 1).await?;
        assert_eq!(
            decisions.process(&LogRecord::from_content("")).await,
            Decision::Skipped(SkipReason::Malformed)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_address_never_reaches_ledger() -> Result<(), FirewallError> {
        let (decisions, filter) = setup(1.0, 1).await?;
        let now = Instant::now();
        for _ in 0..3 {
            assert_eq!(
                decisions.process_at(&LogRecord::from_content("not-an-ip GET /"), now).await,
                Decision::Skipped(SkipReason::InvalidAddress)
            );
        }
        assert!(decisions.ledger().is_empty());
        assert!(filter.list_rules(FILTER_TABLE, MANAGED_CHAIN).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_allowlisted_address_is_never_banned() -> Result<(), FirewallError> {
        let (decisions, filter) = setup(1.0, 1).await?;
        let decisions = decisions.with_allowlist(vec!["127.0.0.0/8".parse::<IpNet>().map_err(|_| {
            FirewallError::Unavailable("bad test network".into())
        })?]);
        let now = Instant::now();
        for _ in 0..5 {
            assert_eq!(
                decisions.process_at(&LogRecord::from_content("127.0.0.1 GET /"), now).await,
                Decision::Skipped(SkipReason::Allowlisted)
            );
        }
        assert!(filter.list_rules(FILTER_TABLE, MANAGED_CHAIN).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_denial_bans_once() -> Result<(), FirewallError> {
        let (decisions, filter) = setup(1.0, 1).await?;
        let now = Instant::now();
        let record = LogRecord::from_content("10.0.0.5 GET /");

        assert_eq!(decisions.process_at(&record, now).await, Decision::Allowed);
        assert_eq!(decisions.process_at(&record, now).await, Decision::Denied(BanOutcome::Added));
        assert_eq!(
            decisions.process_at(&record, now).await,
            Decision::Denied(BanOutcome::AlreadyBanned)
        );
        assert_eq!(filter.list_rules(FILTER_TABLE, MANAGED_CHAIN).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_ban_failure_does_not_stop_processing() -> Result<(), FirewallError> {
        let (decisions, filter) = setup(1.0, 1).await?;
        let now = Instant::now();
        let record = LogRecord::from_content("10.0.0.6 GET /");
        decisions.process_at(&record, now).await;

        filter.set_failing(true);
        assert_eq!(decisions.process_at(&record, now).await, Decision::Denied(BanOutcome::Failed));

        filter.set_failing(false);
        assert_eq!(decisions.process_at(&record, now).await, Decision::Denied(BanOutcome::Added));
        Ok(())
    }

    #[tokio::test]
    async fn test_ipv6_denial_without_ipv6_enforcement() -> Result<(), FirewallError> {
        let (decisions, _) = setup(1.0, 1).await?;
        let now = Instant::now();
        let record = LogRecord::from_content("2001:db8::1 GET /");
        assert_eq!(decisions.process_at(&record, now).await, Decision::Allowed);
        assert_eq!(decisions.process_at(&record, now).await, Decision::Denied(BanOutcome::Failed));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() -> Result<(), FirewallError> {
        let (decisions, filter) = setup(1.0, 1).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop, shutdown) = watch::channel(false);

        let running = tokio::spawn(async move { decisions.run(rx, shutdown).await });
        for _ in 0..2 {
            let _ = tx.send(LogRecord::from_content("10.0.0.7 GET /"));
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let _ = stop.send(true);

        // The sender is still open, so only the shutdown signal ends the loop.
        let finished = tokio::time::timeout(std::time::Duration::from_secs(2), running).await;
        assert!(finished.is_ok());
        assert_eq!(filter.list_rules(FILTER_TABLE, MANAGED_CHAIN).await?.len(), 2);
        drop(tx);
        Ok(())
    }
}
