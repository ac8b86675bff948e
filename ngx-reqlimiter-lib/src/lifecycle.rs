use std::sync::Arc;
use std::time::{Duration, Instant};

use prometheus::Registry;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::decision::DecisionLoop;
use crate::error::Result;
use crate::firewall::Enforcer;
use crate::ingest::{IngestServer, LogRecord};
use crate::security::RateLedger;
use crate::telemetry::{start_observability_server, Metrics};

/// Upper bound between two idle sweeps of the rate ledger
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How long shutdown waits for the record in hand before abandoning it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Wires startup, the decision loop and shutdown together.
///
/// Construction provisions the firewall; a failure there is returned before
/// any record is read. [`Controller::run`] then ingests until the shutdown
/// channel flips to `true`, stops ingestion and clears the managed chains.
pub struct Controller {
    config: Config,
    ledger: Arc<RateLedger>,
    enforcer: Arc<Enforcer>,
    metrics: Arc<Metrics>,
    registry: Option<Registry>,
}

impl Controller {
    /// Build the ledger and the packet-filter handles from `config`, then
    /// provision every enabled family.
    pub async fn from_config(config: Config) -> Result<Self> {
        let enforcer = Enforcer::from_config(&config).await?;
        Self::new(config, enforcer).await
    }

    /// Provision `enforcer` and take ownership of it.
    pub async fn new(config: Config, enforcer: Enforcer) -> Result<Self> {
        enforcer.setup().await?;
        info!(families = ?enforcer.families(), ports = enforcer.ports(), dry_run = config.dry_run, "firewall provisioned");

        let ledger = Arc::new(RateLedger::with_limits(config.rate, config.burst, &config.ledger));
        Ok(Self {
            config,
            ledger,
            enforcer: Arc::new(enforcer),
            metrics: Arc::new(Metrics::default()),
            registry: None,
        })
    }

    /// Use `metrics` and serve `registry` on `telemetry.metrics_port`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>, registry: Registry) -> Self {
        self.metrics = metrics;
        self.registry = Some(registry);
        self
    }

    pub fn ledger(&self) -> &Arc<RateLedger> {
        &self.ledger
    }

    pub fn enforcer(&self) -> &Arc<Enforcer> {
        &self.enforcer
    }

    /// Start the syslog listeners and run until shutdown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let (ingest, records) = match IngestServer::start(&self.config.ingest).await {
            Ok(started) => started,
            Err(e) => {
                error!(error = %e, "failed to start syslog ingestion");
                self.enforcer.teardown().await;
                return Err(e.into());
            }
        };
        self.supervise(records, shutdown, Some(ingest)).await;
        Ok(())
    }

    /// Run against an already established record stream.
    pub async fn run_with(
        self,
        records: mpsc::UnboundedReceiver<LogRecord>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.supervise(records, shutdown, None).await;
        Ok(())
    }

    async fn supervise(
        self,
        records: mpsc::UnboundedReceiver<LogRecord>,
        mut shutdown: watch::Receiver<bool>,
        mut ingest: Option<IngestServer>,
    ) {
        info!(rate = self.config.rate, burst = self.config.burst, "ReqLimiter is starting");

        let decisions = DecisionLoop::new(self.ledger.clone(), self.enforcer.clone(), self.metrics.clone())
            .with_allowlist(self.config.allowlist.clone());
        let mut decision_task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { decisions.run(records, shutdown).await }
        });

        let sweeper = self.spawn_sweeper();
        let observability = self.spawn_observability(shutdown.clone());

        let mut decision_finished = false;
        loop {
            tokio::select! {
                biased;
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("ReqLimiter stopped, clearing managed chains");
                        break;
                    }
                }
                _ = &mut decision_task => {
                    warn!("record stream ended, shutting down");
                    decision_finished = true;
                    break;
                }
            }
        }

        if let Some(server) = ingest.as_mut() {
            server.kill();
        }
        if !decision_finished {
            // The loop sees the same shutdown signal and stops after the
            // record in hand. A ban stuck in the packet filter is abandoned.
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut decision_task).await.is_err() {
                warn!(grace = ?SHUTDOWN_GRACE, "decision loop did not stop in time, aborting it");
                decision_task.abort();
                let _ = decision_task.await;
            }
        }
        if let Some(task) = sweeper {
            task.abort();
        }
        self.enforcer.teardown().await;
        if let Some(task) = observability {
            task.abort();
        }
    }

    fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        let idle_timeout = self.config.ledger.idle_timeout()?;
        let period = idle_timeout.min(MAX_SWEEP_INTERVAL);
        let ledger = self.ledger.clone();
        let metrics = self.metrics.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = ledger.evict_idle(Instant::now());
                metrics.record_evictions(evicted as u64);
            }
        }))
    }

    fn spawn_observability(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let port = self.config.telemetry.metrics_port?;
        let registry = self.registry.clone()?;
        Some(tokio::spawn(async move {
            if let Err(e) = start_observability_server(port, registry, shutdown).await {
                error!(error = %e, "observability server failed");
            }
        }))
    }
}
