use std::net::IpAddr;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::{
    BanEvent, Family, FirewallError, IptablesCli, MemoryFilter, PacketFilter, RuleSpec,
    FILTER_TABLE, INPUT_CHAIN, MANAGED_CHAIN,
};
use crate::config::Config;

/// Lifecycle of one managed chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Unprovisioned,
    Provisioned,
    TornDown,
}

/// Result of a ban attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanOutcome {
    /// At least one of the two drop rules was newly installed.
    Added,
    /// Both rules were already present.
    AlreadyBanned,
    /// At least one rule could not be installed; the next denial retries.
    Failed,
}

/// The managed chain of one protocol family.
pub struct FirewallChain {
    filter: Box<dyn PacketFilter>,
    state: ChainState,
    jump_installed: bool,
}

impl FirewallChain {
    pub fn new(filter: Box<dyn PacketFilter>) -> Self {
        Self { filter, state: ChainState::Unprovisioned, jump_installed: false }
    }

    pub fn family(&self) -> Family {
        self.filter.family()
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn jump_installed(&self) -> bool {
        self.jump_installed
    }

    /// Bring the chain to a clean, provisioned state.
    ///
    /// Tolerates a chain left behind by an earlier run (it is cleared) and an
    /// already present jump rule (it is not duplicated), so it may run any
    /// number of times.
    pub async fn setup(&mut self) -> Result<(), FirewallError> {
        let family = self.family();

        if self.filter.chain_exists(FILTER_TABLE, MANAGED_CHAIN).await? {
            self.filter.clear_chain(FILTER_TABLE, MANAGED_CHAIN).await?;
            info!(%family, chain = MANAGED_CHAIN, "managed chain already present, cleared");
        } else {
            self.filter.new_chain(FILTER_TABLE, MANAGED_CHAIN).await?;
            info!(%family, chain = MANAGED_CHAIN, "managed chain created");
        }

        let added = self.filter.append_unique(FILTER_TABLE, INPUT_CHAIN, &jump_rule()).await?;
        if added {
            debug!(%family, "jump from {INPUT_CHAIN} installed");
        }
        self.jump_installed = true;
        self.state = ChainState::Provisioned;
        Ok(())
    }

    /// Install both drop rules of `event`, each only if absent.
    ///
    /// Both rules are always attempted; a failure of one is logged and does
    /// not prevent the other.
    pub async fn ban(&mut self, event: &BanEvent) -> BanOutcome {
        let family = self.family();
        if self.state != ChainState::Provisioned {
            error!(address = %event.address, %family, state = ?self.state, "cannot ban, chain not provisioned");
            return BanOutcome::Failed;
        }

        let mut added = false;
        let mut failed = false;
        for rule in event.rules() {
            match self.filter.append_unique(FILTER_TABLE, MANAGED_CHAIN, &rule).await {
                Ok(true) => added = true,
                Ok(false) => {}
                Err(e) => {
                    error!(address = %event.address, %family, rule = %rule.join(" "), error = %e, "failed to install drop rule");
                    failed = true;
                }
            }
        }

        match (failed, added) {
            (true, _) => BanOutcome::Failed,
            (false, true) => BanOutcome::Added,
            (false, false) => BanOutcome::AlreadyBanned,
        }
    }

    /// Clear every rule of the managed chain, keeping the chain and the jump.
    pub async fn teardown(&mut self) -> Result<(), FirewallError> {
        if self.state != ChainState::Provisioned {
            return Ok(());
        }
        self.state = ChainState::TornDown;
        self.filter.clear_chain(FILTER_TABLE, MANAGED_CHAIN).await
    }

    pub async fn rules(&self) -> Result<Vec<RuleSpec>, FirewallError> {
        self.filter.list_rules(FILTER_TABLE, MANAGED_CHAIN).await
    }
}

fn jump_rule() -> RuleSpec {
    vec!["-j".to_string(), MANAGED_CHAIN.to_string()]
}

/// Per-family enforcement: IPv4 always, IPv6 when enabled.
///
/// Each chain sits behind its own async lock, so bans may be issued
/// concurrently and a teardown waits for an in-flight insertion to finish.
pub struct Enforcer {
    ipv4: Mutex<FirewallChain>,
    ipv6: Option<Mutex<FirewallChain>>,
    ports: String,
}

impl Enforcer {
    /// `ports` is the multiport list the drop rules cover, e.g. `80,443`.
    pub fn new(
        ipv4: Box<dyn PacketFilter>,
        ipv6: Option<Box<dyn PacketFilter>>,
        ports: impl Into<String>,
    ) -> Self {
        Self {
            ipv4: Mutex::new(FirewallChain::new(ipv4)),
            ipv6: ipv6.map(|filter| Mutex::new(FirewallChain::new(filter))),
            ports: ports.into(),
        }
    }

    /// Build the packet-filter handles the configuration asks for.
    ///
    /// `dry_run` selects in-memory filters; otherwise the iptables binaries
    /// must be present or this fails.
    pub async fn from_config(config: &Config) -> Result<Self, FirewallError> {
        async fn build(family: Family, dry_run: bool) -> Result<Box<dyn PacketFilter>, FirewallError> {
            if dry_run {
                Ok(Box::new(MemoryFilter::new(family)))
            } else {
                Ok(Box::new(IptablesCli::new(family).await?))
            }
        }

        let ipv4 = build(Family::Ipv4, config.dry_run).await?;
        let ipv6 = if config.ipv6 { Some(build(Family::Ipv6, config.dry_run).await?) } else { None };
        Ok(Self::new(ipv4, ipv6, config.ports_spec()))
    }

    pub fn families(&self) -> Vec<Family> {
        let mut families = vec![Family::Ipv4];
        if self.ipv6.is_some() {
            families.push(Family::Ipv6);
        }
        families
    }

    pub fn ports(&self) -> &str {
        &self.ports
    }

    /// Provision every enabled family. Any failure is fatal to startup.
    pub async fn setup(&self) -> Result<(), FirewallError> {
        for family in self.families() {
            if let Some(mut chain) = self.chain(family).await {
                chain.setup().await?;
            }
        }
        Ok(())
    }

    /// Ban `address` through the chain of its family.
    pub async fn ban(&self, address: IpAddr) -> BanOutcome {
        let event = BanEvent::new(address, self.ports.clone());
        let family = event.family();
        match self.chain(family).await {
            Some(mut chain) => chain.ban(&event).await,
            None => {
                warn!(%address, %family, "ban skipped, {family} enforcement is disabled");
                BanOutcome::Failed
            }
        }
    }

    /// Clear every provisioned chain. Failures are logged, never escalated.
    pub async fn teardown(&self) {
        for family in self.families() {
            let Some(mut chain) = self.chain(family).await else {
                continue;
            };
            match chain.teardown().await {
                Ok(()) => info!(%family, chain = MANAGED_CHAIN, "managed chain cleared"),
                Err(e) => error!(%family, chain = MANAGED_CHAIN, error = %e, "failed to clear managed chain"),
            }
        }
    }

    pub async fn state(&self, family: Family) -> Option<ChainState> {
        Some(self.chain(family).await?.state())
    }

    pub async fn rules(&self, family: Family) -> Result<Vec<RuleSpec>, FirewallError> {
        match self.chain(family).await {
            Some(chain) => chain.rules().await,
            None => Err(FirewallError::NotProvisioned { family }),
        }
    }

    async fn chain(&self, family: Family) -> Option<MutexGuard<'_, FirewallChain>> {
        let chain = match family {
            Family::Ipv4 => Some(&self.ipv4),
            Family::Ipv6 => self.ipv6.as_ref(),
        }?;
        Some(chain.lock().await)
    }
}
