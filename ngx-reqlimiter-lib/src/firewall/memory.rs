use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{Family, FirewallError, PacketFilter, RuleSpec, FILTER_TABLE};

type Chains = BTreeMap<(String, String), Vec<RuleSpec>>;

/// In-memory [`PacketFilter`] with iptables semantics.
///
/// Clones share the same tables, so a clone kept aside observes every rule
/// the enforcer installs. Used for `dry_run` and as the kernel stand-in in
/// tests.
#[derive(Debug, Clone)]
pub struct MemoryFilter {
    family: Family,
    chains: Arc<Mutex<Chains>>,
    failing: Arc<AtomicBool>,
}

impl MemoryFilter {
    /// Empty `filter` table with the built-in chains.
    pub fn new(family: Family) -> Self {
        let mut chains = Chains::new();
        for builtin in ["INPUT", "FORWARD", "OUTPUT"] {
            chains.insert((FILTER_TABLE.to_string(), builtin.to_string()), Vec::new());
        }
        Self {
            family,
            chains: Arc::new(Mutex::new(chains)),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every following operation fail, as a missing privilege would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), FirewallError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(FirewallError::Unavailable(format!(
                "{} filter rejected the operation",
                self.family
            )));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Chains> {
        match self.chains.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn key(table: &str, chain: &str) -> (String, String) {
    (table.to_string(), chain.to_string())
}

fn no_such_chain(table: &str, chain: &str) -> FirewallError {
    FirewallError::NoSuchChain { table: table.to_string(), chain: chain.to_string() }
}

#[async_trait]
impl PacketFilter for MemoryFilter {
    fn family(&self) -> Family {
        self.family
    }

    async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, FirewallError> {
        self.check_available()?;
        Ok(self.lock().contains_key(&key(table, chain)))
    }

    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError> {
        self.check_available()?;
        let mut chains = self.lock();
        if chains.contains_key(&key(table, chain)) {
            return Err(FirewallError::ChainExists {
                table: table.to_string(),
                chain: chain.to_string(),
            });
        }
        chains.insert(key(table, chain), Vec::new());
        Ok(())
    }

    async fn clear_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError> {
        self.check_available()?;
        self.lock()
            .get_mut(&key(table, chain))
            .map(Vec::clear)
            .ok_or_else(|| no_such_chain(table, chain))
    }

    async fn rule_exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool, FirewallError> {
        self.check_available()?;
        self.lock()
            .get(&key(table, chain))
            .map(|rules| rules.iter().any(|existing| existing.as_slice() == rule))
            .ok_or_else(|| no_such_chain(table, chain))
    }

    async fn append(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), FirewallError> {
        self.check_available()?;
        self.lock()
            .get_mut(&key(table, chain))
            .map(|rules| rules.push(rule.to_vec()))
            .ok_or_else(|| no_such_chain(table, chain))
    }

    async fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<RuleSpec>, FirewallError> {
        self.check_available()?;
        self.lock()
            .get(&key(table, chain))
            .cloned()
            .ok_or_else(|| no_such_chain(table, chain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(args: &[&str]) -> RuleSpec {
        args.iter().map(|a| (*a).to_string()).collect()
    }

    #[tokio::test]
    async fn test_builtin_chains_exist() -> Result<(), FirewallError> {
        let filter = MemoryFilter::new(Family::Ipv4);
        assert!(filter.chain_exists(FILTER_TABLE, "INPUT").await?);
        assert!(!filter.chain_exists(FILTER_TABLE, "NGX-REQLIMITER").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_new_chain_twice_fails() -> Result<(), FirewallError> {
        let filter = MemoryFilter::new(Family::Ipv4);
        filter.new_chain(FILTER_TABLE, "TEST").await?;
        assert!(matches!(
            filter.new_chain(FILTER_TABLE, "TEST").await,
            Err(FirewallError::ChainExists { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_append_unique() -> Result<(), FirewallError> {
        let filter = MemoryFilter::new(Family::Ipv4);
        let jump = rule(&["-j", "TEST"]);

        assert!(filter.append_unique(FILTER_TABLE, "INPUT", &jump).await?);
        assert!(!filter.append_unique(FILTER_TABLE, "INPUT", &jump).await?);
        assert_eq!(filter.list_rules(FILTER_TABLE, "INPUT").await?, vec![jump]);
        Ok(())
    }

    #[tokio::test]
    async fn test_clones_share_state() -> Result<(), FirewallError> {
        let filter = MemoryFilter::new(Family::Ipv6);
        let observer = filter.clone();
        filter.append(FILTER_TABLE, "INPUT", &rule(&["-j", "DROP"])).await?;
        assert_eq!(observer.list_rules(FILTER_TABLE, "INPUT").await?.len(), 1);

        filter.clear_chain(FILTER_TABLE, "INPUT").await?;
        assert!(observer.list_rules(FILTER_TABLE, "INPUT").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_chain_errors() {
        let filter = MemoryFilter::new(Family::Ipv4);
        assert!(matches!(
            filter.append(FILTER_TABLE, "MISSING", &rule(&["-j", "DROP"])).await,
            Err(FirewallError::NoSuchChain { .. })
        ));
        assert!(filter.clear_chain(FILTER_TABLE, "MISSING").await.is_err());
    }

    #[tokio::test]
    async fn test_failing_filter() {
        let filter = MemoryFilter::new(Family::Ipv4);
        filter.set_failing(true);
        assert!(matches!(
            filter.chain_exists(FILTER_TABLE, "INPUT").await,
            Err(FirewallError::Unavailable(_))
        ));
        filter.set_failing(false);
        assert!(filter.chain_exists(FILTER_TABLE, "INPUT").await.is_ok());
    }
}
