//! Packet-filter enforcement.
//!
//! All drop rules live in one product-owned chain (`NGX-REQLIMITER`) of the
//! `filter` table, per protocol family. The built-in `INPUT` chain jumps into
//! it exactly once. On startup the chain is created, or cleared when a
//! previous run left it behind; on shutdown it is cleared but kept, so the
//! jump rule survives and a restart never has to touch `INPUT` again.
//!
//! [`PacketFilter`] is the seam between the enforcer and the kernel:
//! [`IptablesCli`] drives `iptables`/`ip6tables`, [`MemoryFilter`] keeps the
//! same tables in memory for dry runs and tests.

mod ban;
mod enforcer;
mod iptables;
mod memory;

pub use ban::BanEvent;
pub use enforcer::{BanOutcome, ChainState, Enforcer, FirewallChain};
pub use iptables::IptablesCli;
pub use memory::MemoryFilter;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

/// Table holding the managed chain.
pub const FILTER_TABLE: &str = "filter";
/// Product-owned chain receiving every drop rule.
pub const MANAGED_CHAIN: &str = "NGX-REQLIMITER";
/// Built-in chain that jumps into [`MANAGED_CHAIN`].
pub const INPUT_CHAIN: &str = "INPUT";

/// Rule specification as the argument list following `-A <chain>`.
pub type RuleSpec = Vec<String>;

/// Protocol family, one packet-filter handle each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    /// Userspace tool managing this family's rules.
    pub fn command(&self) -> &'static str {
        match self {
            Family::Ipv4 => "iptables",
            Family::Ipv6 => "ip6tables",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Ipv4 => "ipv4",
            Family::Ipv6 => "ipv6",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error("failed to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} {args} did not finish within {after:?}")]
    TimedOut { command: String, args: String, after: Duration },

    #[error("{command} {args} exited with {status}: {stderr}")]
    CommandFailed { command: String, args: String, status: String, stderr: String },

    #[error("chain {table}/{chain} does not exist")]
    NoSuchChain { table: String, chain: String },

    #[error("chain {table}/{chain} already exists")]
    ChainExists { table: String, chain: String },

    #[error("{family} enforcement is not provisioned")]
    NotProvisioned { family: Family },

    #[error("packet filter unavailable: {0}")]
    Unavailable(String),
}

/// Chain-management primitives of a host packet filter.
///
/// Implementations are scoped to one protocol family and must be usable from
/// several tasks; every method takes `&self`. Calls may reach an external
/// process, so they are async and an implementation must bound how long one
/// call can take.
#[async_trait]
pub trait PacketFilter: Send + Sync {
    fn family(&self) -> Family;

    async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, FirewallError>;

    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError>;

    /// Remove every rule from `chain`, keeping the chain itself.
    async fn clear_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError>;

    async fn rule_exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool, FirewallError>;

    async fn append(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), FirewallError>;

    /// Rules of `chain`, in order.
    async fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<RuleSpec>, FirewallError>;

    /// Append `rule` unless an identical rule is already present.
    ///
    /// Returns `true` when the rule was added.
    async fn append_unique(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool, FirewallError> {
        if self.rule_exists(table, chain, rule).await? {
            return Ok(false);
        }
        self.append(table, chain, rule).await?;
        Ok(true)
    }
}
