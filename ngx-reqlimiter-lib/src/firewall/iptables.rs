use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{Family, FirewallError, PacketFilter, RuleSpec};

/// Seconds `-w` waits for the xtables lock held by another tool.
const LOCK_WAIT_SECS: u64 = 2;

/// Upper bound for one invocation, lock wait included.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// [`PacketFilter`] driving the `iptables`/`ip6tables` binaries.
///
/// Every rule operation passes `-w <secs>`, so a concurrent rule update by
/// another tool delays the call briefly instead of failing it. Each invocation
/// is also bounded by a timeout; a child that outlives it is killed and the
/// call fails with [`FirewallError::TimedOut`].
#[derive(Debug, Clone)]
pub struct IptablesCli {
    family: Family,
    command: String,
    timeout: Duration,
}

impl IptablesCli {
    /// Locate the family's binary and make sure it answers.
    ///
    /// Fails when the binary is missing or unusable, which is fatal at startup.
    pub async fn new(family: Family) -> Result<Self, FirewallError> {
        Self::with_command(family, family.command()).await
    }

    /// Use a specific binary (e.g. `iptables-legacy`).
    pub async fn with_command(family: Family, command: &str) -> Result<Self, FirewallError> {
        let cli = Self { family, command: command.to_string(), timeout: DEFAULT_COMMAND_TIMEOUT };
        let output = cli.exec(&["--version"]).await?;
        if !output.status.success() {
            return Err(cli.failure(&["--version"], &output));
        }
        let version = String::from_utf8_lossy(&output.stdout);
        debug!(family = %family, version = version.trim(), "packet filter available");
        Ok(cli)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn exec(&self, args: &[&str]) -> Result<Output, FirewallError> {
        let child = Command::new(&self.command)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, child).await {
            Ok(output) => output.map_err(|source| FirewallError::Spawn { command: self.command.clone(), source }),
            Err(_) => Err(FirewallError::TimedOut {
                command: self.command.clone(),
                args: args.join(" "),
                after: self.timeout,
            }),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Output, FirewallError> {
        let lock_wait = LOCK_WAIT_SECS.to_string();
        let mut full = vec!["-w", lock_wait.as_str()];
        full.extend_from_slice(args);
        self.exec(&full).await
    }

    async fn run_checked(&self, args: &[&str]) -> Result<String, FirewallError> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(self.failure(args, &output))
        }
    }

    fn failure(&self, args: &[&str], output: &Output) -> FirewallError {
        FirewallError::CommandFailed {
            command: self.command.clone(),
            args: args.join(" "),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

/// `-t <table> <op> <chain> <rule...>`
fn rule_args<'a>(table: &'a str, op: &'a str, chain: &'a str, rule: &'a [String]) -> Vec<&'a str> {
    let mut args = vec!["-t", table, op, chain];
    args.extend(rule.iter().map(String::as_str));
    args
}

/// Chain names declared in `iptables -S` output (`-P` built-ins, `-N` user chains).
fn declared_chains(listing: &str) -> impl Iterator<Item = &str> {
    listing.lines().filter_map(|line| {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("-P") | Some("-N") => parts.next(),
            _ => None,
        }
    })
}

/// Rules appended to `chain` in `iptables -S <chain>` output.
fn appended_rules(listing: &str, chain: &str) -> Vec<RuleSpec> {
    listing
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            if parts.next() != Some("-A") || parts.next() != Some(chain) {
                return None;
            }
            Some(parts.map(str::to_string).collect())
        })
        .collect()
}

#[async_trait]
impl PacketFilter for IptablesCli {
    fn family(&self) -> Family {
        self.family
    }

    async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, FirewallError> {
        let listing = self.run_checked(&["-t", table, "-S"]).await?;
        let exists = declared_chains(&listing).any(|name| name == chain);
        Ok(exists)
    }

    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError> {
        self.run_checked(&["-t", table, "-N", chain]).await.map(|_| ())
    }

    async fn clear_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError> {
        self.run_checked(&["-t", table, "-F", chain]).await.map(|_| ())
    }

    async fn rule_exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool, FirewallError> {
        let args = rule_args(table, "-C", chain, rule);
        let output = self.run(&args).await?;
        // -C exits 1 when no matching rule exists; anything else is a real failure.
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(self.failure(&args, &output)),
        }
    }

    async fn append(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), FirewallError> {
        self.run_checked(&rule_args(table, "-A", chain, rule)).await.map(|_| ())
    }

    async fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<RuleSpec>, FirewallError> {
        let listing = self.run_checked(&["-t", table, "-S", chain]).await?;
        Ok(appended_rules(&listing, chain))
    }
}
