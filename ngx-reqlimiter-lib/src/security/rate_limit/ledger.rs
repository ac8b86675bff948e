use ahash::AHashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::TokenBucket;
use crate::config::LedgerConfig;

/// Mapping from source address to its token bucket.
///
/// Lookup-or-create and the admission check happen under one lock, so there
/// is at most one bucket per address and concurrent checks for the same
/// address never lose an update. The ledger is safe to share between any
/// number of decision loops behind an `Arc`.
///
/// Eviction policy:
/// - an entry idle for longer than `idle_timeout` is dropped by
///   [`RateLedger::evict_idle`] and by the sweep that runs when the ledger is
///   full;
/// - when a new address arrives and the ledger still holds `max_entries`
///   after that sweep, the least recently seen entry is dropped.
///
/// Entries are also indexed by last-seen instant, so both evictions only
/// touch the entries they remove (`O(log n)` each) instead of scanning the map.
pub struct RateLedger {
    rate: f64,
    burst: u32,
    max_entries: usize,
    idle_timeout: Option<Duration>,
    entries: Mutex<Entries>,
    evictions: AtomicU64,
}

#[derive(Default)]
struct Entries {
    buckets: AHashMap<String, TokenBucket>,
    /// `(last seen, address)`, oldest first
    recency: BTreeSet<(Instant, String)>,
}

impl Entries {
    /// Check an existing bucket; `None` when `address` is unknown.
    fn check(&mut self, address: &str, now: Instant) -> Option<bool> {
        let bucket = self.buckets.get_mut(address)?;
        let before = bucket.last_seen();
        let allowed = bucket.allow_at(now);
        let after = bucket.last_seen();
        if after != before {
            self.recency.remove(&(before, address.to_owned()));
            self.recency.insert((after, address.to_owned()));
        }
        Some(allowed)
    }

    fn insert(&mut self, address: &str, bucket: TokenBucket) {
        self.recency.insert((bucket.last_seen(), address.to_owned()));
        self.buckets.insert(address.to_owned(), bucket);
    }

    fn oldest_seen(&self) -> Option<Instant> {
        self.recency.first().map(|(seen, _)| *seen)
    }

    fn pop_oldest(&mut self) -> Option<String> {
        let (_, address) = self.recency.pop_first()?;
        self.buckets.remove(&address);
        Some(address)
    }

    fn len(&self) -> usize {
        self.buckets.len()
    }
}

impl RateLedger {
    /// Create a ledger with the default eviction limits.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self::with_limits(rate, burst, &LedgerConfig::default())
    }

    pub fn with_limits(rate: f64, burst: u32, limits: &LedgerConfig) -> Self {
        Self {
            rate,
            burst,
            max_entries: limits.max_entries.max(1),
            idle_timeout: limits.idle_timeout(),
            entries: Mutex::new(Entries::default()),
            evictions: AtomicU64::new(0),
        }
    }

    /// Record one request from `address` and report whether it fits the budget.
    pub fn check(&self, address: &str) -> bool {
        self.check_at(address, Instant::now())
    }

    /// [`RateLedger::check`] against an explicit instant.
    pub fn check_at(&self, address: &str, now: Instant) -> bool {
        let mut entries = self.lock();

        if let Some(allowed) = entries.check(address, now) {
            return allowed;
        }

        if entries.len() >= self.max_entries {
            self.make_room(&mut entries, now);
        }

        let mut bucket = TokenBucket::new(self.rate, self.burst, now);
        let allowed = bucket.allow_at(now);
        entries.insert(address, bucket);
        allowed
    }

    /// Drop every entry idle for longer than the idle timeout.
    ///
    /// Returns the number of evicted entries; always 0 when expiry is disabled.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        self.sweep_idle(&mut entries, now)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().len() == 0
    }

    pub fn contains(&self, address: &str) -> bool {
        self.lock().buckets.contains_key(address)
    }

    /// Total number of entries evicted since creation.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    fn make_room(&self, entries: &mut Entries, now: Instant) {
        if self.sweep_idle(entries, now) > 0 && entries.len() < self.max_entries {
            return;
        }

        if let Some(address) = entries.pop_oldest() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%address, "rate ledger full, evicted least recently seen address");
        }
    }

    fn sweep_idle(&self, entries: &mut Entries, now: Instant) -> usize {
        let Some(idle_timeout) = self.idle_timeout else {
            return 0;
        };

        let mut evicted = 0;
        while entries
            .oldest_seen()
            .is_some_and(|seen| now.saturating_duration_since(seen) > idle_timeout)
        {
            entries.pop_oldest();
            evicted += 1;
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::debug!(evicted, remaining = entries.len(), "evicted idle rate ledger entries");
        }
        evicted
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Rate ledger lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
