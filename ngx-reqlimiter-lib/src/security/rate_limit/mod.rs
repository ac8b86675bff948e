//! Per-address request budgets.
//!
//! Every source address seen in the access log owns a [`TokenBucket`]: the
//! bucket starts full with `burst` tokens and refills continuously at `rate`
//! tokens per second up to `burst`. Each logged request consumes one token;
//! a request that finds the bucket empty is denied and the address becomes a
//! ban candidate.
//!
//! Refill is computed lazily from the elapsed time since the previous check,
//! so no background timer touches the buckets.
//!
//! The [`RateLedger`] owns the buckets, creating one on first sight of an
//! address and evicting entries according to an explicit policy (idle expiry
//! and a hard entry bound).

mod bucket;
mod ledger;

pub use bucket::TokenBucket;
pub use ledger::RateLedger;
