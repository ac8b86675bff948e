use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::sync::Arc;

use crate::firewall::Family;

pub mod labels {
    pub const REASON: &str = "reason";
    pub const FAMILY: &str = "family";
}

pub mod values {
    pub const SKIP_MALFORMED: &str = "malformed";
    pub const SKIP_INVALID_ADDRESS: &str = "invalid_address";
    pub const SKIP_ALLOWLISTED: &str = "allowlisted";
}

const METER_NAME: &str = "ngx-reqlimiter";

#[derive(Clone)]
pub struct Metrics {
    pub records_total: Counter<u64>,
    pub records_skipped_total: Counter<u64>,

    pub requests_allowed_total: Counter<u64>,
    pub requests_denied_total: Counter<u64>,

    pub bans_total: Counter<u64>,
    pub ban_failures_total: Counter<u64>,

    pub ledger_evictions_total: Counter<u64>,
}

impl Metrics {
    fn new(meter: Meter) -> Self {
        Self {
            records_total: meter
                .u64_counter("reqlimiter_records_total")
                .with_description("Total number of access-log records received")
                .build(),
            records_skipped_total: meter
                .u64_counter("reqlimiter_records_skipped_total")
                .with_description("Records skipped before rate accounting")
                .build(),

            requests_allowed_total: meter
                .u64_counter("reqlimiter_requests_allowed_total")
                .with_description("Requests within their address budget")
                .build(),
            requests_denied_total: meter
                .u64_counter("reqlimiter_requests_denied_total")
                .with_description("Requests that exceeded their address budget")
                .build(),

            bans_total: meter
                .u64_counter("reqlimiter_bans_total")
                .with_description("Addresses for which new drop rules were installed")
                .build(),
            ban_failures_total: meter
                .u64_counter("reqlimiter_ban_failures_total")
                .with_description("Ban attempts with at least one failed rule insertion")
                .build(),

            ledger_evictions_total: meter
                .u64_counter("reqlimiter_ledger_evictions_total")
                .with_description("Rate ledger entries evicted")
                .build(),
        }
    }

    pub fn record_received(&self) {
        self.records_total.add(1, &[]);
    }

    pub fn record_skipped(&self, reason: &'static str) {
        self.records_skipped_total
            .add(1, &[KeyValue::new(labels::REASON, reason)]);
    }

    pub fn record_decision(&self, allowed: bool) {
        if allowed {
            self.requests_allowed_total.add(1, &[]);
        } else {
            self.requests_denied_total.add(1, &[]);
        }
    }

    pub fn record_ban(&self, family: Family) {
        self.bans_total
            .add(1, &[KeyValue::new(labels::FAMILY, family.as_str())]);
    }

    pub fn record_ban_failure(&self, family: Family) {
        self.ban_failures_total
            .add(1, &[KeyValue::new(labels::FAMILY, family.as_str())]);
    }

    pub fn record_evictions(&self, evicted: u64) {
        if evicted > 0 {
            self.ledger_evictions_total.add(evicted, &[]);
        }
    }
}

impl Default for Metrics {
    /// Instruments from the global meter provider; no-ops until
    /// [`init_metrics`] installs one.
    fn default() -> Self {
        Self::new(global::meter(METER_NAME))
    }
}

pub fn init_metrics() -> Result<(Arc<Metrics>, Registry), Box<dyn std::error::Error + Send + Sync>>
{
    let registry = Registry::default();

    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;

    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();

    global::set_meter_provider(meter_provider);

    let meter = global::meter(METER_NAME);
    let metrics = Arc::new(Metrics::new(meter));

    Ok((metrics, registry))
}
