//! Named counters surfaced to an external scraper.
//!
//! The library owns its own [`prometheus::Registry`]; counters are created
//! and registered on first use and work whether or not anything ever
//! scrapes them. An embedding process exposes them by encoding
//! [`gather`] with a `TextEncoder` on whatever endpoint it already serves.

use std::sync::OnceLock;

use prometheus::IntCounterVec;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::proto::MetricFamily;

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HANDLED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static FLOW_WAIT_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// The registry all library metrics are registered with.
pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

/// Entries handled, partitioned by resource, decision, and block type.
/// The `block_type` label is empty for passed entries.
pub fn handled_total() -> &'static IntCounterVec {
    HANDLED_TOTAL.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new(
                "flowgate_handled_total",
                "Total entries handled, partitioned by decision",
            ),
            &["resource", "result", "block_type"],
        )
        .expect("metric creation should not fail");
        registry()
            .register(Box::new(counter.clone()))
            .expect("metric registration should not fail");
        counter
    })
}

/// Units of work that waited in the throttling shaper before passing.
pub fn flow_wait_total() -> &'static IntCounterVec {
    FLOW_WAIT_TOTAL.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new(
                "flowgate_flow_wait_total",
                "Total units of work delayed by throttling flow rules",
            ),
            &["resource"],
        )
        .expect("metric creation should not fail");
        registry()
            .register(Box::new(counter.clone()))
            .expect("metric registration should not fail");
        counter
    })
}

/// Snapshot of all registered metric families, for exposition.
pub fn gather() -> Vec<MetricFamily> {
    // Touch both counters so they are registered even if never incremented.
    let _ = handled_total();
    let _ = flow_wait_total();
    registry().gather()
}
