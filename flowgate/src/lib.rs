//! # flowgate
//!
//! `flowgate` is an in-process traffic governance library. It intercepts
//! logical units of work ("entries") against named resources and decides,
//! per entry, whether the work may proceed, must be rejected, or should be
//! briefly paused, based on user-loaded flow rules and the runtime
//! statistics the library maintains for every resource.
//!
//! ## Core Philosophy
//!
//! The hot path is lock-free: per-resource statistics live in rings of
//! atomically-updated buckets, decisions read a copy-on-write snapshot of
//! the rule set, and the only suspension point is the deliberate pause a
//! throttling rule can impose. Internal bugs fail open: a panicking slot is
//! contained, logged, and treated as a pass, because a governance layer must
//! never take down the traffic it governs.
//!
//! ## Key Concepts
//!
//! * **Entry**: one bracketed invocation of a protected code region,
//!   acquired from [`entry`] or [`EntryBuilder`] and closed by
//!   [`Entry::exit`] (or drop).
//! * **Slot chain**: the prepare / rule-check / stat pipeline every entry is
//!   driven through; extensible with custom slots.
//! * **Flow rules**: per-resource thresholds compiled into controllers with
//!   reject or throttling behavior, optionally keyed to an associated
//!   resource's statistics.
//!
//! ## Example
//!
//! ```rust
//! use flowgate::flow::{ControlBehavior, FlowRule};
//!
//! flowgate::flow::load_flow_rules_of_resource(
//!     "demo-resource",
//!     vec![FlowRule {
//!         resource: "demo-resource".into(),
//!         threshold: 100.0,
//!         control_behavior: ControlBehavior::Reject,
//!         ..FlowRule::default()
//!     }],
//! )
//! .unwrap();
//!
//! match flowgate::entry("demo-resource") {
//!     Ok(entry) => {
//!         // protected work happens here
//!         entry.exit();
//!     }
//!     Err(blocked) => {
//!         eprintln!("rejected: {blocked}");
//!     }
//! }
//! ```

pub mod aggregator;
pub mod api;
pub mod bucket;
pub mod chain;
pub mod clock;
pub mod config;
pub mod context;
pub mod entry;
pub mod exporter;
pub mod flow;
pub mod log_writer;
pub mod metric_item;
pub mod node;
pub mod result;
pub mod ring;
pub mod stat_slot;


pub use api::EntryBuilder;
pub use api::entry;
pub use api::trace_error;
pub use bucket::MetricEvent;
pub use chain::global_slot_chain;
pub use chain::SlotChain;
pub use config::Config;
pub use config::ConfigError;
pub use context::EntryContext;
pub use context::ResourceType;
pub use context::TrafficType;
pub use entry::Entry;
pub use metric_item::MetricItem;
pub use result::BlockError;
pub use result::BlockType;
pub use result::TokenResult;

use aggregator::MetricLogWriter;
use log_writer::RollingFileWriter;

/// Initialize the library with default configuration.
///
/// Installs the default [`Config`] and starts the metric log pipeline with
/// the rolling file writer. Optional: the entry API works without any init,
/// using defaults and no metric log.
pub fn init_default() -> Result<(), ConfigError> {
    init_with_config(Config::default())
}

/// Initialize the library with an explicit configuration.
///
/// Call before the first entry; resource nodes capture ring parameters when
/// they are created. If a config was already installed the earlier one
/// stays in effect and a warning is logged.
pub fn init_with_config(config: Config) -> Result<(), ConfigError> {
    config.validate()?;
    if !config::install(config) {
        tracing::warn!("flowgate is already configured, keeping the existing config");
    }
    let cfg = config::global();
    if cfg.metric_log_flush_interval_sec > 0 {
        let writer = RollingFileWriter::new(
            &cfg.metric_log_dir,
            cfg.metric_log_single_file_max_size,
            cfg.metric_log_max_file_amount,
        )?;
        aggregator::init_task(Box::new(writer));
    }
    Ok(())
}

/// Initialize with a custom metric log sink instead of the rolling file
/// writer. Useful for tests and for shipping metrics somewhere other than
/// local disk.
pub fn init_with_metric_writer(
    config: Config,
    writer: Box<dyn MetricLogWriter>,
) -> Result<(), ConfigError> {
    config.validate()?;
    if !config::install(config) {
        tracing::warn!("flowgate is already configured, keeping the existing config");
    }
    if config::global().metric_log_flush_interval_sec > 0 {
        aggregator::init_task(writer);
    }
    Ok(())
}
