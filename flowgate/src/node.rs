//! Per-resource statistics and the process-wide node registry.
//!
//! Each resource gets one [`ResourceNode`] on its first entry and keeps it
//! for the life of the process. A node carries two rings over the same
//! counters: a configurable high-resolution ring that feeds rule checks, and
//! a fixed 60-bucket, one-second ring whose second-aligned starts feed the
//! metric log aggregator.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use crate::bucket::MetricBucket;
use crate::bucket::MetricEvent;
use crate::clock;
use crate::config;
use crate::context::ResourceType;
use crate::metric_item::MetricItem;
use crate::ring::BucketRing;
use crate::ring::RingError;

const EXPORT_SAMPLE_COUNT: u32 = 60;
const EXPORT_INTERVAL_MS: u32 = 60_000;

/// Name under which inbound traffic is aggregated as a whole.
pub const INBOUND_RESOURCE_NAME: &str = "inbound_traffic";

/// Aggregate statistics for one named resource.
#[derive(Debug)]
pub struct ResourceNode {
    name: String,
    resource_type: ResourceType,
    limiter: BucketRing<MetricBucket>,
    export: BucketRing<MetricBucket>,
    concurrency: AtomicU32,
}

impl ResourceNode {
    pub fn new(name: impl Into<String>, resource_type: ResourceType) -> Result<Self, RingError> {
        let cfg = config::global();
        Ok(Self {
            name: name.into(),
            resource_type,
            limiter: BucketRing::new(cfg.stat_sample_count, cfg.stat_interval_ms)?,
            export: BucketRing::new(EXPORT_SAMPLE_COUNT, EXPORT_INTERVAL_MS)?,
            concurrency: AtomicU32::new(0),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    /// Record `count` occurrences of `event` in the current buckets of both
    /// rings. A bucket that cannot be located (clock went backwards past the
    /// window) drops the sample rather than failing the entry.
    pub fn add_count(&self, event: MetricEvent, count: u64) {
        match self.limiter.current_bucket() {
            Ok(wrap) => wrap.bucket().add(event, count),
            Err(err) => tracing::debug!(resource = %self.name, %err, "dropped limiter sample"),
        }
        match self.export.current_bucket() {
            Ok(wrap) => wrap.bucket().add(event, count),
            Err(err) => tracing::debug!(resource = %self.name, %err, "dropped export sample"),
        }
    }

    /// Sum of `event` over the non-expired window of the limiter ring.
    pub fn sum(&self, event: MetricEvent) -> u64 {
        self.limiter
            .values()
            .iter()
            .map(|w| w.bucket().get(event))
            .sum()
    }

    /// Count of `event` in the bucket covering the current instant.
    pub fn current(&self, event: MetricEvent) -> u64 {
        self.limiter
            .current_bucket()
            .map(|w| w.bucket().get(event))
            .unwrap_or(0)
    }

    /// Per-second rate of `event` averaged over the limiter window.
    pub fn qps(&self, event: MetricEvent) -> f64 {
        self.sum(event) as f64 / (self.limiter.interval_ms() as f64 / 1000.0)
    }

    /// Rate of `event` during the previous full second, from the export ring.
    pub fn previous_qps(&self, event: MetricEvent) -> f64 {
        let now = clock::now_millis();
        let prev_start = (now - now % 1000).saturating_sub(1000);
        self.export
            .values_conditional(now, |ts| ts == prev_start)
            .first()
            .map(|w| w.bucket().get(event) as f64)
            .unwrap_or(0.0)
    }

    #[inline]
    pub fn increase_concurrency(&self) {
        self.concurrency.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn decrease_concurrency(&self) {
        self.concurrency.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn current_concurrency(&self) -> u32 {
        self.concurrency.load(Ordering::Relaxed)
    }

    /// Export items for every non-expired second-aligned bucket whose start
    /// satisfies `predicate`. Items are raw; activity filtering is up to the
    /// caller.
    pub fn metrics_on_condition(&self, predicate: impl Fn(u64) -> bool) -> Vec<MetricItem> {
        let now = clock::now_millis();
        self.export
            .values_conditional(now, predicate)
            .iter()
            .map(|wrap| {
                let bucket = wrap.bucket();
                let complete = bucket.get(MetricEvent::Complete);
                MetricItem {
                    timestamp: wrap.start(),
                    resource: self.name.clone(),
                    classification: self.resource_type,
                    pass_qps: bucket.get(MetricEvent::Pass),
                    block_qps: bucket.get(MetricEvent::Block),
                    complete_qps: complete,
                    error_qps: bucket.get(MetricEvent::Error),
                    avg_rt: bucket.get(MetricEvent::Rt) / complete.max(1),
                    concurrency: self.current_concurrency(),
                }
            })
            .collect()
    }
}

type NodeMap = HashMap<String, Arc<ResourceNode>>;

static NODES: OnceLock<RwLock<NodeMap>> = OnceLock::new();
static INBOUND: OnceLock<Option<Arc<ResourceNode>>> = OnceLock::new();

fn nodes() -> &'static RwLock<NodeMap> {
    NODES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// The node for `name`, if one has been created by an earlier entry.
pub fn get_resource_node(name: &str) -> Option<Arc<ResourceNode>> {
    nodes()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .cloned()
}

/// The node for `name`, creating and interning it on first sight.
///
/// Creation only fails on invalid ring parameters, which a validated config
/// rules out; if it happens anyway the failure is logged and the entry runs
/// without statistics rather than being rejected.
pub fn get_or_create_resource_node(
    name: &str,
    resource_type: ResourceType,
) -> Option<Arc<ResourceNode>> {
    if let Some(node) = get_resource_node(name) {
        return Some(node);
    }
    let mut map = nodes().write().unwrap_or_else(PoisonError::into_inner);
    if let Some(node) = map.get(name) {
        return Some(node.clone());
    }
    match ResourceNode::new(name, resource_type) {
        Ok(node) => {
            let node = Arc::new(node);
            map.insert(name.to_string(), node.clone());
            Some(node)
        }
        Err(err) => {
            tracing::error!(resource = name, %err, "failed to create resource node");
            None
        }
    }
}

/// Snapshot of every interned node.
pub fn resource_node_list() -> Vec<Arc<ResourceNode>> {
    nodes()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .cloned()
        .collect()
}

/// The synthetic node aggregating all inbound-direction entries.
pub fn inbound_node() -> Option<Arc<ResourceNode>> {
    INBOUND
        .get_or_init(|| match ResourceNode::new(INBOUND_RESOURCE_NAME, ResourceType::Common) {
            Ok(node) => Some(Arc::new(node)),
            Err(err) => {
                tracing::error!(%err, "failed to create inbound node");
                None
            }
        })
        .clone()
}
