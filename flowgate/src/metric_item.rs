//! One resource's counters for one second-aligned bucket, ready for export.

use crate::context::ResourceType;

/// A single line of the metric log.
///
/// The on-disk format is `|`-separated:
/// `timestamp|resource|classification|pass|block|complete|error|avgRt|concurrency`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricItem {
    pub timestamp: u64,
    pub resource: String,
    pub classification: ResourceType,
    pub pass_qps: u64,
    pub block_qps: u64,
    pub complete_qps: u64,
    pub error_qps: u64,
    pub avg_rt: u64,
    pub concurrency: u32,
}

impl MetricItem {
    /// Inactive items carry no information and are dropped before export.
    pub fn is_active(&self) -> bool {
        self.pass_qps > 0
            || self.block_qps > 0
            || self.complete_qps > 0
            || self.error_qps > 0
            || self.avg_rt > 0
            || self.concurrency > 0
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.timestamp,
            self.resource,
            self.classification as u8,
            self.pass_qps,
            self.block_qps,
            self.complete_qps,
            self.error_qps,
            self.avg_rt,
            self.concurrency
        )
    }
}
