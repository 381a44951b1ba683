//! The mutable carrier passed through the slot chain for one entry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::node::ResourceNode;
use crate::result::TokenResult;

/// Broad classification of a protected resource, recorded in metric logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceType {
    #[default]
    Common = 0,
    Web = 1,
    Rpc = 2,
    Database = 3,
    Cache = 4,
}

/// Direction of the traffic an entry represents. Inbound entries are
/// additionally aggregated into the process-wide inbound node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrafficType {
    #[default]
    Outbound,
    Inbound,
}

/// The identity of a protected resource as seen by one entry.
#[derive(Debug, Clone, Default)]
pub struct ResourceWrapper {
    name: String,
    classification: ResourceType,
    traffic_type: TrafficType,
}

impl ResourceWrapper {
    pub fn new(name: String, classification: ResourceType, traffic_type: TrafficType) -> Self {
        Self {
            name,
            classification,
            traffic_type,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn classification(&self) -> ResourceType {
        self.classification
    }

    #[inline]
    pub fn traffic_type(&self) -> TrafficType {
        self.traffic_type
    }
}

/// Caller-supplied inputs for one entry.
#[derive(Debug, Clone)]
pub struct EntryInput {
    batch_count: u32,
    flag: i32,
    args: Vec<String>,
    attachments: HashMap<String, String>,
}

impl Default for EntryInput {
    fn default() -> Self {
        Self {
            batch_count: 1,
            flag: 0,
            args: Vec::new(),
            attachments: HashMap::new(),
        }
    }
}

impl EntryInput {
    pub(crate) fn new(
        batch_count: u32,
        flag: i32,
        args: Vec<String>,
        attachments: HashMap<String, String>,
    ) -> Self {
        Self {
            batch_count,
            flag,
            args,
            attachments,
        }
    }

    #[inline]
    pub fn batch_count(&self) -> u32 {
        self.batch_count
    }

    #[inline]
    pub fn flag(&self) -> i32 {
        self.flag
    }

    #[inline]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(String::as_str)
    }
}

/// Per-entry state threaded through every slot.
///
/// Contexts are pooled; [`EntryContext::reset`] restores the blank state
/// before a context returns to the free list.
#[derive(Debug, Default)]
pub struct EntryContext {
    resource: ResourceWrapper,
    stat_node: Option<Arc<ResourceNode>>,
    input: EntryInput,
    rule_check_result: TokenResult,
    start_time: u64,
    round_trip_ms: Option<u64>,
    error_msg: Option<String>,
}

impl EntryContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn resource(&self) -> &ResourceWrapper {
        &self.resource
    }

    pub(crate) fn set_resource(&mut self, resource: ResourceWrapper) {
        self.resource = resource;
    }

    #[inline]
    pub fn stat_node(&self) -> Option<&Arc<ResourceNode>> {
        self.stat_node.as_ref()
    }

    /// Attach the statistics node rule checks and stat slots should use.
    /// Normally done by the node prepare slot.
    pub fn set_stat_node(&mut self, node: Arc<ResourceNode>) {
        self.stat_node = Some(node);
    }

    #[inline]
    pub fn input(&self) -> &EntryInput {
        &self.input
    }

    pub(crate) fn set_input(&mut self, input: EntryInput) {
        self.input = input;
    }

    #[inline]
    pub fn rule_check_result(&self) -> &TokenResult {
        &self.rule_check_result
    }

    pub(crate) fn set_rule_check_result(&mut self, result: TokenResult) {
        self.rule_check_result = result;
    }

    #[inline]
    pub fn is_blocked(&self) -> bool {
        self.rule_check_result.is_blocked()
    }

    /// Entry start in Unix milliseconds, set when the entry is acquired.
    #[inline]
    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub(crate) fn set_start_time(&mut self, start_time: u64) {
        self.start_time = start_time;
    }

    /// Response time recorded on completion, if the entry has completed.
    #[inline]
    pub fn round_trip_ms(&self) -> Option<u64> {
        self.round_trip_ms
    }

    pub(crate) fn set_round_trip_ms(&mut self, rt: u64) {
        self.round_trip_ms = Some(rt);
    }

    /// Record an error on this entry so completion accounting counts it.
    pub fn set_error(&mut self, message: String) {
        self.error_msg = Some(message);
    }

    #[inline]
    pub fn error(&self) -> Option<&str> {
        self.error_msg.as_deref()
    }

    pub(crate) fn reset(&mut self) {
        self.resource = ResourceWrapper::default();
        self.stat_node = None;
        self.input = EntryInput::default();
        self.rule_check_result = TokenResult::Pass;
        self.start_time = 0;
        self.round_trip_ms = None;
        self.error_msg = None;
    }
}
