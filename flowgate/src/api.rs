//! Public entry surface: acquire, exit, trace.

use std::collections::HashMap;
use std::sync::Arc;

use crate::chain;
use crate::chain::SlotChain;
use crate::clock;
use crate::context::EntryInput;
use crate::context::ResourceType;
use crate::context::ResourceWrapper;
use crate::context::TrafficType;
use crate::entry::Entry;
use crate::result::BlockError;
use crate::result::TokenResult;

/// Open an entry on `resource` with default options.
///
/// Shorthand for `EntryBuilder::new(resource).build()`.
pub fn entry(resource: &str) -> Result<Entry, BlockError> {
    EntryBuilder::new(resource).build()
}

/// Record an error on a live entry. Equivalent to [`Entry::trace_error`].
pub fn trace_error(entry: &Entry, message: impl Into<String>) {
    entry.trace_error(message);
}

/// Options for opening an entry.
#[derive(Debug)]
pub struct EntryBuilder {
    resource: String,
    resource_type: ResourceType,
    traffic_type: TrafficType,
    batch_count: u32,
    flag: i32,
    args: Vec<String>,
    attachments: HashMap<String, String>,
    chain: Option<Arc<SlotChain>>,
}

impl EntryBuilder {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            resource_type: ResourceType::default(),
            traffic_type: TrafficType::default(),
            batch_count: 1,
            flag: 0,
            args: Vec::new(),
            attachments: HashMap::new(),
            chain: None,
        }
    }

    pub fn with_resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    pub fn with_traffic_type(mut self, traffic_type: TrafficType) -> Self {
        self.traffic_type = traffic_type;
        self
    }

    /// How many logical units of work this entry represents. Counters and
    /// token demand scale by this amount. Defaults to 1.
    pub fn with_batch_count(mut self, batch_count: u32) -> Self {
        self.batch_count = batch_count;
        self
    }

    pub fn with_flag(mut self, flag: i32) -> Self {
        self.flag = flag;
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    /// Run this entry through a custom chain instead of the global one.
    pub fn with_slot_chain(mut self, chain: Arc<SlotChain>) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Drive the slot chain. On a pass the returned [`Entry`] must be
    /// exited (explicitly or by drop); on a block the context is released
    /// immediately and the rejection is returned.
    pub fn build(self) -> Result<Entry, BlockError> {
        let chain = self.chain.unwrap_or_else(chain::global_slot_chain);

        let mut ctx = chain::acquire_context();
        ctx.set_resource(ResourceWrapper::new(
            self.resource,
            self.resource_type,
            self.traffic_type,
        ));
        ctx.set_input(EntryInput::new(
            self.batch_count,
            self.flag,
            self.args,
            self.attachments,
        ));
        ctx.set_start_time(clock::now_millis());

        match chain.entry(&mut ctx) {
            TokenResult::Blocked(block_error) => {
                chain::release_context(ctx);
                Err(block_error)
            }
            _ => Ok(Entry::new(ctx, chain)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::MetricEvent;
    use crate::node;

    #[test]
    fn entry_passes_without_rules_and_counts() {
        let handle = entry("api_unconstrained_test").unwrap();
        let node = node::get_resource_node("api_unconstrained_test").unwrap();
        assert_eq!(node.sum(MetricEvent::Pass), 1);
        assert_eq!(node.current_concurrency(), 1);

        handle.exit();
        assert_eq!(node.sum(MetricEvent::Complete), 1);
        assert_eq!(node.current_concurrency(), 0);
    }

    #[test]
    fn exit_is_idempotent() {
        let handle = entry("api_idempotent_exit_test").unwrap();
        handle.exit();
        handle.exit();

        let node = node::get_resource_node("api_idempotent_exit_test").unwrap();
        assert_eq!(node.sum(MetricEvent::Complete), 1);
        assert_eq!(node.current_concurrency(), 0);
        assert!(handle.is_exited());
    }

    #[test]
    fn drop_completes_the_entry() {
        {
            let _handle = entry("api_drop_exit_test").unwrap();
        }
        let node = node::get_resource_node("api_drop_exit_test").unwrap();
        assert_eq!(node.sum(MetricEvent::Complete), 1);
        assert_eq!(node.current_concurrency(), 0);
    }

    #[test]
    fn batch_count_scales_accounting() {
        let handle = EntryBuilder::new("api_batch_test")
            .with_batch_count(5)
            .build()
            .unwrap();
        handle.exit();

        let node = node::get_resource_node("api_batch_test").unwrap();
        assert_eq!(node.sum(MetricEvent::Pass), 5);
        assert_eq!(node.sum(MetricEvent::Complete), 5);
    }

    #[test]
    fn traced_errors_count_on_completion() {
        let handle = entry("api_trace_error_test").unwrap();
        trace_error(&handle, "downstream exploded");
        handle.exit();

        let node = node::get_resource_node("api_trace_error_test").unwrap();
        assert_eq!(node.sum(MetricEvent::Error), 1);
    }

    #[test]
    fn inbound_entries_feed_the_inbound_node() {
        let inbound = node::inbound_node().unwrap();
        let before = inbound.sum(MetricEvent::Pass);

        let handle = EntryBuilder::new("api_inbound_test")
            .with_traffic_type(TrafficType::Inbound)
            .build()
            .unwrap();
        handle.exit();

        assert_eq!(inbound.sum(MetricEvent::Pass), before + 1);
    }
}
