//! Built-in slots: node attachment and resource accounting.

use std::sync::Arc;

use crate::bucket::MetricEvent;
use crate::chain::BaseSlot;
use crate::chain::StatPrepareSlot;
use crate::chain::StatSlot;
use crate::clock;
use crate::context::EntryContext;
use crate::context::TrafficType;
use crate::exporter;
use crate::node;
use crate::node::ResourceNode;
use crate::result::BlockError;

pub const STAT_PREPARE_SLOT_ORDER: u32 = 1000;
pub const STAT_SLOT_ORDER: u32 = 1000;

const RESULT_PASS: &str = "pass";
const RESULT_BLOCK: &str = "block";

/// Creates (or finds) the resource node and attaches it to the context so
/// rule checks and accounting have somewhere to read and write.
pub struct ResourceNodePrepareSlot;

impl BaseSlot for ResourceNodePrepareSlot {
    fn order(&self) -> u32 {
        STAT_PREPARE_SLOT_ORDER
    }
}

impl StatPrepareSlot for ResourceNodePrepareSlot {
    fn prepare(&self, ctx: &mut EntryContext) {
        let resource = ctx.resource();
        if let Some(node) =
            node::get_or_create_resource_node(resource.name(), resource.classification())
        {
            ctx.set_stat_node(node);
        }
    }
}

/// Records pass/block on decision and complete/error/rt on exit, for both
/// the resource's own node and, for inbound entries, the inbound node.
pub struct ResourceStatSlot;

impl BaseSlot for ResourceStatSlot {
    fn order(&self) -> u32 {
        STAT_SLOT_ORDER
    }
}

impl StatSlot for ResourceStatSlot {
    fn on_entry_passed(&self, ctx: &mut EntryContext) {
        let batch = ctx.input().batch_count();
        record_pass(ctx.stat_node(), batch);
        if ctx.resource().traffic_type() == TrafficType::Inbound {
            record_pass(node::inbound_node().as_ref(), batch);
        }
        exporter::handled_total()
            .with_label_values(&[ctx.resource().name(), RESULT_PASS, ""])
            .inc_by(batch as u64);
    }

    fn on_entry_blocked(&self, ctx: &mut EntryContext, block_error: &BlockError) {
        let batch = ctx.input().batch_count();
        record_block(ctx.stat_node(), batch);
        if ctx.resource().traffic_type() == TrafficType::Inbound {
            record_block(node::inbound_node().as_ref(), batch);
        }
        exporter::handled_total()
            .with_label_values(&[
                ctx.resource().name(),
                RESULT_BLOCK,
                block_error.block_type().as_str(),
            ])
            .inc_by(batch as u64);
    }

    fn on_completed(&self, ctx: &mut EntryContext) {
        let rt = clock::now_millis().saturating_sub(ctx.start_time());
        ctx.set_round_trip_ms(rt);
        let batch = ctx.input().batch_count();
        let errored = ctx.error().is_some();
        record_complete(ctx.stat_node(), batch, rt, errored);
        if ctx.resource().traffic_type() == TrafficType::Inbound {
            record_complete(node::inbound_node().as_ref(), batch, rt, errored);
        }
    }
}

fn record_pass(node: Option<&Arc<ResourceNode>>, batch: u32) {
    if let Some(node) = node {
        node.increase_concurrency();
        node.add_count(MetricEvent::Pass, batch as u64);
    }
}

fn record_block(node: Option<&Arc<ResourceNode>>, batch: u32) {
    if let Some(node) = node {
        node.add_count(MetricEvent::Block, batch as u64);
    }
}

fn record_complete(node: Option<&Arc<ResourceNode>>, batch: u32, rt: u64, errored: bool) {
    if let Some(node) = node {
        if errored {
            node.add_count(MetricEvent::Error, batch as u64);
        }
        node.add_count(MetricEvent::Rt, rt);
        node.add_count(MetricEvent::Complete, batch as u64);
        node.decrease_concurrency();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ResourceType;
    use crate::context::ResourceWrapper;
    use crate::result::BlockType;

    fn context_for(name: &str) -> EntryContext {
        let mut ctx = EntryContext::new();
        ctx.set_resource(ResourceWrapper::new(
            name.into(),
            ResourceType::Common,
            TrafficType::Outbound,
        ));
        ctx.set_start_time(clock::now_millis());
        ctx
    }

    #[test]
    fn prepare_attaches_a_node() {
        let mut ctx = context_for("stat_slot_prepare_test");
        ResourceNodePrepareSlot.prepare(&mut ctx);
        assert_eq!(
            ctx.stat_node().unwrap().name(),
            "stat_slot_prepare_test"
        );
    }

    #[test]
    fn pass_then_complete_accounting() {
        let mut ctx = context_for("stat_slot_accounting_test");
        ResourceNodePrepareSlot.prepare(&mut ctx);

        let slot = ResourceStatSlot;
        slot.on_entry_passed(&mut ctx);
        let node = ctx.stat_node().unwrap().clone();
        assert_eq!(node.sum(MetricEvent::Pass), 1);
        assert_eq!(node.current_concurrency(), 1);

        slot.on_completed(&mut ctx);
        assert_eq!(node.sum(MetricEvent::Complete), 1);
        assert_eq!(node.sum(MetricEvent::Error), 0);
        assert_eq!(node.current_concurrency(), 0);
        assert!(ctx.round_trip_ms().is_some());
    }

    #[test]
    fn block_accounting_leaves_concurrency_alone() {
        let mut ctx = context_for("stat_slot_block_test");
        ResourceNodePrepareSlot.prepare(&mut ctx);

        let err = BlockError::new(BlockType::Flow, "over threshold");
        ResourceStatSlot.on_entry_blocked(&mut ctx, &err);

        let node = ctx.stat_node().unwrap();
        assert_eq!(node.sum(MetricEvent::Block), 1);
        assert_eq!(node.current_concurrency(), 0);
    }

    #[test]
    fn completion_with_error_counts_it() {
        let mut ctx = context_for("stat_slot_error_test");
        ResourceNodePrepareSlot.prepare(&mut ctx);

        let slot = ResourceStatSlot;
        slot.on_entry_passed(&mut ctx);
        ctx.set_error("timed out".into());
        slot.on_completed(&mut ctx);

        let node = ctx.stat_node().unwrap();
        assert_eq!(node.sum(MetricEvent::Error), 1);
        assert_eq!(node.sum(MetricEvent::Complete), 1);
    }
}
