//! The flow rule-check slot.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::chain::BaseSlot;
use crate::chain::RuleCheckSlot;
use crate::clock;
use crate::context::EntryContext;
use crate::exporter;
use crate::node;
use crate::node::ResourceNode;
use crate::result::TokenResult;

use super::controller::TrafficShapingController;
use super::rule::RelationStrategy;
use super::rule_manager;

pub const FLOW_SLOT_ORDER: u32 = 2000;

/// Evaluates every controller loaded for the entry's resource, in rule
/// order. The first block wins; waits are served in place and evaluation
/// continues with the next controller.
pub struct FlowSlot;

impl BaseSlot for FlowSlot {
    fn order(&self) -> u32 {
        FLOW_SLOT_ORDER
    }
}

impl RuleCheckSlot for FlowSlot {
    fn check(&self, ctx: &mut EntryContext) -> Option<TokenResult> {
        let resource = ctx.resource().name().to_string();
        let controllers = rule_manager::controllers_for(&resource);
        if controllers.is_empty() {
            return None;
        }

        let batch = ctx.input().batch_count();
        for controller in &controllers {
            let Some(node) = select_node(controller, ctx) else {
                warn_missing_node(&resource);
                continue;
            };
            match controller.perform_checking(&node, batch) {
                TokenResult::Pass => {}
                blocked @ TokenResult::Blocked(_) => return Some(blocked),
                TokenResult::ShouldWait { nanos_to_wait } => {
                    if nanos_to_wait > 0 {
                        exporter::flow_wait_total()
                            .with_label_values(&[resource.as_str()])
                            .inc_by(batch as u64);
                        clock::sleep_nanos(nanos_to_wait);
                    }
                }
            }
        }
        None
    }
}

fn select_node(
    controller: &TrafficShapingController,
    ctx: &EntryContext,
) -> Option<Arc<ResourceNode>> {
    match controller.rule().relation_strategy {
        RelationStrategy::AssociatedResource => {
            node::get_resource_node(&controller.rule().ref_resource)
        }
        RelationStrategy::Direct => ctx.stat_node().cloned(),
    }
}

/// Missing nodes happen once per unseen resource and on associated rules
/// whose target has no traffic yet; cap the noise at one warning a second.
fn warn_missing_node(resource: &str) {
    static LAST_WARN_MS: AtomicU64 = AtomicU64::new(0);
    let now = clock::now_millis();
    let last = LAST_WARN_MS.load(Ordering::Relaxed);
    if now.saturating_sub(last) >= 1000
        && LAST_WARN_MS
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    {
        tracing::warn!(resource, "no statistics node for flow rule, passing entry");
    }
}
