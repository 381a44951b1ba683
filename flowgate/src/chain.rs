//! The per-entry pipeline: prepare slots, rule-check slots, stat slots.
//!
//! Slots run in ascending [`BaseSlot::order`] within each phase. Rule checks
//! short-circuit on the first block; a wait result suspends the chain and
//! then continues with the next check. Stat slots always run, once the final
//! decision is known.
//!
//! Every slot invocation is shielded by `catch_unwind`: a panicking slot is
//! logged, recorded on the context as an error, and treated as a pass. A
//! buggy slot must never reject traffic or starve the slots behind it.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;

use crate::clock;
use crate::context::EntryContext;
use crate::flow::FlowSlot;
use crate::result::BlockError;
use crate::result::TokenResult;
use crate::stat_slot::ResourceNodePrepareSlot;
use crate::stat_slot::ResourceStatSlot;

/// Common to every slot: its position within its phase.
pub trait BaseSlot: Send + Sync {
    /// Slots within a phase execute in ascending order value.
    fn order(&self) -> u32;
}

/// Runs before any rule check; resolves state the rest of the chain needs,
/// typically the statistics node. Prepare slots cannot fail.
pub trait StatPrepareSlot: BaseSlot {
    fn prepare(&self, ctx: &mut EntryContext);
}

/// A rule-based admission decision. Returning `None` is an implicit pass.
pub trait RuleCheckSlot: BaseSlot {
    fn check(&self, ctx: &mut EntryContext) -> Option<TokenResult>;
}

/// Accounting hooks invoked once the decision for an entry is known.
/// `on_completed` fires only when a passed entry exits.
pub trait StatSlot: BaseSlot {
    fn on_entry_passed(&self, ctx: &mut EntryContext);
    fn on_entry_blocked(&self, ctx: &mut EntryContext, block_error: &BlockError);
    fn on_completed(&self, ctx: &mut EntryContext);
}

/// The ordered three-phase pipeline an entry is driven through.
pub struct SlotChain {
    stat_pres: Vec<Arc<dyn StatPrepareSlot>>,
    rule_checks: Vec<Arc<dyn RuleCheckSlot>>,
    stats: Vec<Arc<dyn StatSlot>>,
}

impl SlotChain {
    pub fn new() -> Self {
        Self {
            stat_pres: Vec::new(),
            rule_checks: Vec::new(),
            stats: Vec::new(),
        }
    }

    pub fn add_stat_prepare_slot(&mut self, slot: Arc<dyn StatPrepareSlot>) {
        self.stat_pres.push(slot);
        self.stat_pres.sort_by_key(|s| s.order());
    }

    pub fn add_rule_check_slot(&mut self, slot: Arc<dyn RuleCheckSlot>) {
        self.rule_checks.push(slot);
        self.rule_checks.sort_by_key(|s| s.order());
    }

    pub fn add_stat_slot(&mut self, slot: Arc<dyn StatSlot>) {
        self.stats.push(slot);
        self.stats.sort_by_key(|s| s.order());
    }

    /// Drive a populated context through all three phases and return the
    /// final decision. The caller owns releasing the context afterwards.
    pub(crate) fn entry(&self, ctx: &mut EntryContext) -> TokenResult {
        for slot in &self.stat_pres {
            if let Some(panic_msg) = shielded(|| slot.prepare(&mut *ctx)) {
                tracing::error!(panic = %panic_msg, "prepare slot panicked");
                ctx.set_error(panic_msg);
            }
        }

        let mut decision: Option<TokenResult> = None;
        for slot in &self.rule_checks {
            let mut slot_result: Option<TokenResult> = None;
            if let Some(panic_msg) = shielded(|| slot_result = slot.check(&mut *ctx)) {
                tracing::error!(panic = %panic_msg, "rule check slot panicked");
                ctx.set_error(panic_msg);
                continue;
            }
            match slot_result {
                None | Some(TokenResult::Pass) => {}
                Some(TokenResult::ShouldWait { nanos_to_wait }) => {
                    if nanos_to_wait > 0 {
                        clock::sleep_nanos(nanos_to_wait);
                    }
                }
                Some(blocked @ TokenResult::Blocked(_)) => {
                    decision = Some(blocked);
                    break;
                }
            }
        }
        let decision = decision.unwrap_or(TokenResult::Pass);
        ctx.set_rule_check_result(decision.clone());

        let block_error = decision.block_error().cloned();
        for slot in &self.stats {
            let outcome = match &block_error {
                Some(err) => shielded(|| slot.on_entry_blocked(&mut *ctx, err)),
                None => shielded(|| slot.on_entry_passed(&mut *ctx)),
            };
            if let Some(panic_msg) = outcome {
                tracing::error!(panic = %panic_msg, "stat slot panicked");
                ctx.set_error(panic_msg);
            }
        }

        decision
    }

    /// Completion path for a passed entry. Blocked entries never reach here.
    pub(crate) fn exit(&self, ctx: &mut EntryContext) {
        if ctx.is_blocked() {
            return;
        }
        for slot in &self.stats {
            if let Some(panic_msg) = shielded(|| slot.on_completed(&mut *ctx)) {
                tracing::error!(panic = %panic_msg, "stat slot panicked on completion");
                ctx.set_error(panic_msg);
            }
        }
    }
}

impl Default for SlotChain {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SlotChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotChain")
            .field("stat_prepare_slots", &self.stat_pres.len())
            .field("rule_check_slots", &self.rule_checks.len())
            .field("stat_slots", &self.stats.len())
            .finish()
    }
}

fn shielded(f: impl FnOnce()) -> Option<String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => None,
        Err(payload) => Some(panic_message(payload)),
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

static GLOBAL_CHAIN: OnceLock<Arc<SlotChain>> = OnceLock::new();

/// The default chain used by the entry API: node prepare, flow rule check,
/// resource accounting.
pub fn global_slot_chain() -> Arc<SlotChain> {
    GLOBAL_CHAIN
        .get_or_init(|| {
            let mut chain = SlotChain::new();
            chain.add_stat_prepare_slot(Arc::new(ResourceNodePrepareSlot));
            chain.add_rule_check_slot(Arc::new(FlowSlot));
            chain.add_stat_slot(Arc::new(ResourceStatSlot));
            Arc::new(chain)
        })
        .clone()
}

const CONTEXT_POOL_CAP: usize = 256;

static CONTEXT_POOL: Mutex<Vec<Box<EntryContext>>> = Mutex::new(Vec::new());

pub(crate) fn acquire_context() -> Box<EntryContext> {
    CONTEXT_POOL
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .pop()
        .unwrap_or_default()
}

pub(crate) fn release_context(mut ctx: Box<EntryContext>) {
    ctx.reset();
    let mut pool = CONTEXT_POOL.lock().unwrap_or_else(PoisonError::into_inner);
    if pool.len() < CONTEXT_POOL_CAP {
        pool.push(ctx);
    }
}
