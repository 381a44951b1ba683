//! Compiled rules: a token calculator paired with a shaping checker.

use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::bucket::MetricEvent;
use crate::clock;
use crate::node::ResourceNode;
use crate::result::BlockError;
use crate::result::BlockType;
use crate::result::TokenResult;

use super::rule::ControlBehavior;
use super::rule::FlowRule;
use super::rule::RuleError;
use super::rule::TokenCalculateStrategy;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;
const DEFAULT_COLD_FACTOR: u32 = 3;

/// Produces the effective threshold for the current instant.
pub trait TokenCalculator: Send + Sync {
    fn allowed_tokens(&self, node: &ResourceNode) -> f64;
}

/// Applies a shaping policy given the demand and the effective threshold.
pub trait TrafficShapingChecker: Send + Sync {
    fn do_check(&self, node: &ResourceNode, batch_count: u32, threshold: f64) -> TokenResult;
}

/// The runnable form of one [`FlowRule`].
pub struct TrafficShapingController {
    rule: Arc<FlowRule>,
    calculator: Box<dyn TokenCalculator>,
    checker: Box<dyn TrafficShapingChecker>,
}

impl TrafficShapingController {
    pub fn from_rule(rule: FlowRule) -> Result<Self, RuleError> {
        rule.validate()?;
        let rule = Arc::new(rule);

        let calculator: Box<dyn TokenCalculator> = match rule.token_calculate_strategy {
            TokenCalculateStrategy::Direct => Box::new(DirectCalculator {
                threshold: rule.threshold,
            }),
            TokenCalculateStrategy::WarmUp => Box::new(WarmUpCalculator::from_rule(&rule)),
        };

        let checker: Box<dyn TrafficShapingChecker> = match rule.control_behavior {
            ControlBehavior::Reject => Box::new(RejectChecker { rule: rule.clone() }),
            ControlBehavior::Throttling => Box::new(ThrottlingChecker::new(rule.clone())),
        };

        Ok(Self {
            rule,
            calculator,
            checker,
        })
    }

    #[inline]
    pub fn rule(&self) -> &Arc<FlowRule> {
        &self.rule
    }

    /// Evaluate this controller against `node` for `batch_count` units.
    pub fn perform_checking(&self, node: &ResourceNode, batch_count: u32) -> TokenResult {
        let threshold = self.calculator.allowed_tokens(node);
        self.checker.do_check(node, batch_count, threshold)
    }
}

impl std::fmt::Debug for TrafficShapingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafficShapingController")
            .field("rule", &self.rule)
            .finish()
    }
}

/// Returns the rule's static threshold unchanged.
pub struct DirectCalculator {
    threshold: f64,
}

impl TokenCalculator for DirectCalculator {
    fn allowed_tokens(&self, _node: &ResourceNode) -> f64 {
        self.threshold
    }
}

/// Ramps the threshold up from `threshold / cold_factor` while the resource
/// is cold.
///
/// A token store refills at the rule threshold per second and drains by the
/// previous second's pass rate. While the store sits above the warning line
/// the resource is considered cold and the permitted rate is interpolated
/// down the slope; once traffic has eaten the stored tokens the full
/// threshold applies.
pub struct WarmUpCalculator {
    threshold: f64,
    cold_factor: u32,
    warning_token: u64,
    max_token: u64,
    slope: f64,
    stored_tokens: AtomicI64,
    last_filled_millis: AtomicU64,
}

impl WarmUpCalculator {
    pub(crate) fn from_rule(rule: &FlowRule) -> Self {
        let mut cold_factor = rule.warm_up_cold_factor;
        if cold_factor <= 1 {
            tracing::warn!(
                resource = %rule.resource,
                cold_factor,
                "warm-up cold factor must exceed 1, using default"
            );
            cold_factor = DEFAULT_COLD_FACTOR;
        }
        let threshold = rule.threshold;
        let period = rule.warm_up_period_sec as f64;
        let warning_token = ((period * threshold) / (cold_factor as f64 - 1.0)) as u64;
        let max_token =
            warning_token + (2.0 * period * threshold / (1.0 + cold_factor as f64)) as u64;
        let slope =
            (cold_factor as f64 - 1.0) / threshold / (max_token - warning_token).max(1) as f64;

        Self {
            threshold,
            cold_factor,
            warning_token,
            max_token,
            slope,
            stored_tokens: AtomicI64::new(0),
            last_filled_millis: AtomicU64::new(0),
        }
    }

    fn sync_token(&self, pass_qps: f64) {
        let now = clock::now_millis();
        let current_sec_start = now - now % 1000;
        let last_filled = self.last_filled_millis.load(Ordering::Acquire);
        if current_sec_start <= last_filled {
            return;
        }
        if self
            .last_filled_millis
            .compare_exchange(
                last_filled,
                current_sec_start,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return;
        }

        let old_value = self.stored_tokens.load(Ordering::Acquire);
        let refilled = self.cool_down_tokens(current_sec_start, last_filled, old_value, pass_qps);
        self.stored_tokens.store(refilled, Ordering::Release);
        if self
            .stored_tokens
            .fetch_sub(pass_qps as i64, Ordering::AcqRel)
            - (pass_qps as i64)
            < 0
        {
            self.stored_tokens.store(0, Ordering::Release);
        }
    }

    fn cool_down_tokens(
        &self,
        now_ms: u64,
        last_filled: u64,
        old_value: i64,
        pass_qps: f64,
    ) -> i64 {
        let mut new_value = old_value;
        // Refill only while cold: below the warning line, or traffic too
        // light to keep the store drained.
        if (old_value as f64) < self.warning_token as f64
            || pass_qps < self.threshold / self.cold_factor as f64
        {
            let elapsed_ms = now_ms.saturating_sub(last_filled);
            new_value = old_value + ((elapsed_ms as f64 * self.threshold) / 1000.0) as i64;
        }
        new_value.min(self.max_token as i64)
    }
}

impl TokenCalculator for WarmUpCalculator {
    fn allowed_tokens(&self, node: &ResourceNode) -> f64 {
        let previous_qps = node.previous_qps(MetricEvent::Pass);
        self.sync_token(previous_qps);

        let stored = self.stored_tokens.load(Ordering::Acquire);
        if stored >= self.warning_token as i64 {
            let above = (stored - self.warning_token as i64) as f64;
            1.0 / (above * self.slope + 1.0 / self.threshold)
        } else {
            self.threshold
        }
    }
}

/// Rejects once the window's pass rate plus the new demand exceeds the
/// threshold.
pub struct RejectChecker {
    rule: Arc<FlowRule>,
}

impl TrafficShapingChecker for RejectChecker {
    fn do_check(&self, node: &ResourceNode, batch_count: u32, threshold: f64) -> TokenResult {
        let current = node.qps(MetricEvent::Pass);
        if current + batch_count as f64 > threshold {
            return TokenResult::Blocked(
                BlockError::new(BlockType::Flow, "pass rate over threshold")
                    .with_rule(self.rule.clone()),
            );
        }
        TokenResult::Pass
    }
}

/// Spaces passes one token interval apart, queueing short waits.
///
/// `last_passed_nanos` is the timestamp the previous request was granted.
/// Each arrival either claims "now" (the line is empty), claims the next
/// interval slot and reports the wait, or is rejected when the implied wait
/// exceeds the queueing budget. The empty-line claim is a compare-exchange
/// that elects a single winner per interval; the slot claim is an atomic
/// add with a rollback on the over-budget path, so concurrent arrivals
/// each reserve a distinct slot.
pub struct ThrottlingChecker {
    rule: Arc<FlowRule>,
    last_passed_nanos: AtomicU64,
}

impl ThrottlingChecker {
    pub(crate) fn new(rule: Arc<FlowRule>) -> Self {
        Self {
            rule,
            last_passed_nanos: AtomicU64::new(0),
        }
    }

    fn blocked(&self, msg: &'static str) -> TokenResult {
        TokenResult::Blocked(BlockError::new(BlockType::Flow, msg).with_rule(self.rule.clone()))
    }
}

impl TrafficShapingChecker for ThrottlingChecker {
    fn do_check(&self, _node: &ResourceNode, batch_count: u32, threshold: f64) -> TokenResult {
        if batch_count == 0 {
            return TokenResult::Pass;
        }
        if threshold <= 0.0 {
            return self.blocked("throttling threshold is zero");
        }

        let interval_ns = ((batch_count as f64 / threshold) * NANOS_PER_SEC).round() as u64;
        let max_queue_ns = match self.rule.max_queueing_time_ms {
            None => interval_ns,
            Some(ms) => ms * 1_000_000,
        };
        let now = clock::now_nanos();

        loop {
            let last = self.last_passed_nanos.load(Ordering::Acquire);
            let expected = last + interval_ns;
            if expected <= now {
                // The line is empty; exactly one caller may claim now as
                // the grant time. Losers re-read and queue behind the
                // winner.
                if self
                    .last_passed_nanos
                    .compare_exchange_weak(last, now, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    return TokenResult::Pass;
                }
                continue;
            }
            if expected - now > max_queue_ns {
                return self.blocked("queueing time over limit");
            }

            let granted = self
                .last_passed_nanos
                .fetch_add(interval_ns, Ordering::AcqRel)
                + interval_ns;
            let wait = granted.saturating_sub(now);
            if wait > max_queue_ns {
                self.last_passed_nanos
                    .fetch_sub(interval_ns, Ordering::AcqRel);
                return self.blocked("queueing time over limit");
            }
            return if wait > 0 {
                TokenResult::ShouldWait {
                    nanos_to_wait: wait,
                }
            } else {
                TokenResult::Pass
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ResourceType;
    use std::sync::Arc;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn node(name: &str) -> ResourceNode {
        ResourceNode::new(name, ResourceType::Common).unwrap()
    }

    fn throttling_rule(name: &str, threshold: f64, max_queue_ms: Option<u64>) -> FlowRule {
        FlowRule {
            resource: name.into(),
            threshold,
            control_behavior: ControlBehavior::Throttling,
            max_queueing_time_ms: max_queue_ms,
            ..FlowRule::default()
        }
    }

    #[test]
    fn reject_checker_blocks_over_threshold() {
        let node = node("ctl_reject_test");
        let controller = TrafficShapingController::from_rule(FlowRule {
            resource: "ctl_reject_test".into(),
            threshold: 2.0,
            ..FlowRule::default()
        })
        .unwrap();

        assert!(controller.perform_checking(&node, 1).is_pass());
        node.add_count(MetricEvent::Pass, 1);
        assert!(controller.perform_checking(&node, 1).is_pass());
        node.add_count(MetricEvent::Pass, 1);
        let result = controller.perform_checking(&node, 1);
        assert!(result.is_blocked());
        let err = result.block_error().unwrap();
        assert_eq!(err.block_type(), BlockType::Flow);
        assert_eq!(err.triggered_rule().unwrap().threshold, 2.0);
    }

    #[test]
    fn reject_checker_with_zero_threshold_blocks_everything() {
        let node = node("ctl_zero_threshold_test");
        let controller = TrafficShapingController::from_rule(FlowRule {
            resource: "ctl_zero_threshold_test".into(),
            threshold: 0.0,
            ..FlowRule::default()
        })
        .unwrap();
        assert!(controller.perform_checking(&node, 1).is_blocked());
    }

    #[test]
    fn throttling_first_pass_is_immediate() {
        let node = node("ctl_throttle_first_test");
        let controller = TrafficShapingController::from_rule(throttling_rule(
            "ctl_throttle_first_test",
            10.0,
            Some(500),
        ))
        .unwrap();
        assert!(controller.perform_checking(&node, 1).is_pass());
    }

    #[test]
    fn throttling_spaces_out_subsequent_passes() {
        let node = node("ctl_throttle_spacing_test");
        let controller = TrafficShapingController::from_rule(throttling_rule(
            "ctl_throttle_spacing_test",
            20.0,
            Some(500),
        ))
        .unwrap();
        let interval_ns = 50_000_000u64;

        assert!(controller.perform_checking(&node, 1).is_pass());

        let second = controller.perform_checking(&node, 1);
        let wait = second.nanos_to_wait();
        assert!(wait > 0 && wait <= interval_ns, "wait was {wait}ns");

        let third = controller.perform_checking(&node, 1);
        let wait = third.nanos_to_wait();
        assert!(
            wait > interval_ns && wait <= 2 * interval_ns,
            "wait was {wait}ns"
        );
    }

    #[test]
    fn throttling_rejects_once_queue_budget_is_spent() {
        let node = node("ctl_throttle_budget_test");
        // 10 qps and a default budget of one interval: two queued requests
        // already exceed it.
        let controller = TrafficShapingController::from_rule(throttling_rule(
            "ctl_throttle_budget_test",
            10.0,
            None,
        ))
        .unwrap();

        assert!(controller.perform_checking(&node, 1).is_pass());
        assert!(matches!(
            controller.perform_checking(&node, 1),
            TokenResult::ShouldWait { .. }
        ));
        assert!(controller.perform_checking(&node, 1).is_blocked());
    }

    #[test]
    fn throttling_with_zero_budget_never_waits() {
        let node = node("ctl_throttle_zero_budget_test");
        let controller = TrafficShapingController::from_rule(throttling_rule(
            "ctl_throttle_zero_budget_test",
            10.0,
            Some(0),
        ))
        .unwrap();

        assert!(controller.perform_checking(&node, 1).is_pass());
        assert!(controller.perform_checking(&node, 1).is_blocked());
    }

    #[test]
    fn throttling_concurrent_callers_claim_distinct_slots() {
        let node = Arc::new(node("ctl_throttle_concurrent_test"));
        // 2 qps means one 500ms slot; a 2s budget queues at most 4 more
        // behind the immediate pass.
        let controller = Arc::new(
            TrafficShapingController::from_rule(throttling_rule(
                "ctl_throttle_concurrent_test",
                2.0,
                Some(2000),
            ))
            .unwrap(),
        );

        let threads = 8;
        let per_thread = 4;
        let barrier = Arc::new(Barrier::new(threads));
        let mut handles = vec![];
        for _ in 0..threads {
            let controller = Arc::clone(&controller);
            let node = Arc::clone(&node);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                let mut passes = 0usize;
                let mut waits = Vec::new();
                let mut blocks = 0usize;
                for _ in 0..per_thread {
                    match controller.perform_checking(&node, 1) {
                        TokenResult::Pass => passes += 1,
                        TokenResult::ShouldWait { nanos_to_wait } => waits.push(nanos_to_wait),
                        TokenResult::Blocked(_) => blocks += 1,
                    }
                }
                (passes, waits, blocks)
            }));
        }

        let mut passes = 0usize;
        let mut waits = Vec::new();
        let mut blocks = 0usize;
        for handle in handles {
            let (p, w, b) = handle.join().unwrap();
            passes += p;
            waits.extend(w);
            blocks += b;
        }

        assert_eq!(
            passes, 1,
            "exactly one concurrent caller may claim the empty line"
        );
        assert!(
            waits.len() <= 4,
            "granted {} waits for a 4-slot queue",
            waits.len()
        );
        assert_eq!(passes + waits.len() + blocks, threads * per_thread);
        for wait in &waits {
            assert!(
                *wait <= 2_000_000_000,
                "granted wait {wait}ns exceeds the queueing budget"
            );
        }
    }

    #[test]
    fn throttling_zero_threshold_blocks() {
        let node = node("ctl_throttle_zero_qps_test");
        let controller = TrafficShapingController::from_rule(throttling_rule(
            "ctl_throttle_zero_qps_test",
            0.0,
            Some(100),
        ))
        .unwrap();
        assert!(controller.perform_checking(&node, 1).is_blocked());
    }

    #[test]
    fn warm_up_starts_at_the_cold_rate() {
        let rule = FlowRule {
            resource: "ctl_warmup_cold_test".into(),
            threshold: 100.0,
            token_calculate_strategy: TokenCalculateStrategy::WarmUp,
            warm_up_period_sec: 10,
            warm_up_cold_factor: 3,
            ..FlowRule::default()
        };
        let calculator = WarmUpCalculator::from_rule(&rule);
        let node = node("ctl_warmup_cold_test");

        // A second with no traffic fills the token store to its maximum, so
        // the permitted rate sits at the bottom of the slope.
        std::thread::sleep(Duration::from_millis(1100));
        let allowed = calculator.allowed_tokens(&node);
        assert!(
            allowed < rule.threshold / 2.0,
            "cold resource allowed {allowed} qps"
        );
        assert!(
            (allowed - rule.threshold / 3.0).abs() < rule.threshold * 0.05,
            "cold rate {allowed} is far from threshold/cold_factor"
        );
    }

    #[test]
    fn warm_up_defaults_a_degenerate_cold_factor() {
        let rule = FlowRule {
            resource: "ctl_warmup_factor_test".into(),
            threshold: 100.0,
            token_calculate_strategy: TokenCalculateStrategy::WarmUp,
            warm_up_period_sec: 5,
            warm_up_cold_factor: 1,
            ..FlowRule::default()
        };
        let calculator = WarmUpCalculator::from_rule(&rule);
        assert_eq!(calculator.cold_factor, DEFAULT_COLD_FACTOR);
    }
}
