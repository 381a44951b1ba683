//! The flow rule data model.

use serde::Deserialize;
use serde::Serialize;

/// How the effective threshold is computed at check time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenCalculateStrategy {
    /// The rule's static threshold.
    #[default]
    Direct,
    /// Scale the threshold down while the resource is cold, ramping up over
    /// `warm_up_period_sec`.
    WarmUp,
}

/// What happens when demand exceeds the computed threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlBehavior {
    /// Reject immediately.
    #[default]
    Reject,
    /// Space requests out at the token interval, queueing up to the rule's
    /// maximum queueing time.
    Throttling,
}

/// Which resource's statistics the rule evaluates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationStrategy {
    /// The entry's own resource.
    #[default]
    Direct,
    /// The node of `ref_resource`; lets a hot dependency push back on its
    /// callers.
    AssociatedResource,
}

/// Errors rejecting an individual rule at load time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("flow rule has an empty resource name")]
    EmptyResource,
    #[error("flow rule for {0} has a negative or non-finite threshold")]
    InvalidThreshold(String),
    #[error("associated-resource rule for {0} names no ref_resource")]
    MissingRefResource(String),
    #[error("warm-up rule for {0} has a zero warm_up_period_sec")]
    ZeroWarmUpPeriod(String),
    #[error("no valid rules in the provided set")]
    NoValidRules,
}

/// A single flow-control rule for one resource.
///
/// `max_queueing_time_ms` only applies to throttling rules: `None` tolerates
/// queueing up to one token interval, `Some(0)` tolerates no wait at all,
/// `Some(n)` caps queueing at `n` milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowRule {
    pub resource: String,
    pub threshold: f64,
    pub token_calculate_strategy: TokenCalculateStrategy,
    pub control_behavior: ControlBehavior,
    pub relation_strategy: RelationStrategy,
    pub ref_resource: String,
    /// Statistic window the threshold is expressed over, in milliseconds.
    /// `0` means the resource node's configured window; other values are
    /// accepted but evaluated against the node window with a warning.
    pub stat_interval_in_ms: u32,
    pub max_queueing_time_ms: Option<u64>,
    pub warm_up_period_sec: u32,
    pub warm_up_cold_factor: u32,
}

impl Default for FlowRule {
    fn default() -> Self {
        Self {
            resource: String::new(),
            threshold: 0.0,
            token_calculate_strategy: TokenCalculateStrategy::default(),
            control_behavior: ControlBehavior::default(),
            relation_strategy: RelationStrategy::default(),
            ref_resource: String::new(),
            stat_interval_in_ms: 0,
            max_queueing_time_ms: None,
            warm_up_period_sec: 0,
            warm_up_cold_factor: 0,
        }
    }
}

impl FlowRule {
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.resource.is_empty() {
            return Err(RuleError::EmptyResource);
        }
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(RuleError::InvalidThreshold(self.resource.clone()));
        }
        if self.relation_strategy == RelationStrategy::AssociatedResource
            && self.ref_resource.is_empty()
        {
            return Err(RuleError::MissingRefResource(self.resource.clone()));
        }
        if self.token_calculate_strategy == TokenCalculateStrategy::WarmUp
            && self.warm_up_period_sec == 0
        {
            return Err(RuleError::ZeroWarmUpPeriod(self.resource.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rule_is_invalid_only_for_its_empty_name() {
        let rule = FlowRule {
            resource: "orders".into(),
            ..FlowRule::default()
        };
        rule.validate().unwrap();
        assert!(matches!(
            FlowRule::default().validate(),
            Err(RuleError::EmptyResource)
        ));
    }

    #[test]
    fn negative_threshold_is_rejected() {
        let rule = FlowRule {
            resource: "orders".into(),
            threshold: -1.0,
            ..FlowRule::default()
        };
        assert!(matches!(
            rule.validate(),
            Err(RuleError::InvalidThreshold(_))
        ));
    }

    #[test]
    fn associated_rules_need_a_ref() {
        let rule = FlowRule {
            resource: "orders".into(),
            relation_strategy: RelationStrategy::AssociatedResource,
            ..FlowRule::default()
        };
        assert!(matches!(
            rule.validate(),
            Err(RuleError::MissingRefResource(_))
        ));

        let rule = FlowRule {
            ref_resource: "inventory".into(),
            ..rule
        };
        rule.validate().unwrap();
    }

    #[test]
    fn warm_up_rules_need_a_period() {
        let rule = FlowRule {
            resource: "orders".into(),
            threshold: 100.0,
            token_calculate_strategy: TokenCalculateStrategy::WarmUp,
            ..FlowRule::default()
        };
        assert!(matches!(
            rule.validate(),
            Err(RuleError::ZeroWarmUpPeriod(_))
        ));
    }

    #[test]
    fn rules_deserialize_with_defaults() {
        let rule: FlowRule = toml::from_str(
            r#"
            resource = "orders"
            threshold = 50.0
            control_behavior = "throttling"
            max_queueing_time_ms = 200
            "#,
        )
        .unwrap();
        assert_eq!(rule.resource, "orders");
        assert_eq!(rule.control_behavior, ControlBehavior::Throttling);
        assert_eq!(rule.max_queueing_time_ms, Some(200));
        assert_eq!(rule.relation_strategy, RelationStrategy::Direct);
    }
}
