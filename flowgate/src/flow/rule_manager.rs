//! The per-resource controller registry.
//!
//! Readers on the hot path clone an `Arc` snapshot of the whole map and
//! never contend with rule loading; loaders build a fresh map and swap it
//! in atomically.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::RwLock;

use super::controller::TrafficShapingController;
use super::rule::FlowRule;
use super::rule::RuleError;

type ControllerMap = HashMap<String, Vec<Arc<TrafficShapingController>>>;

static CONTROLLERS: OnceLock<RwLock<Arc<ControllerMap>>> = OnceLock::new();

fn registry() -> &'static RwLock<Arc<ControllerMap>> {
    CONTROLLERS.get_or_init(|| RwLock::new(Arc::new(HashMap::new())))
}

fn snapshot() -> Arc<ControllerMap> {
    registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Controllers registered for `resource`, in rule order.
pub(crate) fn controllers_for(resource: &str) -> Vec<Arc<TrafficShapingController>> {
    snapshot().get(resource).cloned().unwrap_or_default()
}

/// The rules currently loaded for `resource`.
pub fn flow_rules_of_resource(resource: &str) -> Vec<FlowRule> {
    controllers_for(resource)
        .iter()
        .map(|c| c.rule().as_ref().clone())
        .collect()
}

/// Atomically replace the entire rule set.
///
/// Invalid rules are discarded with a warning; a non-empty valid subset
/// still loads. Returns whether the effective rule set changed. Fails only
/// when a non-empty input contains no valid rule at all.
pub fn load_flow_rules(rules: Vec<FlowRule>) -> Result<bool, RuleError> {
    let had_input = !rules.is_empty();
    let mut new_map: ControllerMap = HashMap::new();
    for rule in rules {
        match TrafficShapingController::from_rule(rule.clone()) {
            Ok(controller) => new_map
                .entry(rule.resource.clone())
                .or_default()
                .push(Arc::new(controller)),
            Err(err) => {
                tracing::warn!(resource = %rule.resource, %err, "discarding invalid flow rule");
            }
        }
    }
    if had_input && new_map.is_empty() {
        return Err(RuleError::NoValidRules);
    }

    let mut guard = registry().write().unwrap_or_else(PoisonError::into_inner);
    let changed = !same_rules(&guard, &new_map);
    *guard = Arc::new(new_map);
    Ok(changed)
}

/// Atomically replace the rules of a single resource, leaving every other
/// resource untouched. An empty `rules` clears the resource.
pub fn load_flow_rules_of_resource(
    resource: &str,
    rules: Vec<FlowRule>,
) -> Result<bool, RuleError> {
    if resource.is_empty() {
        return Err(RuleError::EmptyResource);
    }
    let had_input = !rules.is_empty();
    let mut controllers: Vec<Arc<TrafficShapingController>> = Vec::with_capacity(rules.len());
    for rule in rules {
        if rule.resource != resource {
            tracing::warn!(
                expected = resource,
                found = %rule.resource,
                "discarding flow rule loaded under the wrong resource"
            );
            continue;
        }
        match TrafficShapingController::from_rule(rule.clone()) {
            Ok(controller) => controllers.push(Arc::new(controller)),
            Err(err) => {
                tracing::warn!(resource = %rule.resource, %err, "discarding invalid flow rule");
            }
        }
    }
    if had_input && controllers.is_empty() {
        return Err(RuleError::NoValidRules);
    }

    let mut guard = registry().write().unwrap_or_else(PoisonError::into_inner);
    let mut new_map: ControllerMap = guard.as_ref().clone();
    let changed = if controllers.is_empty() {
        new_map.remove(resource).is_some()
    } else {
        let before: Vec<FlowRule> = new_map
            .get(resource)
            .map(|list| list.iter().map(|c| c.rule().as_ref().clone()).collect())
            .unwrap_or_default();
        let after: Vec<FlowRule> = controllers
            .iter()
            .map(|c| c.rule().as_ref().clone())
            .collect();
        new_map.insert(resource.to_string(), controllers);
        before != after
    };
    *guard = Arc::new(new_map);
    Ok(changed)
}

/// Drop every loaded rule.
pub fn clear_flow_rules() {
    let mut guard = registry().write().unwrap_or_else(PoisonError::into_inner);
    *guard = Arc::new(HashMap::new());
}

fn same_rules(current: &ControllerMap, next: &ControllerMap) -> bool {
    if current.len() != next.len() {
        return false;
    }
    current.iter().all(|(resource, controllers)| {
        next.get(resource).is_some_and(|other| {
            controllers.len() == other.len()
                && controllers
                    .iter()
                    .zip(other.iter())
                    .all(|(a, b)| a.rule().as_ref() == b.rule().as_ref())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::rule::ControlBehavior;
    use crate::tests::rule_test_guard;

    fn rule(resource: &str, threshold: f64) -> FlowRule {
        FlowRule {
            resource: resource.into(),
            threshold,
            ..FlowRule::default()
        }
    }

    #[test]
    fn per_resource_load_and_fetch() {
        let _guard = rule_test_guard();
        let changed =
            load_flow_rules_of_resource("mgr_fetch_test", vec![rule("mgr_fetch_test", 5.0)])
                .unwrap();
        assert!(changed);

        let loaded = flow_rules_of_resource("mgr_fetch_test");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].threshold, 5.0);

        // Reloading the identical rule reports no change.
        let changed =
            load_flow_rules_of_resource("mgr_fetch_test", vec![rule("mgr_fetch_test", 5.0)])
                .unwrap();
        assert!(!changed);
    }

    #[test]
    fn invalid_rules_are_discarded() {
        let _guard = rule_test_guard();
        let changed = load_flow_rules_of_resource(
            "mgr_discard_test",
            vec![
                rule("mgr_discard_test", -3.0),
                rule("mgr_discard_test", 7.0),
            ],
        )
        .unwrap();
        assert!(changed);
        let loaded = flow_rules_of_resource("mgr_discard_test");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].threshold, 7.0);
    }

    #[test]
    fn all_invalid_is_an_error() {
        let result =
            load_flow_rules_of_resource("mgr_all_invalid_test", vec![rule("mgr_all_invalid_test", f64::NAN)]);
        assert!(matches!(result, Err(RuleError::NoValidRules)));
    }

    #[test]
    fn wrong_resource_rules_are_discarded() {
        let _guard = rule_test_guard();
        let result = load_flow_rules_of_resource(
            "mgr_wrong_res_test",
            vec![rule("somebody_else", 4.0), rule("mgr_wrong_res_test", 4.0)],
        );
        assert!(result.unwrap());
        assert_eq!(flow_rules_of_resource("mgr_wrong_res_test").len(), 1);
    }

    #[test]
    fn empty_load_clears_the_resource() {
        let _guard = rule_test_guard();
        load_flow_rules_of_resource("mgr_clear_one_test", vec![rule("mgr_clear_one_test", 1.0)])
            .unwrap();
        let changed = load_flow_rules_of_resource("mgr_clear_one_test", vec![]).unwrap();
        assert!(changed);
        assert!(flow_rules_of_resource("mgr_clear_one_test").is_empty());
    }

    #[test]
    fn global_load_replaces_the_whole_set() {
        let _guard = rule_test_guard();
        load_flow_rules(vec![
            rule("mgr_global_a", 1.0),
            rule("mgr_global_a", 2.0),
            rule("mgr_global_b", 3.0),
        ])
        .unwrap();
        assert_eq!(flow_rules_of_resource("mgr_global_a").len(), 2);
        assert_eq!(flow_rules_of_resource("mgr_global_b").len(), 1);

        let changed = load_flow_rules(vec![rule("mgr_global_b", 3.0)]).unwrap();
        assert!(changed);
        assert!(flow_rules_of_resource("mgr_global_a").is_empty());

        clear_flow_rules();
        assert!(flow_rules_of_resource("mgr_global_b").is_empty());
        // Replacing an empty set with an empty set changes nothing.
        assert!(!load_flow_rules(vec![]).unwrap());
    }

    #[test]
    fn controllers_keep_rule_order() {
        let _guard = rule_test_guard();
        let first = rule("mgr_order_test", 10.0);
        let second = FlowRule {
            control_behavior: ControlBehavior::Throttling,
            max_queueing_time_ms: Some(100),
            ..rule("mgr_order_test", 20.0)
        };
        load_flow_rules_of_resource("mgr_order_test", vec![first, second]).unwrap();

        let controllers = controllers_for("mgr_order_test");
        assert_eq!(controllers.len(), 2);
        assert_eq!(controllers[0].rule().threshold, 10.0);
        assert_eq!(controllers[1].rule().threshold, 20.0);
    }
}
