//! Flow-control rules and the traffic shaping built on top of the
//! per-resource statistics.

mod controller;
mod rule;
mod rule_manager;
mod slot;

pub use controller::DirectCalculator;
pub use controller::RejectChecker;
pub use controller::ThrottlingChecker;
pub use controller::TokenCalculator;
pub use controller::TrafficShapingChecker;
pub use controller::TrafficShapingController;
pub use controller::WarmUpCalculator;
pub use rule::ControlBehavior;
pub use rule::FlowRule;
pub use rule::RelationStrategy;
pub use rule::RuleError;
pub use rule::TokenCalculateStrategy;
pub use rule_manager::clear_flow_rules;
pub use rule_manager::flow_rules_of_resource;
pub use rule_manager::load_flow_rules;
pub use rule_manager::load_flow_rules_of_resource;
pub use slot::FLOW_SLOT_ORDER;
pub use slot::FlowSlot;
