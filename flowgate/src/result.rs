//! Outcome of a rule check and the caller-visible rejection error.

use std::fmt;
use std::sync::Arc;

use crate::flow::FlowRule;

/// Which family of rule produced a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Flow,
    Custom,
}

impl BlockType {
    /// Label value used on the handled-entries counter.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Flow => "flow",
            BlockType::Custom => "custom",
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned to the caller when an entry is rejected.
#[derive(Debug, Clone, thiserror::Error)]
#[error("blocked by {block_type} rule: {block_msg}")]
pub struct BlockError {
    block_type: BlockType,
    block_msg: String,
    rule: Option<Arc<FlowRule>>,
}

impl BlockError {
    pub fn new(block_type: BlockType, block_msg: impl Into<String>) -> Self {
        Self {
            block_type,
            block_msg: block_msg.into(),
            rule: None,
        }
    }

    pub fn with_rule(mut self, rule: Arc<FlowRule>) -> Self {
        self.rule = Some(rule);
        self
    }

    #[inline]
    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    #[inline]
    pub fn block_msg(&self) -> &str {
        &self.block_msg
    }

    /// The rule that rejected the entry, when one did.
    #[inline]
    pub fn triggered_rule(&self) -> Option<&Arc<FlowRule>> {
        self.rule.as_ref()
    }
}

/// Result of a single rule check.
#[derive(Debug, Clone, Default)]
pub enum TokenResult {
    /// The entry may proceed.
    #[default]
    Pass,
    /// The entry is rejected; the error is handed back to the caller.
    Blocked(BlockError),
    /// The entry may proceed after waiting; the chain performs the wait.
    ShouldWait { nanos_to_wait: u64 },
}

impl TokenResult {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, TokenResult::Pass)
    }

    #[inline]
    pub fn is_blocked(&self) -> bool {
        matches!(self, TokenResult::Blocked(_))
    }

    pub fn block_error(&self) -> Option<&BlockError> {
        match self {
            TokenResult::Blocked(err) => Some(err),
            _ => None,
        }
    }

    pub fn nanos_to_wait(&self) -> u64 {
        match self {
            TokenResult::ShouldWait { nanos_to_wait } => *nanos_to_wait,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_result_accessors() {
        assert!(TokenResult::Pass.is_pass());
        assert!(!TokenResult::Pass.is_blocked());

        let blocked = TokenResult::Blocked(BlockError::new(BlockType::Flow, "over threshold"));
        assert!(blocked.is_blocked());
        assert_eq!(blocked.block_error().unwrap().block_type(), BlockType::Flow);

        let wait = TokenResult::ShouldWait {
            nanos_to_wait: 1_500,
        };
        assert_eq!(wait.nanos_to_wait(), 1_500);
        assert!(!wait.is_blocked());
    }

    #[test]
    fn block_error_displays_reason() {
        let err = BlockError::new(BlockType::Flow, "qps over threshold");
        let text = err.to_string();
        assert!(text.contains("flow"));
        assert!(text.contains("qps over threshold"));
    }
}
