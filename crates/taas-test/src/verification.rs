//! Verification helpers for flow-table state and captured commands.

use std::fmt;

use taas_common::flow::{FlowMatch, FlowRule};
use thiserror::Error;

use crate::fake_switch::{FakeSwitch, FlowSnapshot};

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Expected rule table={table},priority={priority},{matches} on {bridge}, not found")]
    RuleNotFound {
        bridge: String,
        table: u8,
        priority: u16,
        matches: String,
    },

    #[error("Unexpected rule on {bridge}: {rule}")]
    UnexpectedRule { bridge: String, rule: String },

    #[error("Actions mismatch for {rule}: expected '{expected}', got '{actual}'")]
    ActionsMismatch {
        rule: String,
        expected: String,
        actual: String,
    },

    #[error("Rule sets differ:\n{diff}")]
    RuleSetChanged { diff: RuleSetDiff },

    #[error("Ordering violations: {0:?}")]
    OrderingViolation(Vec<String>),

    #[error("Expected command containing '{expected}', captured {captured:?}")]
    CommandNotFound {
        expected: String,
        captured: Vec<String>,
    },

    #[error("Command containing '{unexpected}' was executed")]
    UnexpectedCommand { unexpected: String },

    #[error("Expected {expected} commands, found {actual}")]
    CommandCountMismatch { expected: usize, actual: usize },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Rules added and removed between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSetDiff {
    pub added: Vec<(String, FlowRule)>,
    pub removed: Vec<(String, FlowRule)>,
}

impl RuleSetDiff {
    pub fn between(before: &FlowSnapshot, after: &FlowSnapshot) -> Self {
        let mut diff = RuleSetDiff::default();
        for (bridge, rules) in after {
            let old = before.get(bridge);
            for rule in rules {
                if !old.is_some_and(|o| o.contains(rule)) {
                    diff.added.push((bridge.clone(), rule.clone()));
                }
            }
        }
        for (bridge, rules) in before {
            let new = after.get(bridge);
            for rule in rules {
                if !new.is_some_and(|n| n.contains(rule)) {
                    diff.removed.push((bridge.clone(), rule.clone()));
                }
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl fmt::Display for RuleSetDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (bridge, rule) in &self.added {
            writeln!(f, "+ {} {}", bridge, rule)?;
        }
        for (bridge, rule) in &self.removed {
            writeln!(f, "- {} {}", bridge, rule)?;
        }
        Ok(())
    }
}

/// Flow-table assertions against a [`FakeSwitch`].
pub struct RuleSetVerifier<'a> {
    switch: &'a FakeSwitch,
}

impl<'a> RuleSetVerifier<'a> {
    pub fn new(switch: &'a FakeSwitch) -> Self {
        Self { switch }
    }

    /// Verify that a rule with this table, priority and match exists
    pub fn assert_rule(
        &self,
        bridge: &str,
        table: u8,
        priority: u16,
        matches: &FlowMatch,
    ) -> VerifyResult<FlowRule> {
        self.switch
            .find_flow(bridge, table, priority, matches)
            .ok_or_else(|| VerificationError::RuleNotFound {
                bridge: bridge.to_string(),
                table,
                priority,
                matches: matches.to_string(),
            })
    }

    /// Verify that no rule with this table, priority and match exists
    pub fn assert_no_rule(
        &self,
        bridge: &str,
        table: u8,
        priority: u16,
        matches: &FlowMatch,
    ) -> VerifyResult<()> {
        match self.switch.find_flow(bridge, table, priority, matches) {
            Some(rule) => Err(VerificationError::UnexpectedRule {
                bridge: bridge.to_string(),
                rule: rule.spec(),
            }),
            None => Ok(()),
        }
    }

    /// Verify a rule exists and carries exactly `expected` actions
    pub fn assert_actions(
        &self,
        bridge: &str,
        table: u8,
        priority: u16,
        matches: &FlowMatch,
        expected: &str,
    ) -> VerifyResult<()> {
        let rule = self.assert_rule(bridge, table, priority, matches)?;
        if rule.actions == expected {
            Ok(())
        } else {
            Err(VerificationError::ActionsMismatch {
                rule: rule.match_spec(),
                expected: expected.to_string(),
                actual: rule.actions,
            })
        }
    }

    /// Verify the switch holds exactly the rules of `before`
    pub fn assert_unchanged_since(&self, before: &FlowSnapshot) -> VerifyResult<()> {
        let diff = RuleSetDiff::between(before, &self.switch.snapshot());
        if diff.is_empty() {
            Ok(())
        } else {
            Err(VerificationError::RuleSetChanged { diff })
        }
    }

    /// Verify no rule ever referenced a missing port
    pub fn assert_no_violations(&self) -> VerifyResult<()> {
        let violations = self.switch.violations();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(VerificationError::OrderingViolation(violations))
        }
    }
}

/// Command execution verifier (for mock mode)
pub struct CommandVerifier {
    captured_commands: Vec<String>,
}

impl CommandVerifier {
    pub fn new(captured_commands: Vec<String>) -> Self {
        Self { captured_commands }
    }

    /// Verify that a command containing `expected` was executed
    pub fn assert_command_executed(&self, expected: &str) -> VerifyResult<()> {
        if self
            .captured_commands
            .iter()
            .any(|cmd| cmd.contains(expected))
        {
            Ok(())
        } else {
            Err(VerificationError::CommandNotFound {
                expected: expected.to_string(),
                captured: self.captured_commands.clone(),
            })
        }
    }

    /// Verify that no command containing `unexpected` was executed
    pub fn assert_command_not_executed(&self, unexpected: &str) -> VerifyResult<()> {
        if self
            .captured_commands
            .iter()
            .any(|cmd| cmd.contains(unexpected))
        {
            Err(VerificationError::UnexpectedCommand {
                unexpected: unexpected.to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Verify that `first` was executed before `second`
    pub fn assert_executed_before(&self, first: &str, second: &str) -> VerifyResult<()> {
        let position = |needle: &str| {
            self.captured_commands
                .iter()
                .position(|cmd| cmd.contains(needle))
                .ok_or_else(|| VerificationError::CommandNotFound {
                    expected: needle.to_string(),
                    captured: self.captured_commands.clone(),
                })
        };
        let a = position(first)?;
        let b = position(second)?;
        if a < b {
            Ok(())
        } else {
            Err(VerificationError::CommandNotFound {
                expected: format!("'{}' before '{}'", first, second),
                captured: self.captured_commands.clone(),
            })
        }
    }

    /// Verify the number of commands executed
    pub fn assert_command_count(&self, expected: usize) -> VerifyResult<()> {
        let actual = self.captured_commands.len();
        if actual != expected {
            Err(VerificationError::CommandCountMismatch { expected, actual })
        } else {
            Ok(())
        }
    }

    pub fn captured_commands(&self) -> &[String] {
        &self.captured_commands
    }
}
