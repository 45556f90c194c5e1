use crate::executor::{ExecutionResult, ExecutionStatus};
use crate::input::Input;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The accept/reject classification of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    Accepted,
    /// Non-zero exit code, or killed by a signal.
    Rejected,
    TimedOut,
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Accepted => "accepted",
            Verdict::Rejected => "rejected",
            Verdict::TimedOut => "timed out",
        })
    }
}

/// An `Oracle` decides whether a target behaved acceptably for one input.
///
/// Oracles only classify; what happens to a non-accepted input (halt or
/// record-and-continue) is the campaign's failure policy.
pub trait Oracle<I: Input> {
    fn judge(&self, input: &I, result: &ExecutionResult) -> Verdict;
}

/// Accepts exactly the executions that exited with one of `accepted_codes` (by default `0`).
#[derive(Debug, Clone)]
pub struct ExitCodeOracle {
    accepted_codes: Vec<i32>,
}

impl ExitCodeOracle {
    pub fn new() -> Self {
        Self {
            accepted_codes: vec![0],
        }
    }

    pub fn with_accepted_codes(accepted_codes: Vec<i32>) -> Self {
        Self { accepted_codes }
    }
}

impl Default for ExitCodeOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Input> Oracle<I> for ExitCodeOracle {
    fn judge(&self, _input: &I, result: &ExecutionResult) -> Verdict {
        match result.status {
            ExecutionStatus::Exited(code) if self.accepted_codes.contains(&code) => {
                Verdict::Accepted
            }
            ExecutionStatus::Exited(_) | ExecutionStatus::Signaled(_) => Verdict::Rejected,
            ExecutionStatus::TimedOut => Verdict::TimedOut,
        }
    }
}
