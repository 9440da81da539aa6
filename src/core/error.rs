use thiserror::Error;

use super::types::Shares;

/// Everything that can make a scenario invalid.
///
/// None of these are retried internally: evaluation is deterministic per
/// scenario, so a failure means the caller has to change the scenario.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    /// A grant or sale left the share bookkeeping in an impossible state.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("grant {grant}: requested {requested} shares but only {available} are available")]
    InsufficientShares {
        grant: String,
        requested: Shares,
        available: Shares,
    },

    /// Malformed scenario input, e.g. a vesting table that does not reconcile.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(
        "no crossing of {output} >= {target} found while sweeping {input} over [{lo}, {hi}]"
    )]
    SolverNoCrossingFound {
        input: String,
        output: String,
        target: f64,
        lo: f64,
        hi: f64,
    },

    #[error("solver input {input} = {current} lies outside the search range [{lo}, {hi}]")]
    SolverInputOutOfRange {
        input: String,
        current: f64,
        lo: f64,
        hi: f64,
    },

    #[error("invalid solver configuration: {0}")]
    InvalidSolverConfig(String),

    #[error("cycle detected while evaluating: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("unknown grant: {0}")]
    UnknownGrant(String),

    #[error("node {node} holds {found}, expected {expected}")]
    TypeMismatch {
        node: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid date {0:?}; expected m/d/yy, m/d/yyyy or yyyy-mm-dd")]
    InvalidDate(String),
}

impl ModelError {
    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
