//! Error surface shared by the weft crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical error type for the trace engine.
///
/// Every variant except [`WeftError::Assertion`] leaves the trace in the
/// state it had before the failing directive or kernel step. An `Assertion`
/// means a structural invariant of the graph was broken; the trace is
/// poisoned and must be discarded by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum WeftError {
    /// A value accessor was applied to a value of the wrong kind.
    #[error("type mismatch: expected {expected}, got {got}")]
    Type {
        /// Kind the accessor required.
        expected: String,
        /// Kind the value actually had.
        got: String,
    },
    /// A symbol lookup missed every frame of the environment chain.
    #[error("unbound symbol: {0}")]
    UnboundSymbol(String),
    /// A stochastic procedure was applied to the wrong number of operands.
    #[error("{sp} expected {expected} operands, got {got}")]
    Arity {
        /// Name of the procedure that rejected the application.
        sp: String,
        /// Number of operands the procedure requires.
        expected: usize,
        /// Number of operands it received.
        got: usize,
    },
    /// An observation targeted a node that cannot be constrained.
    #[error("cannot constrain: {0}")]
    Observation(String),
    /// An observation drove the insertion weight to negative infinity.
    #[error("observation could not be propagated")]
    UnpropagatedObservation,
    /// The same random choice was constrained twice.
    #[error("random choice is already constrained")]
    DoubleConstrain,
    /// Collapsed-count inference was requested from a procedure without it.
    #[error("{0} does not support arbitrary-ergodic count inference")]
    UnsupportedAaa(String),
    /// A structural invariant of the trace graph failed.
    #[error("trace invariant violated: {0}")]
    Assertion(String),
}

impl WeftError {
    /// Builds a [`WeftError::Type`] from the two kind names.
    pub fn type_mismatch(expected: &str, got: &str) -> Self {
        WeftError::Type {
            expected: expected.to_owned(),
            got: got.to_owned(),
        }
    }

    /// Builds a [`WeftError::Arity`] for the named procedure.
    pub fn arity(sp: &str, expected: usize, got: usize) -> Self {
        WeftError::Arity {
            sp: sp.to_owned(),
            expected,
            got,
        }
    }

    /// Returns whether the error poisons the trace that raised it.
    pub fn poisons_trace(&self) -> bool {
        matches!(self, WeftError::Assertion(_))
    }
}
