//! Structural invariant checks.
//!
//! A failed check is an [`WeftError::Assertion`]: the trace is poisoned and
//! callers must discard it. The checks run after detaches inside the engine
//! and are exercised heavily by the test suite.

use std::collections::BTreeSet;

use weft_core::{NodeId, WeftError};

use crate::node::NodeKind;
use crate::scaffold::Scaffold;
use crate::trace::Trace;

/// After a detach, every resampling node must be a hole: regeneration count
/// zero, no value, inactive.
pub fn assert_torus(trace: &Trace, scaffold: &Scaffold) -> Result<(), WeftError> {
    for node in scaffold.resampling_nodes() {
        if scaffold.regen_count(node)? != 0 {
            return Err(WeftError::Assertion(format!(
                "node {node:?} kept a non-zero regen count through detach"
            )));
        }
        let state = trace.node(node)?;
        if state.value.is_some() || state.is_active {
            return Err(WeftError::Assertion(format!(
                "node {node:?} stayed live through detach"
            )));
        }
    }
    Ok(())
}

/// Every ESR root's request count must equal the number of distinct outputs
/// holding it as an ESR parent.
pub fn check_request_counts(trace: &Trace) -> Result<(), WeftError> {
    let mut counted: std::collections::BTreeMap<NodeId, usize> = Default::default();
    for output in trace.outputs_with_esr_parents() {
        for root in trace.esr_parents(output) {
            *counted.entry(*root).or_insert(0) += 1;
        }
    }
    for (root, expected) in &counted {
        if trace.num_requests(*root) != *expected {
            return Err(WeftError::Assertion(format!(
                "request count of {root:?} is {}, edges say {expected}",
                trace.num_requests(*root)
            )));
        }
    }
    for root in trace.roots_with_requests() {
        if !counted.contains_key(&root) && trace.num_requests(root) != 0 {
            return Err(WeftError::Assertion(format!(
                "request count of {root:?} is {} with no referencing outputs",
                trace.num_requests(root)
            )));
        }
    }
    Ok(())
}

/// The constrained and unconstrained sets must partition the active random
/// choices.
pub fn check_choice_partition(trace: &Trace) -> Result<(), WeftError> {
    let unconstrained = trace.unconstrained_choices();
    let constrained = trace.constrained_choices();
    if let Some(node) = unconstrained.intersection(constrained).next() {
        return Err(WeftError::Assertion(format!(
            "choice {node:?} is both constrained and unconstrained"
        )));
    }
    let mut expected = BTreeSet::new();
    for (id, node) in trace.active_nodes() {
        if !matches!(
            node.kind,
            NodeKind::Request { .. } | NodeKind::Output { .. }
        ) {
            continue;
        }
        let sp = trace.sp_at(id)?;
        let slot = trace.psp_slot(id)?;
        if sp.psp(slot).is_random() {
            expected.insert(id);
        }
    }
    let actual: BTreeSet<NodeId> = unconstrained.union(constrained).copied().collect();
    if expected != actual {
        return Err(WeftError::Assertion(format!(
            "choice registries diverge from the graph: expected {expected:?}, found {actual:?}"
        )));
    }
    Ok(())
}
