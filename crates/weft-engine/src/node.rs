//! Graph vertices and typed edges.

use std::collections::BTreeSet;

use weft_core::{EnvId, NodeId, Value};

/// Structural variant of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Holds a value fixed at creation.
    Constant,
    /// References a binding; its value shadows the source node's value.
    Lookup {
        /// The node the binding resolved to.
        source: NodeId,
    },
    /// The request side of an application.
    Request {
        /// Operator node.
        operator: NodeId,
        /// Operand nodes, in order.
        operands: Vec<NodeId>,
        /// The paired output node.
        output: NodeId,
    },
    /// The output side of an application.
    Output {
        /// Operator node.
        operator: NodeId,
        /// Operand nodes, in order.
        operands: Vec<NodeId>,
        /// The paired request node.
        request: NodeId,
    },
}

/// Type of a parent-to-child edge; traversals branch on this, never on
/// pointer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeType {
    /// Operator to request or output.
    Op,
    /// Operand to request or output.
    Arg,
    /// Request to its paired output.
    Request,
    /// Binding source to lookup.
    Lookup,
    /// ESR family root to requesting output.
    Esr,
}

/// A vertex of the trace graph.
#[derive(Debug, Clone)]
pub struct Node {
    /// Structural variant.
    pub kind: NodeKind,
    /// Current value; present exactly while the node is active, except for
    /// constants, which keep their value across family teardown.
    pub value: Option<Value>,
    /// Whether the node is part of the live graph.
    pub is_active: bool,
    /// Whether the node's value is pinned by an observation.
    pub is_constrained: bool,
    /// Whether the owning procedure must unincorporate on teardown.
    pub sp_owns_value: bool,
    /// Outgoing edges.
    pub children: BTreeSet<NodeId>,
    /// Environment the node was created in.
    pub env: EnvId,
}

impl Node {
    pub(crate) fn new(kind: NodeKind, env: EnvId) -> Self {
        Self {
            kind,
            value: None,
            is_active: false,
            is_constrained: false,
            sp_owns_value: true,
            children: BTreeSet::new(),
            env,
        }
    }

    /// Definite parents in regeneration order: operator, operands, then the
    /// request node for outputs. ESR parents are tracked trace-side.
    pub fn definite_parents(&self) -> Vec<NodeId> {
        match &self.kind {
            NodeKind::Constant => Vec::new(),
            NodeKind::Lookup { source } => vec![*source],
            NodeKind::Request {
                operator, operands, ..
            } => {
                let mut parents = vec![*operator];
                parents.extend(operands.iter().copied());
                parents
            }
            NodeKind::Output {
                operator,
                operands,
                request,
            } => {
                let mut parents = vec![*operator];
                parents.extend(operands.iter().copied());
                parents.push(*request);
                parents
            }
        }
    }

    /// Definite parents together with their edge types.
    pub fn parent_edges(&self) -> Vec<(NodeId, EdgeType)> {
        match &self.kind {
            NodeKind::Constant => Vec::new(),
            NodeKind::Lookup { source } => vec![(*source, EdgeType::Lookup)],
            NodeKind::Request {
                operator, operands, ..
            } => {
                let mut edges = vec![(*operator, EdgeType::Op)];
                edges.extend(operands.iter().map(|o| (*o, EdgeType::Arg)));
                edges
            }
            NodeKind::Output {
                operator,
                operands,
                request,
            } => {
                let mut edges = vec![(*operator, EdgeType::Op)];
                edges.extend(operands.iter().map(|o| (*o, EdgeType::Arg)));
                edges.push((*request, EdgeType::Request));
                edges
            }
        }
    }

    /// Whether the node is an application (request or output) node.
    pub fn is_application(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Request { .. } | NodeKind::Output { .. }
        )
    }
}
