//! Scaffold construction: the plan for a single proposal.
//!
//! Given the principal nodes a kernel wants to change, the scaffold decides
//! which nodes resample (the DRG), which absorb the change at their own
//! density, which makers take the arbitrary-ergodic shortcut, and which nodes
//! are brush that detach removes structurally. The border is the ordered
//! frontier the detach/regen pair walks: regen forward, detach in exact
//! reverse.

use std::collections::{BTreeMap, BTreeSet};

use weft_core::{NodeId, Value, WeftError};

use crate::lkernel::{AaaKernel, LKernel};
use crate::node::NodeKind;
use crate::trace::Trace;

/// Per-proposal classification of nodes.
#[derive(Debug, Default)]
pub struct Scaffold {
    regen_counts: BTreeMap<NodeId, i64>,
    absorbing: BTreeSet<NodeId>,
    aaa: BTreeSet<NodeId>,
    brush: BTreeSet<NodeId>,
    border: Vec<Vec<NodeId>>,
    lkernels: BTreeMap<NodeId, Box<dyn LKernel>>,
}

impl Scaffold {
    /// Creates an empty scaffold; family evaluation outside a proposal uses
    /// one of these.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether `node` is in the DRG.
    pub fn is_resampling(&self, node: NodeId) -> bool {
        self.regen_counts.contains_key(&node)
    }

    /// Whether `node` absorbs the proposal.
    pub fn is_absorbing(&self, node: NodeId) -> bool {
        self.absorbing.contains(&node)
    }

    /// Whether `node` is an arbitrary-ergodic maker.
    pub fn is_aaa(&self, node: NodeId) -> bool {
        self.aaa.contains(&node)
    }

    /// Whether `node` is brush.
    pub fn is_brush(&self, node: NodeId) -> bool {
        self.brush.contains(&node)
    }

    /// Current regeneration count of a DRG node.
    pub fn regen_count(&self, node: NodeId) -> Result<i64, WeftError> {
        self.regen_counts
            .get(&node)
            .copied()
            .ok_or_else(|| WeftError::Assertion(format!("node {node:?} is not resampling")))
    }

    pub(crate) fn inc_regen_count(&mut self, node: NodeId) -> Result<(), WeftError> {
        match self.regen_counts.get_mut(&node) {
            Some(count) => {
                *count += 1;
                Ok(())
            }
            None => Err(WeftError::Assertion(format!(
                "node {node:?} is not resampling"
            ))),
        }
    }

    pub(crate) fn dec_regen_count(&mut self, node: NodeId) -> Result<(), WeftError> {
        match self.regen_counts.get_mut(&node) {
            Some(count) if *count > 0 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => Err(WeftError::Assertion(format!(
                "regen count of {node:?} would go negative"
            ))),
            None => Err(WeftError::Assertion(format!(
                "node {node:?} is not resampling"
            ))),
        }
    }

    /// Installs a local kernel for `node`, replacing any previous one.
    pub fn register_lkernel(&mut self, node: NodeId, kernel: Box<dyn LKernel>) {
        self.lkernels.insert(node, kernel);
    }

    /// The kernel installed for `node`, if any.
    pub fn lkernel(&self, node: NodeId) -> Option<&dyn LKernel> {
        self.lkernels.get(&node).map(|k| k.as_ref())
    }

    /// Border sections, one per principal set, each ordered by node id.
    pub fn border(&self) -> &[Vec<NodeId>] {
        &self.border
    }

    /// DRG nodes in id order.
    pub fn resampling_nodes(&self) -> Vec<NodeId> {
        self.regen_counts.keys().copied().collect()
    }

    /// Absorbing nodes in id order.
    pub fn absorbing_nodes(&self) -> Vec<NodeId> {
        self.absorbing.iter().copied().collect()
    }

    /// Brush nodes in id order.
    pub fn brush_nodes(&self) -> Vec<NodeId> {
        self.brush.iter().copied().collect()
    }

    /// Arbitrary-ergodic makers in id order.
    pub fn aaa_nodes(&self) -> Vec<NodeId> {
        self.aaa.iter().copied().collect()
    }

    /// Border flattened in regeneration order.
    pub(crate) fn border_forward(&self) -> Vec<NodeId> {
        self.border.iter().flatten().copied().collect()
    }

    /// Border flattened in detach order: the exact reverse of regeneration.
    pub(crate) fn border_reverse(&self) -> Vec<NodeId> {
        let mut nodes = self.border_forward();
        nodes.reverse();
        nodes
    }
}

struct Candidates {
    drg: BTreeSet<NodeId>,
    absorbing: BTreeSet<NodeId>,
    aaa: BTreeSet<NodeId>,
    index: BTreeMap<NodeId, usize>,
}

/// Builds the scaffold for the given sets of principal nodes.
pub fn construct_scaffold(
    trace: &Trace,
    sets_of_pnodes: &[BTreeSet<NodeId>],
    use_delta_kernels: bool,
) -> Result<Scaffold, WeftError> {
    let mut candidates = Candidates {
        drg: BTreeSet::new(),
        absorbing: BTreeSet::new(),
        aaa: BTreeSet::new(),
        index: BTreeMap::new(),
    };
    for (section, pnodes) in sets_of_pnodes.iter().enumerate() {
        extend_candidate_scaffold(trace, pnodes, &mut candidates, section)?;
    }

    let brush = find_brush(trace, &candidates.drg)?;
    let drg: BTreeSet<NodeId> = candidates.drg.difference(&brush).copied().collect();
    let absorbing: BTreeSet<NodeId> = candidates.absorbing.difference(&brush).copied().collect();
    let aaa: BTreeSet<NodeId> = candidates.aaa.difference(&brush).copied().collect();

    let border_set = find_border(trace, &drg, &absorbing, &aaa)?;
    let regen_counts = compute_regen_counts(trace, &drg, &absorbing, &aaa, &border_set, &brush)?;
    let lkernels = load_kernels(trace, &drg, &aaa, use_delta_kernels)?;
    let border = assign_border_sections(&border_set, &candidates.index, sets_of_pnodes.len());

    Ok(Scaffold {
        regen_counts,
        absorbing,
        aaa,
        brush,
        border,
        lkernels,
    })
}

fn extend_candidate_scaffold(
    trace: &Trace,
    pnodes: &BTreeSet<NodeId>,
    candidates: &mut Candidates,
    section: usize,
) -> Result<(), WeftError> {
    let mut queue: Vec<(NodeId, bool, Option<NodeId>)> =
        pnodes.iter().map(|p| (*p, true, None)).collect();

    while let Some((node, is_principal, parent)) = queue.pop() {
        if candidates.drg.contains(&node) && !candidates.aaa.contains(&node) {
            continue;
        }
        match &trace.node(node)?.kind {
            NodeKind::Constant => {}
            NodeKind::Lookup { .. } => {
                add_resampling(trace, candidates, &mut queue, node, section)?;
            }
            NodeKind::Request { .. } | NodeKind::Output { .. } => {
                if candidates.aaa.contains(&node) {
                    continue;
                }
                let absorbs = match parent {
                    Some(parent) if !is_principal => trace.can_absorb(node, parent)?,
                    _ => false,
                };
                let makes_aaa_children = {
                    let sp = trace.sp_at(node)?;
                    let slot = trace.psp_slot(node)?;
                    sp.psp(slot).children_can_aaa()
                };
                if absorbs {
                    candidates.absorbing.insert(node);
                    candidates.index.insert(node, section);
                } else if makes_aaa_children {
                    candidates.drg.insert(node);
                    candidates.aaa.insert(node);
                    candidates.absorbing.remove(&node);
                    candidates.index.insert(node, section);
                } else {
                    add_resampling(trace, candidates, &mut queue, node, section)?;
                }
            }
        }
    }
    Ok(())
}

fn add_resampling(
    trace: &Trace,
    candidates: &mut Candidates,
    queue: &mut Vec<(NodeId, bool, Option<NodeId>)>,
    node: NodeId,
    section: usize,
) -> Result<(), WeftError> {
    candidates.absorbing.remove(&node);
    candidates.aaa.remove(&node);
    candidates.drg.insert(node);
    candidates.index.insert(node, section);
    for child in trace.children(node)? {
        queue.push((*child, false, Some(node)));
    }
    Ok(())
}

fn find_brush(trace: &Trace, cdrg: &BTreeSet<NodeId>) -> Result<BTreeSet<NodeId>, WeftError> {
    let mut disable_counts: BTreeMap<NodeId, usize> = BTreeMap::new();
    let mut disabled_requests: BTreeSet<NodeId> = BTreeSet::new();
    let mut brush = BTreeSet::new();
    for node in cdrg {
        if matches!(trace.node(*node)?.kind, NodeKind::Request { .. }) {
            disable_requests(
                trace,
                *node,
                &mut disable_counts,
                &mut disabled_requests,
                &mut brush,
            )?;
        }
    }
    Ok(brush)
}

fn disable_requests(
    trace: &Trace,
    request_node: NodeId,
    disable_counts: &mut BTreeMap<NodeId, usize>,
    disabled_requests: &mut BTreeSet<NodeId>,
    brush: &mut BTreeSet<NodeId>,
) -> Result<(), WeftError> {
    if !disabled_requests.insert(request_node) {
        return Ok(());
    }
    let output = match &trace.node(request_node)?.kind {
        NodeKind::Request { output, .. } => *output,
        _ => {
            return Err(WeftError::Assertion(
                "disable_requests needs a request node".to_owned(),
            ))
        }
    };
    for root in trace.esr_parents(output).to_vec() {
        let count = disable_counts.entry(root).or_insert(0);
        *count += 1;
        if *count == trace.num_requests(root) {
            disable_family(trace, root, disable_counts, disabled_requests, brush)?;
        }
    }
    Ok(())
}

fn disable_family(
    trace: &Trace,
    node: NodeId,
    disable_counts: &mut BTreeMap<NodeId, usize>,
    disabled_requests: &mut BTreeSet<NodeId>,
    brush: &mut BTreeSet<NodeId>,
) -> Result<(), WeftError> {
    brush.insert(node);
    if let NodeKind::Output {
        operator,
        operands,
        request,
    } = trace.node(node)?.kind.clone()
    {
        brush.insert(request);
        disable_requests(trace, request, disable_counts, disabled_requests, brush)?;
        disable_family(trace, operator, disable_counts, disabled_requests, brush)?;
        for operand in operands {
            disable_family(trace, operand, disable_counts, disabled_requests, brush)?;
        }
    }
    Ok(())
}

fn find_border(
    trace: &Trace,
    drg: &BTreeSet<NodeId>,
    absorbing: &BTreeSet<NodeId>,
    aaa: &BTreeSet<NodeId>,
) -> Result<BTreeSet<NodeId>, WeftError> {
    let mut border: BTreeSet<NodeId> = absorbing.union(aaa).copied().collect();
    for node in drg.difference(aaa) {
        let children = trace.children(*node)?;
        let blocked = children
            .iter()
            .any(|c| drg.contains(c) || absorbing.contains(c));
        if !blocked {
            border.insert(*node);
        }
    }
    Ok(border)
}

fn maybe_increment_aaa_count(
    trace: &Trace,
    regen_counts: &mut BTreeMap<NodeId, i64>,
    aaa: &BTreeSet<NodeId>,
    node: NodeId,
) -> Result<(), WeftError> {
    if let Some(Value::SpRef(maker)) = trace.value_at(node) {
        if aaa.contains(maker) {
            if let Some(count) = regen_counts.get_mut(maker) {
                *count += 1;
            }
        }
    }
    Ok(())
}

fn compute_regen_counts(
    trace: &Trace,
    drg: &BTreeSet<NodeId>,
    absorbing: &BTreeSet<NodeId>,
    aaa: &BTreeSet<NodeId>,
    border: &BTreeSet<NodeId>,
    brush: &BTreeSet<NodeId>,
) -> Result<BTreeMap<NodeId, i64>, WeftError> {
    let mut regen_counts = BTreeMap::new();
    for node in drg {
        let count = if aaa.contains(node) {
            // Seeded at one; every reference through an SpRef adds one below.
            1
        } else if border.contains(node) {
            trace.children(*node)?.len() as i64 + 1
        } else {
            trace.children(*node)?.len() as i64
        };
        regen_counts.insert(*node, count);
    }

    if !aaa.is_empty() {
        for node in drg.union(absorbing) {
            let node_ref = trace.node(*node)?;
            for parent in node_ref.definite_parents() {
                maybe_increment_aaa_count(trace, &mut regen_counts, aaa, parent)?;
            }
            for root in trace.esr_parents(*node).to_vec() {
                maybe_increment_aaa_count(trace, &mut regen_counts, aaa, root)?;
            }
        }
        for node in brush {
            match &trace.node(*node)?.kind {
                NodeKind::Output { .. } => {
                    for root in trace.esr_parents(*node).to_vec() {
                        maybe_increment_aaa_count(trace, &mut regen_counts, aaa, root)?;
                    }
                }
                NodeKind::Lookup { source } => {
                    maybe_increment_aaa_count(trace, &mut regen_counts, aaa, *source)?;
                }
                _ => {}
            }
        }
    }
    Ok(regen_counts)
}

fn load_kernels(
    trace: &Trace,
    drg: &BTreeSet<NodeId>,
    aaa: &BTreeSet<NodeId>,
    use_delta_kernels: bool,
) -> Result<BTreeMap<NodeId, Box<dyn LKernel>>, WeftError> {
    let mut kernels: BTreeMap<NodeId, Box<dyn LKernel>> = BTreeMap::new();
    for node in aaa {
        let maker_sp = trace.sp_at(*node)?;
        kernels.insert(*node, Box::new(AaaKernel::new(maker_sp)));
    }
    if use_delta_kernels {
        for node in drg.difference(aaa) {
            if !trace.node(*node)?.is_application() {
                continue;
            }
            let sp = trace.sp_at(*node)?;
            let slot = trace.psp_slot(*node)?;
            if let Some(kernel) = sp.psp(slot).delta_kernel() {
                kernels.insert(*node, kernel);
            }
        }
    }
    Ok(kernels)
}

fn assign_border_sections(
    border: &BTreeSet<NodeId>,
    index: &BTreeMap<NodeId, usize>,
    sections: usize,
) -> Vec<Vec<NodeId>> {
    let mut out = vec![Vec::new(); sections.max(1)];
    for node in border {
        let section = index.get(node).copied().unwrap_or(0);
        out[section].push(*node);
    }
    out
}
