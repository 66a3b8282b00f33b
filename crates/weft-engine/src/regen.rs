//! Regen: re-execution of an extracted sub-trace.
//!
//! Walks the scaffold border forward, regenerating resampled nodes and
//! re-absorbing at the frontier. With `should_restore` the pass replays the
//! values a paired detach captured, which must reproduce the removal weight
//! exactly and leave the graph identical to its pre-detach state.

use weft_core::{NodeId, Value, WeftError};

use crate::db::Db;
use crate::lkernel::KernelCtx;
use crate::node::NodeKind;
use crate::scaffold::Scaffold;
use crate::sp::{Psp, PspSlot, ScopeRole, SimValue, SpAux};
use crate::trace::Trace;

/// Walks the border forward, attaching or regenerating each node, and
/// returns the insertion weight.
pub fn regen_and_attach(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
    should_restore: bool,
    db: &mut Db,
) -> Result<f64, WeftError> {
    let mut weight = 0.0;
    for node in scaffold.border_forward() {
        if scaffold.is_absorbing(node) {
            weight += attach(trace, node, scaffold, should_restore, db)?;
        } else {
            weight += regen_node(trace, node, scaffold, should_restore, db)?;
            if let Some(observed) = trace.observed_value(node) {
                weight += constrain(trace, node, &observed)?;
            }
        }
    }
    Ok(weight)
}

/// Regenerates a node's parents and re-scores its unchanged value.
fn attach(
    trace: &mut Trace,
    node: NodeId,
    scaffold: &mut Scaffold,
    should_restore: bool,
    db: &mut Db,
) -> Result<f64, WeftError> {
    let mut weight = regen_parents(trace, node, scaffold, should_restore, db)?;
    let sp = trace.sp_at(node)?;
    let slot = trace.psp_slot(node)?;
    let psp = sp.psp(slot);
    let args = trace.args_at(node)?;
    let value = trace
        .value_at(node)
        .cloned()
        .ok_or_else(|| WeftError::Assertion(format!("absorbing node {node:?} has no value")))?;
    let target = trace.absorb_target(node)?;

    weight += psp.log_density(&value, &args, trace.operator_aux(target))?;
    trace.with_aux_mut(target, |aux| psp.incorporate(&value, &args, aux))?;
    Ok(weight)
}

/// Regenerates a node: on the 0→1 transition of its regeneration count,
/// regenerates parents and re-applies the node, then recurses into an
/// arbitrary-ergodic maker when the node's value references one.
pub(crate) fn regen_node(
    trace: &mut Trace,
    node: NodeId,
    scaffold: &mut Scaffold,
    should_restore: bool,
    db: &mut Db,
) -> Result<f64, WeftError> {
    let mut weight = 0.0;
    if scaffold.is_resampling(node) {
        if scaffold.regen_count(node)? == 0 {
            weight += regen_parents(trace, node, scaffold, should_restore, db)?;
            match trace.node(node)?.kind.clone() {
                NodeKind::Lookup { source } => {
                    let value = trace.value_at(source).cloned().ok_or_else(|| {
                        WeftError::Assertion(format!("lookup source {source:?} has no value"))
                    })?;
                    trace.set_value(node, value)?;
                    trace.reconnect_lookup(node)?;
                    trace.set_active(node, true)?;
                }
                NodeKind::Constant => {}
                NodeKind::Request { .. } | NodeKind::Output { .. } => {
                    weight += apply_psp(trace, node, scaffold, should_restore, db)?;
                }
            }
        }
        scaffold.inc_regen_count(node)?;
    }
    if let Some(Value::SpRef(maker)) = trace.value_at(node) {
        let maker = *maker;
        if maker != node && scaffold.is_aaa(maker) {
            weight += regen_node(trace, maker, scaffold, should_restore, db)?;
        }
    }
    Ok(weight)
}

/// Regenerates a node's parents: definite parents first, ESR parents after.
fn regen_parents(
    trace: &mut Trace,
    node: NodeId,
    scaffold: &mut Scaffold,
    should_restore: bool,
    db: &mut Db,
) -> Result<f64, WeftError> {
    let mut weight = 0.0;
    for parent in trace.node(node)?.definite_parents() {
        weight += regen_node(trace, parent, scaffold, should_restore, db)?;
    }
    for root in trace.esr_parents(node).to_vec() {
        weight += regen_node(trace, root, scaffold, should_restore, db)?;
    }
    Ok(weight)
}

fn simulate_plain(
    trace: &mut Trace,
    psp: &dyn Psp,
    aux_of: NodeId,
    args: &crate::sp::Args,
) -> Result<SimValue, WeftError> {
    let Trace { made_sps, rng, .. } = trace;
    let aux = made_sps.get(&aux_of).and_then(|r| r.aux.as_deref());
    psp.simulate(args, aux, rng)
}

/// Runs one PSP application: picks the value (restore, kernel override, or
/// plain simulation), installs and incorporates it, then processes made
/// procedures, choice registration and requests.
pub(crate) fn apply_psp(
    trace: &mut Trace,
    node: NodeId,
    scaffold: &mut Scaffold,
    should_restore: bool,
    db: &mut Db,
) -> Result<f64, WeftError> {
    let sp = trace.sp_at(node)?;
    let slot = trace.psp_slot(node)?;
    let psp = sp.psp(slot);

    if slot == PspSlot::Output && psp.is_esr_reference() {
        let root = *trace.esr_parents(node).first().ok_or_else(|| {
            WeftError::Assertion(format!("esr-reference output {node:?} has no esr parent"))
        })?;
        let value = trace
            .value_at(root)
            .cloned()
            .ok_or_else(|| WeftError::Assertion(format!("esr parent {root:?} has no value")))?;
        trace.set_value(node, value)?;
        trace.set_active(node, true)?;
        return Ok(0.0);
    }

    let args = trace.args_at(node)?;
    let maker = trace.operator_maker(node)?;
    let mut weight = 0.0;

    let mut new = if should_restore {
        let value = match db.value(node) {
            Some(old) => old.clone(),
            None => SimValue::Plain(trace.value_at(node).cloned().ok_or_else(|| {
                WeftError::Assertion(format!("restored node {node:?} has no value"))
            })?),
        };
        // A restoring pass re-earns the weight the paired detach charged
        // through the kernel, keeping the round trip exact.
        if let Some(kernel) = scaffold.lkernel(node) {
            let Trace {
                made_sps,
                aaa_made_auxs,
                ..
            } = &mut *trace;
            let ctx = KernelCtx {
                old: db.value(node),
                made_aux: aaa_made_auxs.get(&node).map(|b| b.as_ref()),
                aux: made_sps.get(&maker).and_then(|r| r.aux.as_deref()),
            };
            weight += kernel.weight(&value, &ctx, &args)?;
        }
        value
    } else if scaffold.lkernel(node).is_some() {
        let Trace {
            made_sps,
            aaa_made_auxs,
            rng,
            ..
        } = &mut *trace;
        let kernel = scaffold
            .lkernel(node)
            .ok_or_else(|| WeftError::Assertion("kernel vanished".to_owned()))?;
        let ctx = KernelCtx {
            old: db.value(node),
            made_aux: aaa_made_auxs.get(&node).map(|b| b.as_ref()),
            aux: made_sps.get(&maker).and_then(|r| r.aux.as_deref()),
        };
        let value = kernel.simulate(&ctx, &args, rng)?;
        weight += kernel.weight(&value, &ctx, &args)?;
        value
    } else {
        simulate_plain(trace, psp, maker, &args)?
    };

    if should_restore && scaffold.is_aaa(node) {
        restore_latents(&mut new, node, db)?;
    }

    match new {
        SimValue::Plain(value) => {
            trace.set_value(node, value.clone())?;
            trace.with_aux_mut(maker, |aux| psp.incorporate(&value, &args, aux))?;
        }
        SimValue::Record(record) => {
            trace.install_made_sp(node, record)?;
        }
    }
    trace.set_active(node, true)?;

    if psp.is_random() {
        trace.register_unconstrained_choice(node)?;
    }
    if psp.scope_role() == ScopeRole::Include {
        let scope = scope_operand(&args, 0)?;
        let block = scope_operand(&args, 1)?;
        trace.register_choice_in_scope(scope, block, node)?;
    }
    if slot == PspSlot::Request {
        weight += eval_requests(trace, node, scaffold, should_restore, db)?;
    }
    Ok(weight)
}

fn scope_operand(args: &crate::sp::Args, index: usize) -> Result<Value, WeftError> {
    args.operand_values
        .get(index)
        .cloned()
        .ok_or_else(|| WeftError::Assertion("scope tag is missing an operand".to_owned()))
}

fn restore_latents(new: &mut SimValue, node: NodeId, db: &Db) -> Result<(), WeftError> {
    if let SimValue::Record(record) = new {
        if record.sp.makes_hsrs() {
            if let Some(latent_db) = db.latent_db(node) {
                let sp = record.sp.clone();
                let aux: Option<&mut dyn SpAux> = match &mut record.aux {
                    Some(b) => Some(b.as_mut()),
                    None => None,
                };
                sp.restore_all_latents(aux, latent_db)?;
            }
        }
    }
    Ok(())
}

/// Evaluates a request node's requests: ESR families are looked up, restored
/// from the store, or freshly evaluated; HSR latents are simulated.
fn eval_requests(
    trace: &mut Trace,
    request_node: NodeId,
    scaffold: &mut Scaffold,
    should_restore: bool,
    db: &mut Db,
) -> Result<f64, WeftError> {
    let request = trace
        .value_at(request_node)
        .ok_or_else(|| WeftError::Assertion(format!("request node {request_node:?} has no value")))?
        .as_request()?
        .clone();
    let sp = trace.sp_at(request_node)?;
    let maker = trace.operator_maker(request_node)?;
    let output = trace.output_of(request_node)?;
    let mut weight = 0.0;

    for esr in &request.esrs {
        let root = if let Some(root) = trace.family_root(maker, &esr.id) {
            root
        } else if should_restore && db.family(maker, &esr.id).is_some() {
            let root = db
                .family(maker, &esr.id)
                .ok_or_else(|| WeftError::Assertion("family vanished from store".to_owned()))?;
            // The restore weight is discarded: it only balances against the
            // paired detach, never stands on its own.
            let _ = restore_family(trace, root, scaffold, db)?;
            trace.register_family(maker, esr.id.clone(), root)?;
            root
        } else {
            let env = trace.resolve_esr_env(&esr.env, request_node)?;
            let (family_weight, root) =
                eval_family(trace, &esr.exp, env, scaffold, should_restore, db)?;
            weight += family_weight;
            trace.register_family(maker, esr.id.clone(), root)?;
            root
        };
        trace.add_esr_edge(root, output)?;
    }

    for hsr in &request.hsrs {
        let Trace { made_sps, rng, .. } = &mut *trace;
        let aux: Option<&mut dyn SpAux> = match made_sps.get_mut(&maker) {
            Some(r) => match &mut r.aux {
                Some(b) => Some(b.as_mut()),
                None => None,
            },
            None => None,
        };
        weight += sp.simulate_latents(aux, hsr, should_restore, db.latent_db_mut(maker), rng)?;
    }
    Ok(weight)
}

/// Builds a trace sub-graph from an expression.
///
/// Arrays are applications with `(quote x)` as the one special form; symbols
/// become lookups; everything else is a self-evaluating constant.
pub fn eval_family(
    trace: &mut Trace,
    exp: &Value,
    env: weft_core::EnvId,
    scaffold: &mut Scaffold,
    should_restore: bool,
    db: &mut Db,
) -> Result<(f64, NodeId), WeftError> {
    match exp {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(WeftError::arity("application", 1, 0));
            }
            if let Value::Symbol(head) = &items[0] {
                if head == "quote" {
                    if items.len() != 2 {
                        return Err(WeftError::arity("quote", 1, items.len() - 1));
                    }
                    let node = trace.create_constant_node(env, items[1].clone());
                    return Ok((0.0, node));
                }
            }
            let mut weight = 0.0;
            let (operator_weight, operator) =
                eval_family(trace, &items[0], env, scaffold, should_restore, db)?;
            weight += operator_weight;
            let mut operands = Vec::with_capacity(items.len() - 1);
            for sub in &items[1..] {
                let (operand_weight, operand) =
                    eval_family(trace, sub, env, scaffold, should_restore, db)?;
                weight += operand_weight;
                operands.push(operand);
            }
            let (request_node, output_node) =
                trace.create_application_nodes(operator, &operands, env)?;
            weight += apply(
                trace,
                request_node,
                output_node,
                scaffold,
                should_restore,
                db,
            )?;
            Ok((weight, output_node))
        }
        Value::Symbol(symbol) => {
            let source = trace.find_symbol(env, symbol)?;
            let weight = regen_node(trace, source, scaffold, should_restore, db)?;
            let node = trace.create_lookup_node(env, source)?;
            Ok((weight, node))
        }
        datum => {
            let node = trace.create_constant_node(env, datum.clone());
            Ok((0.0, node))
        }
    }
}

/// Applies one application: request side, then its ESR parents, then the
/// output side.
pub(crate) fn apply(
    trace: &mut Trace,
    request_node: NodeId,
    output_node: NodeId,
    scaffold: &mut Scaffold,
    should_restore: bool,
    db: &mut Db,
) -> Result<f64, WeftError> {
    let mut weight = apply_psp(trace, request_node, scaffold, should_restore, db)?;
    for root in trace.esr_parents(output_node).to_vec() {
        weight += regen_node(trace, root, scaffold, should_restore, db)?;
    }
    weight += apply_psp(trace, output_node, scaffold, should_restore, db)?;
    Ok(weight)
}

/// Reattaches a family the paired detach tore down, reusing its nodes.
///
/// Returns the weight it accumulated, which callers discard.
pub(crate) fn restore_family(
    trace: &mut Trace,
    node: NodeId,
    scaffold: &mut Scaffold,
    db: &mut Db,
) -> Result<f64, WeftError> {
    match trace.node(node)?.kind.clone() {
        NodeKind::Constant => {
            trace.set_active(node, true)?;
            Ok(0.0)
        }
        NodeKind::Lookup { source } => {
            let mut weight = regen_parents(trace, node, scaffold, true, db)?;
            let value = trace
                .value_at(source)
                .cloned()
                .ok_or_else(|| WeftError::Assertion(format!("source {source:?} has no value")))?;
            trace.reconnect_lookup(node)?;
            trace.set_value(node, value)?;
            trace.set_active(node, true)?;
            Ok(weight)
        }
        NodeKind::Output {
            operator,
            operands,
            request,
        } => {
            let mut weight = restore_family(trace, operator, scaffold, db)?;
            for operand in &operands {
                weight += restore_family(trace, *operand, scaffold, db)?;
            }
            weight += apply(trace, request, node, scaffold, true, db)?;
            Ok(weight)
        }
        NodeKind::Request { .. } => Err(WeftError::Assertion(
            "families are never rooted at request nodes".to_owned(),
        )),
    }
}

/// Pins a node to an observed value, moving it into the constrained set.
///
/// References are followed to the outermost application that actually owns
/// the choice; downstream reference chains are updated so reports stay
/// consistent.
pub(crate) fn constrain(
    trace: &mut Trace,
    node: NodeId,
    value: &Value,
) -> Result<f64, WeftError> {
    let target = trace.constrainable_node(node)?;
    if trace.node(target)?.is_constrained {
        return Err(WeftError::DoubleConstrain);
    }
    let sp = trace.sp_at(target)?;
    let psp = sp.psp(PspSlot::Output);
    if !psp.is_random() {
        return Err(WeftError::Observation(format!(
            "{} is deterministic and cannot be constrained",
            psp.name()
        )));
    }
    if !trace.can_absorb_observation(target)? {
        return Err(WeftError::Observation(format!(
            "{} cannot absorb an observed value",
            psp.name()
        )));
    }

    let args = trace.args_at(target)?;
    let maker = trace.operator_maker(target)?;
    let old = trace
        .value_at(target)
        .cloned()
        .ok_or_else(|| WeftError::Assertion(format!("node {target:?} has no value")))?;

    trace.with_aux_mut(maker, |aux| psp.unincorporate(&old, &args, aux))?;
    let weight = psp.log_density(value, &args, trace.operator_aux(maker))?;
    trace.set_value(target, value.clone())?;
    trace.with_aux_mut(maker, |aux| psp.incorporate(value, &args, aux))?;
    {
        let state = trace.node_mut(target)?;
        state.is_constrained = true;
        state.sp_owns_value = false;
    }
    trace.register_constrained_choice(target)?;
    propagate_constraint(trace, target, value)?;
    Ok(weight)
}

/// Pushes a constrained value through reference chains so every lookup and
/// ESR reference downstream reports the pinned value.
fn propagate_constraint(
    trace: &mut Trace,
    node: NodeId,
    value: &Value,
) -> Result<(), WeftError> {
    let children: Vec<NodeId> = trace.children(node)?.iter().copied().collect();
    for child in children {
        if !trace.node(child)?.is_active {
            continue;
        }
        match trace.node(child)?.kind.clone() {
            NodeKind::Lookup { .. } => {
                trace.set_value(child, value.clone())?;
                propagate_constraint(trace, child, value)?;
            }
            NodeKind::Output { .. } => {
                let sp = trace.sp_at(child)?;
                if sp.output_psp().is_esr_reference() {
                    trace.set_value(child, value.clone())?;
                    propagate_constraint(trace, child, value)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Re-runs the arbitrary-ergodic kernel of a made procedure in place.
pub(crate) fn ae_infer_at(trace: &mut Trace, maker: NodeId) -> Result<(), WeftError> {
    let sp = trace
        .made_record(maker)
        .ok_or_else(|| {
            WeftError::Assertion(format!("node {maker:?} has not made a procedure"))
        })?
        .sp
        .clone();
    let Trace { made_sps, rng, .. } = trace;
    let aux: Option<&mut dyn SpAux> =
        made_sps.get_mut(&maker).and_then(|r| r.aux.as_deref_mut());
    match aux {
        Some(aux) => sp.ae_infer(aux, rng),
        None => Err(WeftError::Assertion(format!(
            "procedure {} keeps no statistics to infer over",
            sp.name()
        ))),
    }
}
