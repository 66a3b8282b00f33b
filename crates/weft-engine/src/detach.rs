//! Detach: extraction of a sub-trace into a rollback store.
//!
//! Every function here is the exact inverse of its counterpart in
//! [`crate::regen`], and the two sides must visit nodes in exactly opposite
//! orders: weight contributions read sufficient statistics at the moment a
//! node is visited, so an unincorporation on this side must pair with the
//! incorporation the other side performs at the same position.

use weft_core::{NodeId, Value, WeftError};

use crate::db::Db;
use crate::lkernel::KernelCtx;
use crate::node::NodeKind;
use crate::scaffold::Scaffold;
use crate::sp::{PspSlot, ScopeRole, SimValue, SpAux, SpRecord};
use crate::trace::Trace;

/// Walks the border in reverse, absorbing or extracting each node, and
/// returns the removal weight together with the store holding everything
/// that was removed.
pub fn detach_and_extract(
    trace: &mut Trace,
    scaffold: &mut Scaffold,
) -> Result<(f64, Db), WeftError> {
    let mut db = Db::new();
    let mut weight = 0.0;
    for node in scaffold.border_reverse() {
        if scaffold.is_absorbing(node) {
            weight += unabsorb(trace, node, scaffold, &mut db)?;
        } else {
            if trace.is_observation(node) {
                let target = trace.constrainable_node(node)?;
                weight += unconstrain(trace, target)?;
            }
            weight += extract(trace, node, scaffold, &mut db)?;
        }
    }
    Ok((weight, db))
}

/// Removes an absorbed value's contribution and extracts its parents.
fn unabsorb(
    trace: &mut Trace,
    node: NodeId,
    scaffold: &mut Scaffold,
    db: &mut Db,
) -> Result<f64, WeftError> {
    let sp = trace.sp_at(node)?;
    let slot = trace.psp_slot(node)?;
    let psp = sp.psp(slot);
    let args = trace.args_at(node)?;
    let value = trace
        .value_at(node)
        .cloned()
        .ok_or_else(|| WeftError::Assertion(format!("absorbing node {node:?} has no value")))?;
    let target = trace.absorb_target(node)?;

    trace.with_aux_mut(target, |aux| psp.unincorporate(&value, &args, aux))?;
    let mut weight = psp.log_density(&value, &args, trace.operator_aux(target))?;
    weight += extract_parents(trace, node, scaffold, db)?;
    Ok(weight)
}

/// Releases a constrained choice back into the unconstrained set, keeping
/// its value, and returns the density the constraint was contributing.
pub(crate) fn unconstrain(trace: &mut Trace, node: NodeId) -> Result<f64, WeftError> {
    if !trace.node(node)?.is_constrained {
        return Err(WeftError::Assertion(format!(
            "cannot unconstrain {node:?}: not constrained"
        )));
    }
    let sp = trace.sp_at(node)?;
    let psp = sp.psp(PspSlot::Output);
    let args = trace.args_at(node)?;
    let value = trace
        .value_at(node)
        .cloned()
        .ok_or_else(|| WeftError::Assertion(format!("constrained node {node:?} has no value")))?;
    let maker = trace.operator_maker(node)?;

    trace.unregister_constrained_choice(node)?;
    {
        let state = trace.node_mut(node)?;
        state.is_constrained = false;
        state.sp_owns_value = true;
    }
    trace.with_aux_mut(maker, |aux| psp.unincorporate(&value, &args, aux))?;
    let weight = psp.log_density(&value, &args, trace.operator_aux(maker))?;
    trace.with_aux_mut(maker, |aux| psp.incorporate(&value, &args, aux))?;
    Ok(weight)
}

/// Extracts a node: decrements its regeneration count and, on the 1→0
/// transition, undoes its application and recurses into its parents.
pub(crate) fn extract(
    trace: &mut Trace,
    node: NodeId,
    scaffold: &mut Scaffold,
    db: &mut Db,
) -> Result<f64, WeftError> {
    let mut weight = 0.0;

    if let Some(Value::SpRef(maker)) = trace.value_at(node) {
        let maker = *maker;
        if maker != node && scaffold.is_aaa(maker) {
            weight += extract(trace, maker, scaffold, db)?;
        }
    }

    if scaffold.is_resampling(node) {
        scaffold.dec_regen_count(node)?;
        if scaffold.regen_count(node)? == 0 {
            match trace.node(node)?.kind.clone() {
                NodeKind::Lookup { .. } => {
                    trace.disconnect_lookup(node)?;
                    trace.clear_value(node)?;
                    trace.set_active(node, false)?;
                }
                NodeKind::Request { .. } => {
                    weight += uneval_requests(trace, node, scaffold, db)?;
                    weight += unapply_psp(trace, node, scaffold, db)?;
                }
                NodeKind::Output { .. } => {
                    weight += unapply_psp(trace, node, scaffold, db)?;
                }
                NodeKind::Constant => {}
            }
            weight += extract_parents(trace, node, scaffold, db)?;
        }
    }
    Ok(weight)
}

/// Extracts a node's parents: ESR parents first, definite parents after,
/// both in reverse of the regeneration order.
fn extract_parents(
    trace: &mut Trace,
    node: NodeId,
    scaffold: &mut Scaffold,
    db: &mut Db,
) -> Result<f64, WeftError> {
    let mut weight = 0.0;
    let mut esr_parents = trace.esr_parents(node).to_vec();
    esr_parents.reverse();
    for root in esr_parents {
        weight += extract(trace, root, scaffold, db)?;
    }
    let mut parents = trace.node(node)?.definite_parents();
    parents.reverse();
    for parent in parents {
        weight += extract(trace, parent, scaffold, db)?;
    }
    Ok(weight)
}

/// Undoes a single PSP application, capturing its value into the store.
pub(crate) fn unapply_psp(
    trace: &mut Trace,
    node: NodeId,
    scaffold: &mut Scaffold,
    db: &mut Db,
) -> Result<f64, WeftError> {
    let sp = trace.sp_at(node)?;
    let slot = trace.psp_slot(node)?;
    let psp = sp.psp(slot);

    if slot == PspSlot::Output && psp.is_esr_reference() {
        let value = trace
            .value_at(node)
            .cloned()
            .ok_or_else(|| WeftError::Assertion(format!("node {node:?} has no value")))?;
        db.register_value(node, SimValue::Plain(value));
        trace.clear_value(node)?;
        trace.set_active(node, false)?;
        return Ok(0.0);
    }

    let args = trace.args_at(node)?;
    let maker = trace.operator_maker(node)?;

    if psp.is_random() {
        trace.unregister_unconstrained_choice(node)?;
    }
    if psp.scope_role() == ScopeRole::Include {
        let scope = args.operand_values.first().cloned().ok_or_else(|| {
            WeftError::Assertion("scope tag is missing an operand".to_owned())
        })?;
        let block = args.operand_values.get(1).cloned().ok_or_else(|| {
            WeftError::Assertion("scope tag is missing an operand".to_owned())
        })?;
        trace.unregister_choice_in_scope(&scope, &block, node)?;
    }

    let current = trace
        .value_at(node)
        .cloned()
        .ok_or_else(|| WeftError::Assertion(format!("node {node:?} has no value")))?;
    let captured = if matches!(current, Value::SpRef(maker_node) if maker_node == node) {
        SimValue::Record(teardown_made_sp(trace, node, scaffold.is_aaa(node))?)
    } else {
        SimValue::Plain(current.clone())
    };

    if let SimValue::Plain(value) = &captured {
        trace.with_aux_mut(maker, |aux| psp.unincorporate(value, &args, aux))?;
    }

    let mut weight = 0.0;
    if let Some(kernel) = scaffold.lkernel(node) {
        let ctx = KernelCtx {
            old: None,
            made_aux: trace.aaa_aux(node),
            aux: trace.operator_aux(maker),
        };
        weight += kernel.reverse_weight(&captured, &ctx, &args)?;
    }

    db.register_value(node, captured);
    trace.clear_value(node)?;
    trace.set_active(node, false)?;
    Ok(weight)
}

/// Moves a made procedure out of the trace, stashing its aux when the maker
/// takes the arbitrary-ergodic path.
fn teardown_made_sp(
    trace: &mut Trace,
    node: NodeId,
    is_aaa: bool,
) -> Result<SpRecord, WeftError> {
    let record = trace.take_made_record(node)?;
    if !record.families.is_empty() {
        return Err(WeftError::Assertion(format!(
            "maker {node:?} torn down while still owning {} families",
            record.families.len()
        )));
    }
    if record.sp.has_ae_kernel() {
        trace.unregister_ae_kernel(node)?;
    }
    if is_aaa {
        if let Some(aux) = &record.aux {
            trace.stash_aaa_aux(node, aux.clone_aux());
        }
    }
    Ok(record)
}

/// Undoes the requests of a request node: detaches latents, pops ESR edges,
/// and tears down families whose request count reaches zero.
fn uneval_requests(
    trace: &mut Trace,
    request_node: NodeId,
    scaffold: &mut Scaffold,
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

    if !request.hsrs.is_empty() && !db.has_latent_db(maker) {
        if let Some(latent_db) = sp.construct_latent_db() {
            db.register_latent_db(maker, latent_db);
        }
    }
    for hsr in request.hsrs.iter().rev() {
        let Trace { made_sps, .. } = &mut *trace;
        let aux: Option<&mut dyn SpAux> = match made_sps.get_mut(&maker) {
            Some(r) => match &mut r.aux {
                Some(b) => Some(b.as_mut()),
                None => None,
            },
            None => None,
        };
        weight += sp.detach_latents(aux, hsr, db.latent_db_mut(maker))?;
    }

    for esr in request.esrs.iter().rev() {
        let root = trace.pop_last_esr_parent(output)?;
        if trace.num_requests(root) == 0 {
            trace.unregister_family(maker, &esr.id)?;
            db.register_family(maker, esr.id.clone(), root);
            weight += uneval_family(trace, root, scaffold, db)?;
        } else {
            weight += extract(trace, root, scaffold, db)?;
        }
    }
    Ok(weight)
}

/// Tears down an entire family rooted at `node`.
///
/// Constants keep their values and merely deactivate so a later restore
/// finds them in place; lookups disconnect and extract their source;
/// applications unwind through [`unapply`].
pub(crate) fn uneval_family(
    trace: &mut Trace,
    node: NodeId,
    scaffold: &mut Scaffold,
    db: &mut Db,
) -> Result<f64, WeftError> {
    let mut weight = 0.0;
    match trace.node(node)?.kind.clone() {
        NodeKind::Constant => {
            // Only the activity flag records the teardown.
            trace.set_active(node, false)?;
        }
        NodeKind::Lookup { .. } => {
            trace.disconnect_lookup(node)?;
            trace.clear_value(node)?;
            trace.set_active(node, false)?;
            weight += extract_parents(trace, node, scaffold, db)?;
        }
        NodeKind::Output {
            operator, operands, ..
        } => {
            weight += unapply(trace, node, scaffold, db)?;
            for operand in operands.iter().rev() {
                weight += uneval_family(trace, *operand, scaffold, db)?;
            }
            weight += uneval_family(trace, operator, scaffold, db)?;
        }
        NodeKind::Request { .. } => {
            return Err(WeftError::Assertion(
                "families are never rooted at request nodes".to_owned(),
            ))
        }
    }
    Ok(weight)
}

/// Undoes one application: output first, then its ESR parents, then the
/// request side. The exact reverse of [`crate::regen::apply`].
fn unapply(
    trace: &mut Trace,
    output: NodeId,
    scaffold: &mut Scaffold,
    db: &mut Db,
) -> Result<f64, WeftError> {
    let request = trace.request_of(output)?;
    let mut weight = unapply_psp(trace, output, scaffold, db)?;
    let mut esr_parents = trace.esr_parents(output).to_vec();
    esr_parents.reverse();
    for root in esr_parents {
        weight += extract(trace, root, scaffold, db)?;
    }
    weight += uneval_requests(trace, request, scaffold, db)?;
    weight += unapply_psp(trace, request, scaffold, db)?;
    Ok(weight)
}
