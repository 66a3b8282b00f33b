//! The trace façade: the live graph plus every registry the engine keeps.
//!
//! A trace owns its nodes, environments, made procedures, choice registries,
//! scope bookkeeping and RNG. Directives (`assume`, `predict`, `observe`,
//! `forget`, `freeze`, `report`) are the host-facing surface; kernels drive
//! the trace through scaffolds and the detach/regen pair.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;

use rand::Rng as _;
use weft_core::{DirectiveId, EnvId, EsrEnv, NodeId, TraceRng, Value, WeftError};

use crate::consistency::assert_torus;
use crate::db::Db;
use crate::detach::{self, detach_and_extract, uneval_family};
use crate::env::EnvTable;
use crate::lkernel::DeterministicLKernel;
use crate::node::{Node, NodeKind};
use crate::regen::{self, constrain, regen_and_attach};
use crate::scaffold::{construct_scaffold, Scaffold};
use crate::sp::{AbsorbQuery, Args, PspSlot, Sp, SpAux, SpRecord};
use crate::sps;

/// The live dataflow graph plus bookkeeping.
#[derive(Debug, Clone)]
pub struct Trace {
    pub(crate) nodes: BTreeMap<NodeId, Node>,
    next_node: u64,
    pub(crate) envs: EnvTable,
    pub(crate) global_env: EnvId,
    pub(crate) rng: TraceRng,
    pub(crate) made_sps: BTreeMap<NodeId, SpRecord>,
    pub(crate) aaa_made_auxs: BTreeMap<NodeId, Box<dyn SpAux>>,
    esr_roots: BTreeMap<NodeId, Vec<NodeId>>,
    num_requests: BTreeMap<NodeId, usize>,
    unconstrained: BTreeSet<NodeId>,
    constrained: BTreeSet<NodeId>,
    ae_kernels: BTreeSet<NodeId>,
    scopes: BTreeMap<Value, BTreeMap<Value, BTreeSet<NodeId>>>,
    observed: BTreeMap<NodeId, Value>,
    unpropagated: BTreeMap<NodeId, Value>,
    families: BTreeMap<DirectiveId, NodeId>,
    assumes: BTreeMap<DirectiveId, String>,
    next_directive: u64,
}

impl Trace {
    /// Creates a trace seeded with `seed`, with the built-in procedures and
    /// values bound in the global environment.
    pub fn new(seed: u64) -> Self {
        let mut envs = EnvTable::new();
        let global_env = envs.new_frame(None);
        let mut trace = Self {
            nodes: BTreeMap::new(),
            next_node: 0,
            envs,
            global_env,
            rng: TraceRng::from_seed(seed),
            made_sps: BTreeMap::new(),
            aaa_made_auxs: BTreeMap::new(),
            esr_roots: BTreeMap::new(),
            num_requests: BTreeMap::new(),
            unconstrained: BTreeSet::new(),
            constrained: BTreeSet::new(),
            ae_kernels: BTreeSet::new(),
            scopes: BTreeMap::new(),
            observed: BTreeMap::new(),
            unpropagated: BTreeMap::new(),
            families: BTreeMap::new(),
            assumes: BTreeMap::new(),
            next_directive: 0,
        };
        for (name, value) in sps::builtin_values() {
            let node = trace.create_constant_node(global_env, value);
            let _ = trace.envs.bind(global_env, name, node);
        }
        for (name, sp) in sps::builtin_sps() {
            let node = trace.create_constant_node(global_env, Value::Nil);
            let record = SpRecord::new(sp);
            if record.sp.has_ae_kernel() {
                trace.ae_kernels.insert(node);
            }
            trace.made_sps.insert(node, record);
            if let Some(state) = trace.nodes.get_mut(&node) {
                state.value = Some(Value::SpRef(node));
            }
            let _ = trace.envs.bind(global_env, name, node);
        }
        trace
    }

    /// Master seed of the trace's RNG.
    pub fn seed(&self) -> u64 {
        self.rng.seed()
    }

    /// Reseeds the trace's RNG.
    pub fn reseed(&mut self, seed: u64) {
        self.rng.reseed(seed);
    }

    /// The global environment directives evaluate in.
    pub fn global_env(&self) -> EnvId {
        self.global_env
    }

    // ---- node primitives -------------------------------------------------

    fn mint_node(&mut self, kind: NodeKind, env: EnvId) -> NodeId {
        let id = NodeId::from_raw(self.next_node);
        self.next_node += 1;
        self.nodes.insert(id, Node::new(kind, env));
        id
    }

    pub(crate) fn create_constant_node(&mut self, env: EnvId, value: Value) -> NodeId {
        let id = self.mint_node(NodeKind::Constant, env);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.value = Some(value);
            node.is_active = true;
        }
        id
    }

    pub(crate) fn create_lookup_node(
        &mut self,
        env: EnvId,
        source: NodeId,
    ) -> Result<NodeId, WeftError> {
        let value = self
            .value_at(source)
            .cloned()
            .ok_or_else(|| WeftError::Assertion(format!("lookup source {source:?} has no value")))?;
        let id = self.mint_node(NodeKind::Lookup { source }, env);
        self.add_child(source, id)?;
        if let Some(node) = self.nodes.get_mut(&id) {
            node.value = Some(value);
            node.is_active = true;
        }
        Ok(id)
    }

    pub(crate) fn create_application_nodes(
        &mut self,
        operator: NodeId,
        operands: &[NodeId],
        env: EnvId,
    ) -> Result<(NodeId, NodeId), WeftError> {
        let request = NodeId::from_raw(self.next_node);
        let output = NodeId::from_raw(self.next_node + 1);
        self.next_node += 2;
        self.nodes.insert(
            request,
            Node::new(
                NodeKind::Request {
                    operator,
                    operands: operands.to_vec(),
                    output,
                },
                env,
            ),
        );
        self.nodes.insert(
            output,
            Node::new(
                NodeKind::Output {
                    operator,
                    operands: operands.to_vec(),
                    request,
                },
                env,
            ),
        );
        self.add_child(operator, request)?;
        self.add_child(operator, output)?;
        for operand in operands {
            self.add_child(*operand, request)?;
            self.add_child(*operand, output)?;
        }
        self.add_child(request, output)?;
        Ok((request, output))
    }

    /// Immutable view of a node.
    pub fn node(&self, id: NodeId) -> Result<&Node, WeftError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| WeftError::Assertion(format!("unknown node {id:?}")))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, WeftError> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| WeftError::Assertion(format!("unknown node {id:?}")))
    }

    /// Whether the trace still holds a node with this id.
    pub fn has_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of nodes currently held by the trace.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Current value of a node, if it has one.
    pub fn value_at(&self, id: NodeId) -> Option<&Value> {
        self.nodes.get(&id).and_then(|n| n.value.as_ref())
    }

    pub(crate) fn set_value(&mut self, id: NodeId, value: Value) -> Result<(), WeftError> {
        self.node_mut(id)?.value = Some(value);
        Ok(())
    }

    pub(crate) fn clear_value(&mut self, id: NodeId) -> Result<(), WeftError> {
        self.node_mut(id)?.value = None;
        Ok(())
    }

    pub(crate) fn set_active(&mut self, id: NodeId, active: bool) -> Result<(), WeftError> {
        self.node_mut(id)?.is_active = active;
        Ok(())
    }

    /// Children of a node.
    pub fn children(&self, id: NodeId) -> Result<&BTreeSet<NodeId>, WeftError> {
        Ok(&self.node(id)?.children)
    }

    pub(crate) fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), WeftError> {
        if !self.node_mut(parent)?.children.insert(child) {
            return Err(WeftError::Assertion(format!(
                "edge {parent:?} -> {child:?} added twice"
            )));
        }
        Ok(())
    }

    pub(crate) fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), WeftError> {
        if !self.node_mut(parent)?.children.remove(&child) {
            return Err(WeftError::Assertion(format!(
                "edge {parent:?} -> {child:?} removed twice"
            )));
        }
        Ok(())
    }

    pub(crate) fn disconnect_lookup(&mut self, lookup: NodeId) -> Result<(), WeftError> {
        let source = match &self.node(lookup)?.kind {
            NodeKind::Lookup { source } => *source,
            _ => return Err(WeftError::Assertion(format!("{lookup:?} is not a lookup"))),
        };
        self.remove_child(source, lookup)
    }

    pub(crate) fn reconnect_lookup(&mut self, lookup: NodeId) -> Result<(), WeftError> {
        let source = match &self.node(lookup)?.kind {
            NodeKind::Lookup { source } => *source,
            _ => return Err(WeftError::Assertion(format!("{lookup:?} is not a lookup"))),
        };
        self.add_child(source, lookup)
    }

    // ---- ESR accounting --------------------------------------------------

    /// ESR family roots of an output node, in request order.
    pub fn esr_parents(&self, node: NodeId) -> &[NodeId] {
        self.esr_roots
            .get(&node)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Number of live requests against a family root.
    pub fn num_requests(&self, root: NodeId) -> usize {
        self.num_requests.get(&root).copied().unwrap_or(0)
    }

    pub(crate) fn add_esr_edge(&mut self, root: NodeId, output: NodeId) -> Result<(), WeftError> {
        *self.num_requests.entry(root).or_insert(0) += 1;
        self.add_child(root, output)?;
        self.esr_roots.entry(output).or_default().push(root);
        Ok(())
    }

    pub(crate) fn pop_last_esr_parent(&mut self, output: NodeId) -> Result<NodeId, WeftError> {
        let root = self
            .esr_roots
            .get_mut(&output)
            .and_then(|v| v.pop())
            .ok_or_else(|| {
                WeftError::Assertion(format!("output {output:?} has no esr parents to pop"))
            })?;
        self.remove_child(root, output)?;
        match self.num_requests.get_mut(&root) {
            Some(count) if *count > 0 => *count -= 1,
            _ => {
                return Err(WeftError::Assertion(format!(
                    "request count of {root:?} would go negative"
                )))
            }
        }
        Ok(root)
    }

    // ---- operators and procedures ---------------------------------------

    /// The maker node of the procedure an application node runs.
    pub fn operator_maker(&self, app: NodeId) -> Result<NodeId, WeftError> {
        let operator = match &self.node(app)?.kind {
            NodeKind::Request { operator, .. } | NodeKind::Output { operator, .. } => *operator,
            _ => {
                return Err(WeftError::Assertion(format!(
                    "{app:?} is not an application node"
                )))
            }
        };
        let value = self.value_at(operator).ok_or_else(|| {
            WeftError::Assertion(format!("operator {operator:?} has no value"))
        })?;
        value.as_sp_ref()
    }

    /// The procedure an application node runs.
    pub fn sp_at(&self, app: NodeId) -> Result<Arc<dyn Sp>, WeftError> {
        let maker = self.operator_maker(app)?;
        Ok(self
            .made_sps
            .get(&maker)
            .ok_or_else(|| WeftError::Assertion(format!("no procedure made at {maker:?}")))?
            .sp
            .clone())
    }

    /// Which PSP slot an application node runs.
    pub fn psp_slot(&self, app: NodeId) -> Result<PspSlot, WeftError> {
        match &self.node(app)?.kind {
            NodeKind::Request { .. } => Ok(PspSlot::Request),
            NodeKind::Output { .. } => Ok(PspSlot::Output),
            _ => Err(WeftError::Assertion(format!(
                "{app:?} is not an application node"
            ))),
        }
    }

    /// The paired output of a request node.
    pub(crate) fn output_of(&self, request: NodeId) -> Result<NodeId, WeftError> {
        match &self.node(request)?.kind {
            NodeKind::Request { output, .. } => Ok(*output),
            _ => Err(WeftError::Assertion(format!("{request:?} is not a request"))),
        }
    }

    /// The paired request of an output node.
    pub(crate) fn request_of(&self, output: NodeId) -> Result<NodeId, WeftError> {
        match &self.node(output)?.kind {
            NodeKind::Output { request, .. } => Ok(*request),
            _ => Err(WeftError::Assertion(format!("{output:?} is not an output"))),
        }
    }

    /// The record a maker node produced, if it is live.
    pub fn made_record(&self, maker: NodeId) -> Option<&SpRecord> {
        self.made_sps.get(&maker)
    }

    /// The aux of the procedure made at `maker`, if any.
    pub fn made_aux(&self, maker: NodeId) -> Option<&dyn SpAux> {
        self.made_sps
            .get(&maker)
            .and_then(|r| r.aux.as_deref())
    }

    pub(crate) fn operator_aux(&self, maker: NodeId) -> Option<&dyn SpAux> {
        self.made_aux(maker)
    }

    pub(crate) fn with_aux_mut<T>(
        &mut self,
        maker: NodeId,
        f: impl FnOnce(Option<&mut dyn SpAux>) -> T,
    ) -> T {
        let aux: Option<&mut dyn SpAux> = match self.made_sps.get_mut(&maker) {
            Some(r) => match &mut r.aux {
                Some(b) => Some(b.as_mut()),
                None => None,
            },
            None => None,
        };
        f(aux)
    }

    pub(crate) fn take_made_record(&mut self, maker: NodeId) -> Result<SpRecord, WeftError> {
        self.made_sps
            .remove(&maker)
            .ok_or_else(|| WeftError::Assertion(format!("no procedure made at {maker:?}")))
    }

    pub(crate) fn install_made_sp(
        &mut self,
        maker: NodeId,
        record: SpRecord,
    ) -> Result<(), WeftError> {
        if self.made_sps.contains_key(&maker) {
            return Err(WeftError::Assertion(format!(
                "node {maker:?} already made a procedure"
            )));
        }
        if record.sp.has_ae_kernel() {
            self.register_ae_kernel(maker)?;
        }
        self.made_sps.insert(maker, record);
        self.aaa_made_auxs.remove(&maker);
        self.set_value(maker, Value::SpRef(maker))
    }

    pub(crate) fn stash_aaa_aux(&mut self, maker: NodeId, aux: Box<dyn SpAux>) {
        self.aaa_made_auxs.insert(maker, aux);
    }

    pub(crate) fn aaa_aux(&self, maker: NodeId) -> Option<&dyn SpAux> {
        self.aaa_made_auxs.get(&maker).map(|b| b.as_ref())
    }

    /// Registers a shared family under its maker.
    pub(crate) fn register_family(
        &mut self,
        maker: NodeId,
        id: Value,
        root: NodeId,
    ) -> Result<(), WeftError> {
        let record = self
            .made_sps
            .get_mut(&maker)
            .ok_or_else(|| WeftError::Assertion(format!("no procedure made at {maker:?}")))?;
        if record.families.insert(id, root).is_some() {
            return Err(WeftError::Assertion(
                "family id registered twice under one maker".to_owned(),
            ));
        }
        Ok(())
    }

    pub(crate) fn unregister_family(
        &mut self,
        maker: NodeId,
        id: &Value,
    ) -> Result<NodeId, WeftError> {
        let record = self
            .made_sps
            .get_mut(&maker)
            .ok_or_else(|| WeftError::Assertion(format!("no procedure made at {maker:?}")))?;
        record.families.remove(id).ok_or_else(|| {
            WeftError::Assertion("family id unregistered without being registered".to_owned())
        })
    }

    /// Root of the family `id` under `maker`, if registered.
    pub fn family_root(&self, maker: NodeId, id: &Value) -> Option<NodeId> {
        self.made_sps
            .get(&maker)
            .and_then(|r| r.families.get(id))
            .copied()
    }

    // ---- absorption queries ----------------------------------------------

    /// Whether `node` can absorb a change arriving through `parent`.
    pub fn can_absorb(&self, node: NodeId, parent: NodeId) -> Result<bool, WeftError> {
        let state = self.node(node)?;
        let (operator, operands, request_node) = match &state.kind {
            NodeKind::Request {
                operator, operands, ..
            } => (*operator, operands.as_slice(), None),
            NodeKind::Output {
                operator,
                operands,
                request,
            } => (*operator, operands.as_slice(), Some(*request)),
            _ => return Ok(false),
        };
        let sp = self.sp_at(node)?;
        let slot = self.psp_slot(node)?;
        let query = AbsorbQuery {
            node,
            parent,
            operator,
            operand_nodes: operands,
            esr_parents: self.esr_parents(node),
            request_node,
        };
        Ok(sp.psp(slot).can_absorb(&query))
    }

    pub(crate) fn can_absorb_observation(&self, node: NodeId) -> Result<bool, WeftError> {
        let operator = match &self.node(node)?.kind {
            NodeKind::Output { operator, .. } => *operator,
            _ => return Ok(false),
        };
        self.can_absorb(node, operator)
    }

    /// The node where absorption reads and writes statistics: the made
    /// record for maker nodes, the operator's record otherwise.
    pub(crate) fn absorb_target(&self, node: NodeId) -> Result<NodeId, WeftError> {
        match self.value_at(node) {
            Some(Value::SpRef(maker)) if *maker == node => Ok(node),
            _ => self.operator_maker(node),
        }
    }

    // ---- args ------------------------------------------------------------

    pub(crate) fn args_at(&self, node: NodeId) -> Result<Args, WeftError> {
        let state = self.node(node)?;
        let operand_values = |operands: &[NodeId]| -> Result<Vec<Value>, WeftError> {
            operands
                .iter()
                .map(|o| {
                    self.value_at(*o).cloned().ok_or_else(|| {
                        WeftError::Assertion(format!("operand {o:?} has no value"))
                    })
                })
                .collect()
        };
        match &state.kind {
            NodeKind::Request { operands, .. } => Ok(Args {
                node,
                operand_values: operand_values(operands)?,
                operand_nodes: operands.clone(),
                esr_values: Vec::new(),
                esr_nodes: Vec::new(),
                request_value: None,
                env: state.env,
            }),
            NodeKind::Output {
                operands, request, ..
            } => {
                let esr_nodes = self.esr_parents(node).to_vec();
                let esr_values = esr_nodes
                    .iter()
                    .map(|r| {
                        self.value_at(*r).cloned().ok_or_else(|| {
                            WeftError::Assertion(format!("esr parent {r:?} has no value"))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let request_value = match self.value_at(*request) {
                    Some(v) => Some(v.as_request()?.clone()),
                    None => None,
                };
                Ok(Args {
                    node,
                    operand_values: operand_values(operands)?,
                    operand_nodes: operands.clone(),
                    esr_values,
                    esr_nodes,
                    request_value,
                    env: state.env,
                })
            }
            _ => Err(WeftError::Assertion(format!(
                "{node:?} is not an application node"
            ))),
        }
    }

    // ---- environments ----------------------------------------------------

    pub(crate) fn find_symbol(&self, env: EnvId, symbol: &str) -> Result<NodeId, WeftError> {
        self.envs.find_symbol(env, symbol)
    }

    pub(crate) fn resolve_esr_env(
        &mut self,
        esr_env: &EsrEnv,
        request_node: NodeId,
    ) -> Result<EnvId, WeftError> {
        match esr_env {
            EsrEnv::Existing(env) => Ok(*env),
            EsrEnv::Frame { parent, bindings } => {
                let frame = self.envs.new_frame(*parent);
                for (symbol, node) in bindings {
                    self.envs.bind(frame, symbol, *node)?;
                }
                Ok(frame)
            }
            EsrEnv::WithOperands { parent, params } => {
                let operands = match &self.node(request_node)?.kind {
                    NodeKind::Request { operands, .. } => operands.clone(),
                    _ => {
                        return Err(WeftError::Assertion(format!(
                            "{request_node:?} is not a request node"
                        )))
                    }
                };
                if operands.len() != params.len() {
                    let name = self.sp_at(request_node)?.name();
                    return Err(WeftError::arity(name, params.len(), operands.len()));
                }
                let frame = self.envs.new_frame(Some(*parent));
                for (param, operand) in params.iter().zip(&operands) {
                    self.envs.bind(frame, param, *operand)?;
                }
                Ok(frame)
            }
        }
    }

    // ---- choice registries -----------------------------------------------

    fn default_scope() -> Value {
        Value::symbol("default")
    }

    /// The unconstrained random choices of the trace.
    pub fn unconstrained_choices(&self) -> &BTreeSet<NodeId> {
        &self.unconstrained
    }

    /// The constrained random choices of the trace.
    pub fn constrained_choices(&self) -> &BTreeSet<NodeId> {
        &self.constrained
    }

    /// Makers whose procedures carry arbitrary-ergodic kernels.
    pub fn ae_kernel_makers(&self) -> &BTreeSet<NodeId> {
        &self.ae_kernels
    }

    pub(crate) fn register_unconstrained_choice(&mut self, node: NodeId) -> Result<(), WeftError> {
        if !self.unconstrained.insert(node) {
            return Err(WeftError::Assertion(format!(
                "choice {node:?} registered twice"
            )));
        }
        self.register_choice_in_scope(Self::default_scope(), Value::Node(node), node)
    }

    pub(crate) fn unregister_unconstrained_choice(
        &mut self,
        node: NodeId,
    ) -> Result<(), WeftError> {
        self.unregister_choice_in_scope(&Self::default_scope(), &Value::Node(node), node)?;
        if !self.unconstrained.remove(&node) {
            return Err(WeftError::Assertion(format!(
                "choice {node:?} unregistered without being registered"
            )));
        }
        Ok(())
    }

    pub(crate) fn register_constrained_choice(&mut self, node: NodeId) -> Result<(), WeftError> {
        if self.constrained.contains(&node) {
            return Err(WeftError::DoubleConstrain);
        }
        self.constrained.insert(node);
        self.unregister_unconstrained_choice(node)
    }

    pub(crate) fn unregister_constrained_choice(&mut self, node: NodeId) -> Result<(), WeftError> {
        if !self.constrained.remove(&node) {
            return Err(WeftError::Assertion(format!(
                "choice {node:?} was not constrained"
            )));
        }
        let sp = self.sp_at(node)?;
        if sp.output_psp().is_random() {
            self.register_unconstrained_choice(node)?;
        }
        Ok(())
    }

    pub(crate) fn register_choice_in_scope(
        &mut self,
        scope: Value,
        block: Value,
        node: NodeId,
    ) -> Result<(), WeftError> {
        let blocks = self.scopes.entry(scope).or_default();
        let members = blocks.entry(block).or_default();
        if !members.insert(node) {
            return Err(WeftError::Assertion(format!(
                "node {node:?} tagged twice into one block"
            )));
        }
        Ok(())
    }

    pub(crate) fn unregister_choice_in_scope(
        &mut self,
        scope: &Value,
        block: &Value,
        node: NodeId,
    ) -> Result<(), WeftError> {
        let blocks = self.scopes.get_mut(scope).ok_or_else(|| {
            WeftError::Assertion(format!("scope {scope} has no registered blocks"))
        })?;
        let members = blocks
            .get_mut(block)
            .ok_or_else(|| WeftError::Assertion(format!("block {block} is empty")))?;
        if !members.remove(&node) {
            return Err(WeftError::Assertion(format!(
                "node {node:?} was not tagged into block {block}"
            )));
        }
        if members.is_empty() {
            blocks.remove(block);
        }
        if blocks.is_empty() {
            self.scopes.remove(scope);
        }
        Ok(())
    }

    pub(crate) fn register_ae_kernel(&mut self, maker: NodeId) -> Result<(), WeftError> {
        if !self.ae_kernels.insert(maker) {
            return Err(WeftError::Assertion(format!(
                "arbitrary-ergodic kernel registered twice for {maker:?}"
            )));
        }
        Ok(())
    }

    pub(crate) fn unregister_ae_kernel(&mut self, maker: NodeId) -> Result<(), WeftError> {
        if !self.ae_kernels.remove(&maker) {
            return Err(WeftError::Assertion(format!(
                "arbitrary-ergodic kernel missing for {maker:?}"
            )));
        }
        Ok(())
    }

    /// Runs the arbitrary-ergodic kernel of the procedure made at `maker`.
    pub fn run_ae_kernel(&mut self, maker: NodeId) -> Result<(), WeftError> {
        regen::ae_infer_at(self, maker)
    }

    // ---- observations ----------------------------------------------------

    pub(crate) fn is_observation(&self, node: NodeId) -> bool {
        self.observed.contains_key(&node)
    }

    pub(crate) fn observed_value(&self, node: NodeId) -> Option<Value> {
        self.observed.get(&node).cloned()
    }

    /// Observations recorded but not yet propagated into constraints.
    pub fn unpropagated_observations(&self) -> &BTreeMap<NodeId, Value> {
        &self.unpropagated
    }

    /// Follows reference chains to the application that owns the choice.
    pub fn constrainable_node(&self, node: NodeId) -> Result<NodeId, WeftError> {
        let mut cursor = node;
        loop {
            match &self.node(cursor)?.kind {
                NodeKind::Lookup { source } => cursor = *source,
                NodeKind::Output { .. } => {
                    let sp = self.sp_at(cursor)?;
                    if sp.output_psp().is_esr_reference() {
                        cursor = *self.esr_parents(cursor).first().ok_or_else(|| {
                            WeftError::Assertion(format!(
                                "esr-reference output {cursor:?} has no esr parent"
                            ))
                        })?;
                    } else {
                        return Ok(cursor);
                    }
                }
                NodeKind::Constant => {
                    return Err(WeftError::Observation(
                        "cannot constrain a constant value".to_owned(),
                    ))
                }
                NodeKind::Request { .. } => {
                    return Err(WeftError::Assertion(
                        "reference chains never pass through request nodes".to_owned(),
                    ))
                }
            }
        }
    }

    // ---- scopes and blocks -----------------------------------------------

    /// Number of blocks registered in a scope.
    pub fn num_blocks(&self, scope: &Value) -> usize {
        self.scopes.get(scope).map(|b| b.len()).unwrap_or(0)
    }

    /// Draws a block of `scope` uniformly at random.
    pub fn sample_block(&mut self, scope: &Value) -> Result<Value, WeftError> {
        let blocks: Vec<Value> = self
            .scopes
            .get(scope)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default();
        if blocks.is_empty() {
            return Err(WeftError::Assertion(format!("scope {scope} has no blocks")));
        }
        let index = self.rng.gen_range(0..blocks.len());
        Ok(blocks[index].clone())
    }

    /// The unconstrained choices governed by `block` of `scope`.
    ///
    /// For the default scope each block is the singleton of its node. For
    /// named scopes the tagged sub-traces are walked transitively, honoring
    /// nested include and exclude annotations.
    pub fn nodes_in_block(
        &self,
        scope: &Value,
        block: &Value,
    ) -> Result<BTreeSet<NodeId>, WeftError> {
        let tagged = self
            .scopes
            .get(scope)
            .and_then(|b| b.get(block))
            .cloned()
            .unwrap_or_default();
        if *scope == Self::default_scope() {
            return Ok(tagged);
        }
        let mut pnodes = BTreeSet::new();
        for node in tagged {
            self.add_unconstrained_choices_in_block(scope, block, &mut pnodes, node)?;
        }
        Ok(pnodes)
    }

    /// Alias of [`Trace::nodes_in_block`], the kernel-facing selection call.
    pub fn select(&self, scope: &Value, block: &Value) -> Result<BTreeSet<NodeId>, WeftError> {
        self.nodes_in_block(scope, block)
    }

    fn add_unconstrained_choices_in_block(
        &self,
        scope: &Value,
        block: &Value,
        pnodes: &mut BTreeSet<NodeId>,
        node: NodeId,
    ) -> Result<(), WeftError> {
        let (operator, operands, request) = match &self.node(node)?.kind {
            NodeKind::Output {
                operator,
                operands,
                request,
            } => (*operator, operands.clone(), *request),
            _ => return Ok(()),
        };
        let sp = self.sp_at(node)?;
        if sp.output_psp().is_random() && self.unconstrained.contains(&node) {
            pnodes.insert(node);
        }
        if sp.request_psp().is_random() && self.unconstrained.contains(&request) {
            pnodes.insert(request);
        }

        if let Some(Value::Request(request_value)) = self.value_at(request) {
            let request_value = request_value.clone();
            let maker = self.operator_maker(request)?;
            for esr in &request_value.esrs {
                if let Some(root) = self.family_root(maker, &esr.id) {
                    self.add_unconstrained_choices_in_block(scope, block, pnodes, root)?;
                }
            }
        }

        self.add_unconstrained_choices_in_block(scope, block, pnodes, operator)?;
        let role = sp.output_psp().scope_role();
        for (index, operand) in operands.iter().enumerate() {
            let recurse = match role {
                crate::sp::ScopeRole::Include if index == 2 => {
                    let new_scope = self.value_at(operands[0]);
                    let new_block = self.value_at(operands[1]);
                    new_scope != Some(scope) || new_block == Some(block)
                }
                crate::sp::ScopeRole::Exclude if index == 1 => {
                    self.value_at(operands[0]) != Some(scope)
                }
                _ => true,
            };
            if recurse {
                self.add_unconstrained_choices_in_block(scope, block, pnodes, *operand)?;
            }
        }
        Ok(())
    }

    // ---- directives ------------------------------------------------------

    fn mint_directive(&mut self) -> DirectiveId {
        let id = DirectiveId::from_raw(self.next_directive);
        self.next_directive += 1;
        id
    }

    fn with_rollback<T>(
        &mut self,
        run: impl FnOnce(&mut Self) -> Result<T, WeftError>,
    ) -> Result<T, WeftError> {
        let snapshot = self.clone();
        match run(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                if !err.poisons_trace() {
                    *self = snapshot;
                }
                Err(err)
            }
        }
    }

    fn eval_expression(&mut self, exp: &Value) -> Result<(NodeId, Value), WeftError> {
        let mut scaffold = Scaffold::empty();
        let mut db = Db::new();
        let env = self.global_env;
        let (_weight, root) = regen::eval_family(self, exp, env, &mut scaffold, false, &mut db)?;
        let value = self
            .value_at(root)
            .cloned()
            .ok_or_else(|| WeftError::Assertion(format!("family root {root:?} has no value")))?;
        Ok((root, value))
    }

    /// Builds a family for `exp`, binds `symbol` to its root in the global
    /// environment, and returns the directive id and the root's value.
    pub fn assume(
        &mut self,
        symbol: &str,
        exp: Value,
    ) -> Result<(DirectiveId, Value), WeftError> {
        self.with_rollback(|trace| {
            let (root, value) = trace.eval_expression(&exp)?;
            let global = trace.global_env;
            trace.envs.bind(global, symbol, root)?;
            let id = trace.mint_directive();
            trace.families.insert(id, root);
            trace.assumes.insert(id, symbol.to_owned());
            Ok((id, value))
        })
    }

    /// Builds a family for `exp` and returns the directive id and value.
    pub fn predict(&mut self, exp: Value) -> Result<(DirectiveId, Value), WeftError> {
        self.with_rollback(|trace| {
            let (root, value) = trace.eval_expression(&exp)?;
            let id = trace.mint_directive();
            trace.families.insert(id, root);
            Ok((id, value))
        })
    }

    /// Builds a family for `exp` and records `value` as a pending
    /// observation on its root. The constraint lands at the next
    /// [`Trace::make_consistent`].
    pub fn observe(&mut self, exp: Value, value: Value) -> Result<DirectiveId, WeftError> {
        self.with_rollback(|trace| {
            let (root, _current) = trace.eval_expression(&exp)?;
            // Fail fast on observations no propagation could ever satisfy.
            let _target = trace.constrainable_node(root)?;
            let id = trace.mint_directive();
            trace.families.insert(id, root);
            trace.unpropagated.insert(root, value.clone());
            Ok(id)
        })
    }

    /// Current value of a directive's family root.
    pub fn report(&self, id: DirectiveId) -> Result<Value, WeftError> {
        let root = self.family_root_of(id).ok_or_else(|| {
            WeftError::Assertion(format!("unknown directive {:?}", id.as_raw()))
        })?;
        self.value_at(root)
            .cloned()
            .ok_or_else(|| WeftError::Assertion(format!("family root {root:?} has no value")))
    }

    /// Family root of a directive, if the directive is live.
    pub fn family_root_of(&self, id: DirectiveId) -> Option<NodeId> {
        self.families.get(&id).copied()
    }

    /// Propagates every pending observation into a constraint.
    ///
    /// Each observation gets a singleton scaffold around the outermost
    /// non-reference application above its root; the sub-trace is detached,
    /// regenerated under a deterministic kernel that installs the observed
    /// value, and the choice is constrained. An observation whose insertion
    /// weight is negative infinity rolls the sub-trace back and fails.
    pub fn make_consistent(&mut self) -> Result<f64, WeftError> {
        let pending: Vec<(NodeId, Value)> = self
            .unpropagated
            .iter()
            .map(|(node, value)| (*node, value.clone()))
            .collect();
        let mut total = 0.0;
        for (root, value) in pending {
            let app = self.constrainable_node(root)?;
            let mut pnodes = BTreeSet::new();
            pnodes.insert(app);
            let mut scaffold = construct_scaffold(self, &[pnodes], false)?;
            let (rho, mut db) = detach_and_extract(self, &mut scaffold)?;
            assert_torus(self, &scaffold)?;
            let sp = self.sp_at(app)?;
            scaffold.register_lkernel(
                app,
                Box::new(DeterministicLKernel::new(value.clone(), sp, PspSlot::Output)),
            );
            let mut forward_db = Db::new();
            let xi = regen_and_attach(self, &mut scaffold, false, &mut forward_db)?;
            if xi == f64::NEG_INFINITY {
                let (_reverse, undo_db) = detach_and_extract(self, &mut scaffold)?;
                regen_and_attach(self, &mut scaffold, true, &mut db)?;
                self.dispose(undo_db)?;
                return Err(WeftError::UnpropagatedObservation);
            }
            constrain(self, root, &value)?;
            self.observed.insert(root, value.clone());
            self.unpropagated.remove(&root);
            self.dispose(db)?;
            total += xi - rho;
        }
        Ok(total)
    }

    /// Unevaluates a directive's family, releasing its constraint first if
    /// it was observed.
    pub fn forget(&mut self, id: DirectiveId) -> Result<(), WeftError> {
        let root = self.family_root_of(id).ok_or_else(|| {
            WeftError::Assertion(format!("unknown directive {:?}", id.as_raw()))
        })?;
        if !self.children(root)?.is_empty() {
            return Err(WeftError::Observation(
                "cannot forget a directive other directives reference".to_owned(),
            ));
        }
        self.unpropagated.remove(&root);
        if self.observed.remove(&root).is_some() {
            let target = self.constrainable_node(root)?;
            if self.node(target)?.is_constrained {
                detach::unconstrain(self, target)?;
            }
        }
        let mut scaffold = Scaffold::empty();
        let mut db = Db::new();
        uneval_family(self, root, &mut scaffold, &mut db)?;
        if let Some(symbol) = self.assumes.remove(&id) {
            if self.envs.lookup(self.global_env, &symbol)? == Some(root) {
                let global = self.global_env;
                self.envs.unbind(global, &symbol)?;
            }
        }
        self.families.remove(&id);
        let mut doomed = Vec::new();
        self.collect_family_nodes(root, &mut doomed)?;
        for node in doomed {
            self.remove_node(node)?;
        }
        self.dispose(db)?;
        Ok(())
    }

    /// Collapses a directive's family to a constant of its current value.
    ///
    /// The operator, operand and request nodes are deleted; the root stays,
    /// now a constant, so `report` keeps answering. Kernels can no longer
    /// select anything inside the former family.
    pub fn freeze(&mut self, id: DirectiveId) -> Result<(), WeftError> {
        let root = self.family_root_of(id).ok_or_else(|| {
            WeftError::Assertion(format!("unknown directive {:?}", id.as_raw()))
        })?;
        if self.unpropagated.contains_key(&root) {
            return Err(WeftError::Observation(
                "cannot freeze a directive with a pending observation".to_owned(),
            ));
        }
        match self.node(root)?.kind.clone() {
            NodeKind::Constant => Ok(()),
            NodeKind::Output {
                operator,
                operands,
                request,
            } => {
                let value = self.value_at(root).cloned().ok_or_else(|| {
                    WeftError::Assertion(format!("family root {root:?} has no value"))
                })?;
                let mut scaffold = Scaffold::empty();
                let mut db = Db::new();
                uneval_family(self, root, &mut scaffold, &mut db)?;
                {
                    let state = self.node_mut(root)?;
                    state.kind = NodeKind::Constant;
                    state.value = Some(value);
                    state.is_active = true;
                }
                let mut doomed = vec![request];
                self.collect_family_nodes(operator, &mut doomed)?;
                for operand in operands {
                    self.collect_family_nodes(operand, &mut doomed)?;
                }
                for node in doomed {
                    self.remove_node(node)?;
                }
                self.dispose(db)?;
                Ok(())
            }
            NodeKind::Lookup { .. } => {
                // A bare symbol directive freezes to its current value too.
                let value = self.value_at(root).cloned().ok_or_else(|| {
                    WeftError::Assertion(format!("family root {root:?} has no value"))
                })?;
                self.disconnect_lookup(root)?;
                let state = self.node_mut(root)?;
                state.kind = NodeKind::Constant;
                state.value = Some(value);
                Ok(())
            }
            NodeKind::Request { .. } => Err(WeftError::Assertion(
                "families are never rooted at request nodes".to_owned(),
            )),
        }
    }

    // ---- reclamation -----------------------------------------------------

    fn collect_family_nodes(
        &self,
        node: NodeId,
        out: &mut Vec<NodeId>,
    ) -> Result<(), WeftError> {
        if !self.has_node(node) {
            return Ok(());
        }
        match self.node(node)?.kind.clone() {
            NodeKind::Constant | NodeKind::Lookup { .. } => out.push(node),
            NodeKind::Output {
                operator,
                operands,
                request,
            } => {
                self.collect_family_nodes(operator, out)?;
                for operand in operands {
                    self.collect_family_nodes(operand, out)?;
                }
                out.push(request);
                out.push(node);
            }
            NodeKind::Request { .. } => out.push(node),
        }
        Ok(())
    }

    fn remove_node(&mut self, node: NodeId) -> Result<(), WeftError> {
        self.nodes.remove(&node);
        self.esr_roots.remove(&node);
        self.num_requests.remove(&node);
        Ok(())
    }

    /// Reclaims the nodes of families a committed proposal's store carries.
    ///
    /// Families the paired regen restored are still active and are left
    /// alone, so disposing a store is always safe; it only collects what is
    /// actually dead.
    pub fn dispose(&mut self, db: Db) -> Result<(), WeftError> {
        for root in db.family_roots() {
            if !self.has_node(root) {
                continue;
            }
            if self.node(root)?.is_active {
                continue;
            }
            let mut doomed = Vec::new();
            self.collect_family_nodes(root, &mut doomed)?;
            for node in doomed {
                self.remove_node(node)?;
            }
        }
        Ok(())
    }

    // ---- introspection ---------------------------------------------------

    /// Active nodes in id order.
    pub fn active_nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.is_active)
            .map(|(id, node)| (*id, node))
    }

    /// Output nodes currently holding ESR parents.
    pub fn outputs_with_esr_parents(&self) -> Vec<NodeId> {
        self.esr_roots
            .iter()
            .filter(|(_, roots)| !roots.is_empty())
            .map(|(output, _)| *output)
            .collect()
    }

    /// Family roots with a live (non-zero) request count.
    pub fn roots_with_requests(&self) -> Vec<NodeId> {
        self.num_requests
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(root, _)| *root)
            .collect()
    }

    // ---- diagnostics -----------------------------------------------------

    /// Deterministic dump of the full trace state.
    ///
    /// Two traces with identical graphs, values, statistics and registries
    /// produce identical strings; round-trip tests compare these before and
    /// after a restoring regeneration.
    pub fn canonical_state(&self) -> String {
        let mut out = String::new();
        for (id, node) in &self.nodes {
            let _ = writeln!(
                out,
                "node {} kind={:?} value={:?} active={} constrained={}",
                id.as_raw(),
                node.kind,
                node.value,
                node.is_active,
                node.is_constrained
            );
            if !node.children.is_empty() {
                let _ = writeln!(out, "  children {:?}", node.children);
            }
        }
        for (output, roots) in &self.esr_roots {
            if !roots.is_empty() {
                let _ = writeln!(out, "esr {} -> {:?}", output.as_raw(), roots);
            }
        }
        for (root, count) in &self.num_requests {
            if *count > 0 {
                let _ = writeln!(out, "requests {} = {}", root.as_raw(), count);
            }
        }
        for (maker, record) in &self.made_sps {
            let _ = writeln!(
                out,
                "made {} sp={} aux={:?} families={:?}",
                maker.as_raw(),
                record.sp.name(),
                record.aux,
                record.families
            );
        }
        let _ = writeln!(out, "unconstrained {:?}", self.unconstrained);
        let _ = writeln!(out, "constrained {:?}", self.constrained);
        let _ = writeln!(out, "ae {:?}", self.ae_kernels);
        let _ = writeln!(out, "scopes {:?}", self.scopes);
        let _ = writeln!(out, "observed {:?}", self.observed);
        out
    }
}
