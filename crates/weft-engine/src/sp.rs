//! The stochastic-procedure contract.
//!
//! A stochastic procedure (SP) is a pair of primitive stochastic procedures
//! (PSPs): the request PSP runs first and may ask the evaluator for shared
//! sub-traces (ESRs) or procedure-private latents (HSRs); the output PSP then
//! produces the application's value. Procedures with per-instance state keep
//! it in an [`SpAux`], which the engine clones into the rollback store before
//! the first mutation of a proposal.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use weft_core::{EnvId, Hsr, NodeId, RequestValue, TraceRng, Value, WeftError};

/// Which side of a stochastic procedure an application node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PspSlot {
    /// The request PSP of the procedure.
    Request,
    /// The output PSP of the procedure.
    Output,
}

/// Scope behaviour of an output PSP, consulted during block selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeRole {
    /// No scope behaviour.
    None,
    /// Tags its third operand's sub-trace into a scope and block.
    Include,
    /// Removes its second operand's sub-trace from a scope.
    Exclude,
}

/// Per-instance mutable sufficient statistics of a made procedure.
///
/// The engine treats auxes as opaque: it clones them into the rollback store
/// and hands them back to the owning procedure's PSPs, which downcast through
/// [`SpAux::as_any`].
pub trait SpAux: fmt::Debug + Send {
    /// Upcast for downcasting by the owning procedure.
    fn as_any(&self) -> &dyn Any;
    /// Mutable upcast for downcasting by the owning procedure.
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// Deep copy, used by the rollback protocol.
    fn clone_aux(&self) -> Box<dyn SpAux>;
}

impl Clone for Box<dyn SpAux> {
    fn clone(&self) -> Self {
        self.clone_aux()
    }
}

/// Procedure-private store for latent state detached alongside a proposal.
pub trait LatentDb: fmt::Debug + Send {
    /// Upcast for downcasting by the owning procedure.
    fn as_any(&self) -> &dyn Any;
    /// Mutable upcast for downcasting by the owning procedure.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Ephemeral view of an application node handed to PSP calls.
///
/// An `Args` is built for the duration of a single PSP invocation and must
/// not be retained by the procedure; it owns copies of the operand and ESR
/// values so the procedure never touches the graph directly.
#[derive(Debug, Clone)]
pub struct Args {
    /// The application node being run.
    pub node: NodeId,
    /// Values of the operand nodes, in order.
    pub operand_values: Vec<Value>,
    /// The operand nodes themselves, in order.
    pub operand_nodes: Vec<NodeId>,
    /// Values of the ESR family roots pulled in by this application.
    pub esr_values: Vec<Value>,
    /// The ESR family roots themselves.
    pub esr_nodes: Vec<NodeId>,
    /// The request emitted by the paired request node, for output PSPs.
    pub request_value: Option<RequestValue>,
    /// Environment the application was evaluated in.
    pub env: EnvId,
}

/// The structural facts a PSP may consult when asked whether it can absorb a
/// change arriving over a particular parent edge.
#[derive(Debug, Clone, Copy)]
pub struct AbsorbQuery<'a> {
    /// The application node.
    pub node: NodeId,
    /// The parent whose resampling the proposal wants to absorb.
    pub parent: NodeId,
    /// Operator node of the application.
    pub operator: NodeId,
    /// Operand nodes of the application.
    pub operand_nodes: &'a [NodeId],
    /// ESR family roots of the application's output node.
    pub esr_parents: &'a [NodeId],
    /// The paired request node, when the queried node is an output.
    pub request_node: Option<NodeId>,
}

/// Result of a simulation: a plain value, or a freshly made procedure.
///
/// Records never enter the graph; the engine moves them into the trace's
/// made-procedure registry and leaves an `SpRef` at the node.
#[derive(Debug, Clone)]
pub enum SimValue {
    /// An ordinary value.
    Plain(Value),
    /// A freshly constructed procedure record.
    Record(SpRecord),
}

impl SimValue {
    /// Returns the plain value, failing on a record.
    pub fn as_plain(&self) -> Result<&Value, WeftError> {
        match self {
            SimValue::Plain(v) => Ok(v),
            SimValue::Record(_) => Err(WeftError::Assertion(
                "expected a plain value, found a procedure record".to_owned(),
            )),
        }
    }

    /// Returns the record, failing on a plain value.
    pub fn as_record(&self) -> Result<&SpRecord, WeftError> {
        match self {
            SimValue::Record(r) => Ok(r),
            SimValue::Plain(v) => Err(WeftError::Assertion(format!(
                "expected a procedure record, found {}",
                v.kind()
            ))),
        }
    }
}

/// A primitive stochastic procedure.
pub trait Psp: fmt::Debug + Send + Sync {
    /// Short stable name, used in diagnostics and arity errors.
    fn name(&self) -> &'static str;

    /// Draws a value for the application described by `args`.
    fn simulate(
        &self,
        args: &Args,
        aux: Option<&dyn SpAux>,
        rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError>;

    /// Scores `value` under the application; only absorbing PSPs answer.
    fn log_density(
        &self,
        _value: &Value,
        _args: &Args,
        _aux: Option<&dyn SpAux>,
    ) -> Result<f64, WeftError> {
        Err(WeftError::Assertion(format!(
            "{} cannot score values",
            self.name()
        )))
    }

    /// Folds `value` into the owning procedure's sufficient statistics.
    fn incorporate(
        &self,
        _value: &Value,
        _args: &Args,
        _aux: Option<&mut dyn SpAux>,
    ) -> Result<(), WeftError> {
        Ok(())
    }

    /// Exact inverse of [`Psp::incorporate`].
    fn unincorporate(
        &self,
        _value: &Value,
        _args: &Args,
        _aux: Option<&mut dyn SpAux>,
    ) -> Result<(), WeftError> {
        Ok(())
    }

    /// Whether applications of this PSP are random choices.
    fn is_random(&self) -> bool {
        false
    }

    /// Whether a change arriving over `query.parent` can be absorbed here.
    fn can_absorb(&self, _query: &AbsorbQuery<'_>) -> bool {
        false
    }

    /// Whether applications of the procedure this PSP makes support
    /// count-based arbitrary-ergodic inference.
    fn children_can_aaa(&self) -> bool {
        false
    }

    /// Whether the output is a reference to its single ESR parent.
    fn is_esr_reference(&self) -> bool {
        false
    }

    /// Whether the request is always empty.
    fn is_null_request(&self) -> bool {
        false
    }

    /// Joint score of everything incorporated into `aux`, for AAA proposals.
    fn log_density_of_counts(&self, _aux: &dyn SpAux) -> Result<f64, WeftError> {
        Err(WeftError::UnsupportedAaa(self.name().to_owned()))
    }

    /// Scope behaviour for block selection.
    fn scope_role(&self) -> ScopeRole {
        ScopeRole::None
    }

    /// Optional delta kernel, consulted when a scaffold asks for one.
    fn delta_kernel(&self) -> Option<Box<dyn crate::lkernel::LKernel>> {
        None
    }
}

/// A stochastic procedure: a request PSP, an output PSP and instance hooks.
pub trait Sp: fmt::Debug + Send + Sync {
    /// Short stable name.
    fn name(&self) -> &'static str;

    /// The request side of the procedure.
    fn request_psp(&self) -> &dyn Psp;

    /// The output side of the procedure.
    fn output_psp(&self) -> &dyn Psp;

    /// Returns the PSP for the given slot.
    fn psp(&self, slot: PspSlot) -> &dyn Psp {
        match slot {
            PspSlot::Request => self.request_psp(),
            PspSlot::Output => self.output_psp(),
        }
    }

    /// Fresh sufficient statistics for a new instance, if the procedure
    /// keeps any.
    fn construct_aux(&self) -> Option<Box<dyn SpAux>> {
        None
    }

    /// Whether the procedure carries an arbitrary-ergodic kernel.
    fn has_ae_kernel(&self) -> bool {
        false
    }

    /// Runs the procedure's arbitrary-ergodic kernel against its aux.
    fn ae_infer(&self, _aux: &mut dyn SpAux, _rng: &mut TraceRng) -> Result<(), WeftError> {
        Err(WeftError::UnsupportedAaa(self.name().to_owned()))
    }

    /// Whether the procedure's requests carry HSRs.
    fn makes_hsrs(&self) -> bool {
        false
    }

    /// Fresh latent store used while detaching this procedure's latents.
    fn construct_latent_db(&self) -> Option<Box<dyn LatentDb>> {
        None
    }

    /// Simulates (or restores) the latents named by `hsr`.
    fn simulate_latents(
        &self,
        _aux: Option<&mut dyn SpAux>,
        _hsr: &Hsr,
        _should_restore: bool,
        _latent_db: Option<&mut dyn LatentDb>,
        _rng: &mut TraceRng,
    ) -> Result<f64, WeftError> {
        Ok(0.0)
    }

    /// Detaches the latents named by `hsr` into `latent_db`.
    fn detach_latents(
        &self,
        _aux: Option<&mut dyn SpAux>,
        _hsr: &Hsr,
        _latent_db: Option<&mut dyn LatentDb>,
    ) -> Result<f64, WeftError> {
        Ok(0.0)
    }

    /// Restores every latent of this procedure from `latent_db`.
    fn restore_all_latents(
        &self,
        _aux: Option<&mut dyn SpAux>,
        _latent_db: &dyn LatentDb,
    ) -> Result<(), WeftError> {
        Ok(())
    }
}

/// A made procedure: the §3 triple of procedure, aux and shared families.
#[derive(Debug, Clone)]
pub struct SpRecord {
    /// The immutable procedure definition; shareable across traces.
    pub sp: Arc<dyn Sp>,
    /// Per-instance sufficient statistics.
    pub aux: Option<Box<dyn SpAux>>,
    /// Family id to ESR family root, for families owned by this instance.
    pub families: BTreeMap<Value, NodeId>,
}

impl SpRecord {
    /// Creates a record with the aux the procedure constructs by default.
    pub fn new(sp: Arc<dyn Sp>) -> Self {
        let aux = sp.construct_aux();
        Self {
            sp,
            aux,
            families: BTreeMap::new(),
        }
    }

    /// Creates a record with an explicit aux.
    pub fn with_aux(sp: Arc<dyn Sp>, aux: Box<dyn SpAux>) -> Self {
        Self {
            sp,
            aux: Some(aux),
            families: BTreeMap::new(),
        }
    }
}

/// Request PSP of procedures that never request anything.
#[derive(Debug, Clone, Copy)]
pub struct NullRequestPsp;

impl Psp for NullRequestPsp {
    fn name(&self) -> &'static str {
        "null-request"
    }

    fn simulate(
        &self,
        _args: &Args,
        _aux: Option<&dyn SpAux>,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        Ok(SimValue::Plain(Value::Request(RequestValue::default())))
    }

    fn log_density(
        &self,
        _value: &Value,
        _args: &Args,
        _aux: Option<&dyn SpAux>,
    ) -> Result<f64, WeftError> {
        Ok(0.0)
    }

    fn can_absorb(&self, _query: &AbsorbQuery<'_>) -> bool {
        true
    }

    fn is_null_request(&self) -> bool {
        true
    }
}

/// Output PSP whose value is a reference to its single ESR parent.
///
/// The engine short-circuits these applications: no simulate or log density
/// runs, and absorption is refused exactly for changes arriving through the
/// request node or the referenced family.
#[derive(Debug, Clone, Copy)]
pub struct EsrRefPsp;

impl Psp for EsrRefPsp {
    fn name(&self) -> &'static str {
        "esr-reference"
    }

    fn simulate(
        &self,
        _args: &Args,
        _aux: Option<&dyn SpAux>,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        Err(WeftError::Assertion(
            "esr-reference outputs are attached, never simulated".to_owned(),
        ))
    }

    fn can_absorb(&self, query: &AbsorbQuery<'_>) -> bool {
        Some(query.parent) != query.request_node && !query.esr_parents.contains(&query.parent)
    }

    fn is_esr_reference(&self) -> bool {
        true
    }
}
