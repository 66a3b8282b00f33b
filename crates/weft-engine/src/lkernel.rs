//! Local kernels: per-node overrides of simulate and weight.

use std::fmt;
use std::sync::Arc;

use weft_core::{TraceRng, Value, WeftError};

use crate::sp::{Args, PspSlot, SimValue, Sp, SpAux};

/// Read-only state handed to a kernel invocation.
#[derive(Clone, Copy)]
pub struct KernelCtx<'a> {
    /// The value the node carried before detach, when a store has it.
    pub old: Option<&'a SimValue>,
    /// Aux stashed when an arbitrary-ergodic maker was torn down.
    pub made_aux: Option<&'a dyn SpAux>,
    /// Aux of the procedure being applied, if any.
    pub aux: Option<&'a dyn SpAux>,
}

impl fmt::Debug for KernelCtx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCtx")
            .field("has_old", &self.old.is_some())
            .field("has_made_aux", &self.made_aux.is_some())
            .finish_non_exhaustive()
    }
}

/// A local kernel overriding the default proposal at one node.
pub trait LKernel: fmt::Debug + Send + Sync {
    /// Proposes a value for the node.
    fn simulate(
        &self,
        ctx: &KernelCtx<'_>,
        args: &Args,
        rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError>;

    /// Forward weight of the proposed value.
    fn weight(
        &self,
        new: &SimValue,
        ctx: &KernelCtx<'_>,
        args: &Args,
    ) -> Result<f64, WeftError>;

    /// Reverse weight of the value being detached; defaults to scoring it
    /// the way the forward direction would.
    fn reverse_weight(
        &self,
        old: &SimValue,
        ctx: &KernelCtx<'_>,
        args: &Args,
    ) -> Result<f64, WeftError> {
        self.weight(old, ctx, args)
    }
}

/// Kernel that deterministically installs a fixed value.
///
/// Drives observation propagation: the node is forced to the observed value
/// and the weight is the density of that value under the node's own PSP.
#[derive(Debug)]
pub struct DeterministicLKernel {
    value: Value,
    sp: Arc<dyn Sp>,
    slot: PspSlot,
}

impl DeterministicLKernel {
    /// Creates a kernel forcing `value` through the given PSP.
    pub fn new(value: Value, sp: Arc<dyn Sp>, slot: PspSlot) -> Self {
        Self { value, sp, slot }
    }
}

impl LKernel for DeterministicLKernel {
    fn simulate(
        &self,
        _ctx: &KernelCtx<'_>,
        _args: &Args,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        Ok(SimValue::Plain(self.value.clone()))
    }

    fn weight(
        &self,
        new: &SimValue,
        ctx: &KernelCtx<'_>,
        args: &Args,
    ) -> Result<f64, WeftError> {
        let value = new.as_plain()?;
        self.sp.psp(self.slot).log_density(value, args, ctx.aux)
    }
}

/// Kernel driving an arbitrary-ergodic maker.
///
/// The maker is re-simulated, the detached instance's statistics are adopted
/// wholesale, and the weight is the joint score of those statistics under
/// the new instance. Downstream absorbing applications are never touched
/// individually.
#[derive(Debug)]
pub struct AaaKernel {
    maker: Arc<dyn Sp>,
}

impl AaaKernel {
    /// Creates the kernel for a maker procedure.
    pub fn new(maker: Arc<dyn Sp>) -> Self {
        Self { maker }
    }

    fn counts_weight(record: &crate::sp::SpRecord) -> Result<f64, WeftError> {
        let aux = record.aux.as_deref().ok_or_else(|| {
            WeftError::Assertion("arbitrary-ergodic maker lost its aux".to_owned())
        })?;
        record.sp.output_psp().log_density_of_counts(aux)
    }
}

impl LKernel for AaaKernel {
    fn simulate(
        &self,
        ctx: &KernelCtx<'_>,
        args: &Args,
        rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        let simulated = self.maker.output_psp().simulate(args, ctx.aux, rng)?;
        let mut record = match simulated {
            SimValue::Record(record) => record,
            SimValue::Plain(v) => {
                return Err(WeftError::Assertion(format!(
                    "arbitrary-ergodic kernel expected a maker, got {}",
                    v.kind()
                )))
            }
        };
        let adopted = match ctx.made_aux {
            Some(aux) => Some(aux.clone_aux()),
            None => ctx.old.and_then(|old| match old {
                SimValue::Record(r) => r.aux.clone(),
                SimValue::Plain(_) => None,
            }),
        };
        if let Some(aux) = adopted {
            record.aux = Some(aux);
        }
        Ok(SimValue::Record(record))
    }

    fn weight(
        &self,
        new: &SimValue,
        _ctx: &KernelCtx<'_>,
        _args: &Args,
    ) -> Result<f64, WeftError> {
        Self::counts_weight(new.as_record()?)
    }

    fn reverse_weight(
        &self,
        old: &SimValue,
        _ctx: &KernelCtx<'_>,
        _args: &Args,
    ) -> Result<f64, WeftError> {
        Self::counts_weight(old.as_record()?)
    }
}
