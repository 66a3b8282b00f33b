//! ESR-based conditional (`branch`).
//!
//! `(branch pred (quote then) (quote else))` requests only the taken arm.
//! The request refuses to absorb, so a resampled predicate tears the old arm
//! into brush and the regeneration builds the other one.

use std::sync::Arc;

use weft_core::{Esr, EsrEnv, RequestValue, TraceRng, Value, WeftError};

use crate::sp::{AbsorbQuery, Args, EsrRefPsp, Psp, SimValue, Sp, SpAux};
use crate::sps::expect_arity;

#[derive(Debug)]
struct BranchRequestPsp;

impl Psp for BranchRequestPsp {
    fn name(&self) -> &'static str {
        "branch"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity("branch", 3, args)?;
        let taken = if args.operand_values[0].as_bool()? {
            args.operand_values[1].clone()
        } else {
            args.operand_values[2].clone()
        };
        Ok(SimValue::Plain(Value::Request(RequestValue {
            esrs: vec![Esr {
                id: Value::Node(args.node),
                exp: taken,
                env: EsrEnv::Existing(args.env),
            }],
            hsrs: Vec::new(),
        })))
    }

    fn can_absorb(&self, _query: &AbsorbQuery<'_>) -> bool {
        false
    }
}

#[derive(Debug)]
struct BranchSp {
    request: BranchRequestPsp,
    output: EsrRefPsp,
}

impl Sp for BranchSp {
    fn name(&self) -> &'static str {
        "branch"
    }

    fn request_psp(&self) -> &dyn Psp {
        &self.request
    }

    fn output_psp(&self) -> &dyn Psp {
        &self.output
    }
}

/// The conditional procedure.
pub fn builtins() -> Vec<(&'static str, Arc<dyn Sp>)> {
    vec![(
        "branch",
        Arc::new(BranchSp {
            request: BranchRequestPsp,
            output: EsrRefPsp,
        }) as Arc<dyn Sp>,
    )]
}
