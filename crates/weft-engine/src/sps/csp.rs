//! Compound procedures (`make_csp`).
//!
//! A compound procedure closes over the environment of its maker. Each
//! application requests one family — the body — under a frame binding the
//! formals to the application's operand nodes, keyed by the request node so
//! every application owns its private copy of the body.

use std::sync::Arc;

use weft_core::{EnvId, Esr, EsrEnv, RequestValue, TraceRng, Value, WeftError};

use crate::sp::{AbsorbQuery, Args, EsrRefPsp, Psp, SimValue, Sp, SpAux, SpRecord};
use crate::sps::{expect_arity, SimpleSp};

fn param_names(spec: &Value) -> Result<Vec<String>, WeftError> {
    let items: Vec<&Value> = match spec {
        Value::Array(items) => items.iter().collect(),
        _ => spec.as_list()?,
    };
    items
        .into_iter()
        .map(|v| v.as_symbol().map(str::to_owned))
        .collect()
}

#[derive(Debug)]
struct CompoundRequestPsp {
    params: Vec<String>,
    body: Value,
    env: EnvId,
}

impl Psp for CompoundRequestPsp {
    fn name(&self) -> &'static str {
        "compound"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity("compound", self.params.len(), args)?;
        Ok(SimValue::Plain(Value::Request(RequestValue {
            esrs: vec![Esr {
                id: Value::Node(args.node),
                exp: self.body.clone(),
                env: EsrEnv::WithOperands {
                    parent: self.env,
                    params: self.params.clone(),
                },
            }],
            hsrs: Vec::new(),
        })))
    }

    fn log_density(
        &self,
        _value: &Value,
        _args: &Args,
        _aux: Option<&dyn SpAux>,
    ) -> Result<f64, WeftError> {
        Ok(0.0)
    }

    fn can_absorb(&self, query: &AbsorbQuery<'_>) -> bool {
        // Operand changes flow through the body's lookups; only a new
        // operator invalidates the requested family.
        query.parent != query.operator
    }
}

#[derive(Debug)]
struct CompoundSp {
    request: CompoundRequestPsp,
    output: EsrRefPsp,
}

impl Sp for CompoundSp {
    fn name(&self) -> &'static str {
        "compound"
    }

    fn request_psp(&self) -> &dyn Psp {
        &self.request
    }

    fn output_psp(&self) -> &dyn Psp {
        &self.output
    }
}

/// Maker PSP: `(make_csp (quote (params…)) (quote body))`.
#[derive(Debug)]
struct MakeCspPsp;

impl Psp for MakeCspPsp {
    fn name(&self) -> &'static str {
        "make_csp"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity("make_csp", 2, args)?;
        let params = param_names(&args.operand_values[0])?;
        let body = args.operand_values[1].clone();
        Ok(SimValue::Record(SpRecord::new(Arc::new(CompoundSp {
            request: CompoundRequestPsp {
                params,
                body,
                env: args.env,
            },
            output: EsrRefPsp,
        }))))
    }
}

/// The compound-procedure maker.
pub fn builtins() -> Vec<(&'static str, Arc<dyn Sp>)> {
    vec![("make_csp", SimpleSp::shared("make_csp", Box::new(MakeCspPsp)))]
}
