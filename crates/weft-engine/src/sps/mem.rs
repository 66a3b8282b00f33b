//! Memoization (`mem`).
//!
//! A memoized procedure shares one family per distinct operand tuple: the
//! family id is the tuple itself, so two applications with equal arguments
//! resolve to the same root and the request count tracks the sharing.

use std::sync::Arc;

use weft_core::{Esr, EsrEnv, NodeId, RequestValue, TraceRng, Value, WeftError};

use crate::sp::{Args, EsrRefPsp, Psp, SimValue, Sp, SpAux, SpRecord};
use crate::sps::{expect_arity, SimpleSp};

const MEMOIZED: &str = "memoized";

#[derive(Debug)]
struct MemRequestPsp {
    operator_node: NodeId,
}

impl Psp for MemRequestPsp {
    fn name(&self) -> &'static str {
        "mem"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        let id = Value::Array(args.operand_values.clone());
        let mut exp = vec![Value::symbol(MEMOIZED)];
        for value in &args.operand_values {
            exp.push(Value::Array(vec![Value::symbol("quote"), value.clone()]));
        }
        Ok(SimValue::Plain(Value::Request(RequestValue {
            esrs: vec![Esr {
                id,
                exp: Value::Array(exp),
                env: EsrEnv::Frame {
                    parent: None,
                    bindings: vec![(MEMOIZED.to_owned(), self.operator_node)],
                },
            }],
            hsrs: Vec::new(),
        })))
    }
}

#[derive(Debug)]
struct MemSp {
    request: MemRequestPsp,
    output: EsrRefPsp,
}

impl Sp for MemSp {
    fn name(&self) -> &'static str {
        "mem"
    }

    fn request_psp(&self) -> &dyn Psp {
        &self.request
    }

    fn output_psp(&self) -> &dyn Psp {
        &self.output
    }
}

/// Maker PSP: `(mem proc)`.
#[derive(Debug)]
struct MakeMemPsp;

impl Psp for MakeMemPsp {
    fn name(&self) -> &'static str {
        "mem"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity("mem", 1, args)?;
        Ok(SimValue::Record(SpRecord::new(Arc::new(MemSp {
            request: MemRequestPsp {
                operator_node: args.operand_nodes[0],
            },
            output: EsrRefPsp,
        }))))
    }
}

/// The memoization maker.
pub fn builtins() -> Vec<(&'static str, Arc<dyn Sp>)> {
    vec![("mem", SimpleSp::shared("mem", Box::new(MakeMemPsp)))]
}
