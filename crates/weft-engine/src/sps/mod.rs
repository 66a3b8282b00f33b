//! Built-in stochastic procedures.
//!
//! Everything here is written against the public [`crate::sp`] seam; the
//! engine itself never special-cases a concrete procedure.

use std::sync::Arc;

use weft_core::{Value, WeftError};

use crate::sp::{Args, NullRequestPsp, Psp, Sp};

pub mod arith;
pub mod betabern;
pub mod branch;
pub mod csp;
pub mod dist;
pub mod mem;
pub mod scope;

/// A procedure with an empty request side and a boxed output PSP.
#[derive(Debug)]
pub struct SimpleSp {
    name: &'static str,
    request: NullRequestPsp,
    output: Box<dyn Psp>,
}

impl SimpleSp {
    /// Wraps `output` into a shareable procedure named `name`.
    pub fn shared(name: &'static str, output: Box<dyn Psp>) -> Arc<dyn Sp> {
        Arc::new(Self {
            name,
            request: NullRequestPsp,
            output,
        })
    }
}

impl Sp for SimpleSp {
    fn name(&self) -> &'static str {
        self.name
    }

    fn request_psp(&self) -> &dyn Psp {
        &self.request
    }

    fn output_psp(&self) -> &dyn Psp {
        self.output.as_ref()
    }
}

pub(crate) fn expect_arity(
    name: &'static str,
    expected: usize,
    args: &Args,
) -> Result<(), WeftError> {
    if args.operand_values.len() != expected {
        return Err(WeftError::arity(name, expected, args.operand_values.len()));
    }
    Ok(())
}

/// Values bound in every fresh global environment.
pub fn builtin_values() -> Vec<(&'static str, Value)> {
    vec![
        ("true", Value::Bool(true)),
        ("false", Value::Bool(false)),
        ("nil", Value::Nil),
    ]
}

/// Procedures bound in every fresh global environment.
pub fn builtin_sps() -> Vec<(&'static str, Arc<dyn Sp>)> {
    let mut sps = arith::builtins();
    sps.extend(dist::builtins());
    sps.extend(betabern::builtins());
    sps.extend(csp::builtins());
    sps.extend(mem::builtins());
    sps.extend(branch::builtins());
    sps.extend(scope::builtins());
    sps
}
