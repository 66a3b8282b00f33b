//! Scope tags (`scope_include`, `scope_exclude`).
//!
//! `(scope_include scope block exp)` evaluates to `exp` and registers the
//! tagged sub-trace under the given scope and block; `(scope_exclude scope
//! exp)` removes the sub-trace from a scope during block selection.

use std::sync::Arc;

use weft_core::{TraceRng, Value, WeftError};

use crate::sp::{AbsorbQuery, Args, Psp, ScopeRole, SimValue, Sp, SpAux};
use crate::sps::{expect_arity, SimpleSp};

#[derive(Debug)]
struct ScopeIncludePsp;

impl Psp for ScopeIncludePsp {
    fn name(&self) -> &'static str {
        "scope_include"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity("scope_include", 3, args)?;
        Ok(SimValue::Plain(args.operand_values[2].clone()))
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
        // Scope and block operands may change freely; the tagged value
        // itself may not.
        query.operand_nodes.get(2) != Some(&query.parent)
    }

    fn scope_role(&self) -> ScopeRole {
        ScopeRole::Include
    }
}

#[derive(Debug)]
struct ScopeExcludePsp;

impl Psp for ScopeExcludePsp {
    fn name(&self) -> &'static str {
        "scope_exclude"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity("scope_exclude", 2, args)?;
        Ok(SimValue::Plain(args.operand_values[1].clone()))
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
        query.operand_nodes.get(1) != Some(&query.parent)
    }

    fn scope_role(&self) -> ScopeRole {
        ScopeRole::Exclude
    }
}

/// The scope-tagging procedures.
pub fn builtins() -> Vec<(&'static str, Arc<dyn Sp>)> {
    vec![
        (
            "scope_include",
            SimpleSp::shared("scope_include", Box::new(ScopeIncludePsp)),
        ),
        (
            "scope_exclude",
            SimpleSp::shared("scope_exclude", Box::new(ScopeExcludePsp)),
        ),
    ]
}
