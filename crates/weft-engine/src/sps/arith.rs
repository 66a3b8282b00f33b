//! Deterministic numeric, logical and list primitives.

use std::sync::Arc;

use weft_core::{TraceRng, Value, WeftError};

use crate::sp::{Args, Psp, SimValue, Sp, SpAux};
use crate::sps::{expect_arity, SimpleSp};

#[derive(Debug)]
struct BinaryNumericPsp {
    name: &'static str,
    op: fn(f64, f64) -> f64,
}

impl Psp for BinaryNumericPsp {
    fn name(&self) -> &'static str {
        self.name
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity(self.name, 2, args)?;
        let a = args.operand_values[0].as_double()?;
        let b = args.operand_values[1].as_double()?;
        Ok(SimValue::Plain(Value::Number((self.op)(a, b))))
    }
}

#[derive(Debug)]
struct ComparisonPsp {
    name: &'static str,
    op: fn(f64, f64) -> bool,
}

impl Psp for ComparisonPsp {
    fn name(&self) -> &'static str {
        self.name
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity(self.name, 2, args)?;
        let a = args.operand_values[0].as_double()?;
        let b = args.operand_values[1].as_double()?;
        Ok(SimValue::Plain(Value::Bool((self.op)(a, b))))
    }
}

#[derive(Debug)]
struct EqPsp;

impl Psp for EqPsp {
    fn name(&self) -> &'static str {
        "eq"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity("eq", 2, args)?;
        Ok(SimValue::Plain(Value::Bool(
            args.operand_values[0] == args.operand_values[1],
        )))
    }
}

#[derive(Debug)]
struct NotPsp;

impl Psp for NotPsp {
    fn name(&self) -> &'static str {
        "not"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity("not", 1, args)?;
        Ok(SimValue::Plain(Value::Bool(
            !args.operand_values[0].as_bool()?,
        )))
    }
}

#[derive(Debug)]
struct PairPsp;

impl Psp for PairPsp {
    fn name(&self) -> &'static str {
        "pair"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity("pair", 2, args)?;
        Ok(SimValue::Plain(Value::Pair(
            Box::new(args.operand_values[0].clone()),
            Box::new(args.operand_values[1].clone()),
        )))
    }
}

#[derive(Debug)]
struct FirstPsp;

impl Psp for FirstPsp {
    fn name(&self) -> &'static str {
        "first"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity("first", 1, args)?;
        let (car, _) = args.operand_values[0].as_pair()?;
        Ok(SimValue::Plain(car.clone()))
    }
}

#[derive(Debug)]
struct RestPsp;

impl Psp for RestPsp {
    fn name(&self) -> &'static str {
        "rest"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity("rest", 1, args)?;
        let (_, cdr) = args.operand_values[0].as_pair()?;
        Ok(SimValue::Plain(cdr.clone()))
    }
}

#[derive(Debug)]
struct ListPsp;

impl Psp for ListPsp {
    fn name(&self) -> &'static str {
        "list"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        Ok(SimValue::Plain(Value::list(
            args.operand_values.iter().cloned(),
        )))
    }
}

/// The deterministic primitive procedures.
pub fn builtins() -> Vec<(&'static str, Arc<dyn Sp>)> {
    vec![
        (
            "add",
            SimpleSp::shared(
                "add",
                Box::new(BinaryNumericPsp {
                    name: "add",
                    op: |a, b| a + b,
                }),
            ),
        ),
        (
            "sub",
            SimpleSp::shared(
                "sub",
                Box::new(BinaryNumericPsp {
                    name: "sub",
                    op: |a, b| a - b,
                }),
            ),
        ),
        (
            "mul",
            SimpleSp::shared(
                "mul",
                Box::new(BinaryNumericPsp {
                    name: "mul",
                    op: |a, b| a * b,
                }),
            ),
        ),
        (
            "div",
            SimpleSp::shared(
                "div",
                Box::new(BinaryNumericPsp {
                    name: "div",
                    op: |a, b| a / b,
                }),
            ),
        ),
        (
            "gt",
            SimpleSp::shared(
                "gt",
                Box::new(ComparisonPsp {
                    name: "gt",
                    op: |a, b| a > b,
                }),
            ),
        ),
        (
            "lt",
            SimpleSp::shared(
                "lt",
                Box::new(ComparisonPsp {
                    name: "lt",
                    op: |a, b| a < b,
                }),
            ),
        ),
        ("eq", SimpleSp::shared("eq", Box::new(EqPsp))),
        ("not", SimpleSp::shared("not", Box::new(NotPsp))),
        ("pair", SimpleSp::shared("pair", Box::new(PairPsp))),
        ("first", SimpleSp::shared("first", Box::new(FirstPsp))),
        ("rest", SimpleSp::shared("rest", Box::new(RestPsp))),
        ("list", SimpleSp::shared("list", Box::new(ListPsp))),
    ]
}
