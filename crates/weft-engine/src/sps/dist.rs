//! Primitive distributions.

use std::f64::consts::PI;
use std::sync::Arc;

use rand::Rng as _;
use rand_distr::{Bernoulli, Beta, Distribution, Normal};
use weft_core::{TraceRng, Value, WeftError};

use crate::sp::{AbsorbQuery, Args, Psp, SimValue, Sp, SpAux};
use crate::sps::{expect_arity, SimpleSp};

/// Natural log of the gamma function, Lanczos approximation (g = 7).
pub(crate) fn ln_gamma(x: f64) -> f64 {
    const COEFFICIENTS: [f64; 8] = [
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        // Reflection for the left half-plane.
        return (PI / (PI * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut acc = 0.999_999_999_999_809_93;
    for (i, c) in COEFFICIENTS.iter().enumerate() {
        acc += c / (x + i as f64 + 1.0);
    }
    let t = x + 7.5;
    0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}

pub(crate) fn ln_beta_fn(a: f64, b: f64) -> f64 {
    ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b)
}

pub(crate) fn bernoulli_log_density(value: bool, weight: f64) -> f64 {
    if value {
        weight.ln()
    } else {
        (1.0 - weight).ln()
    }
}

fn positive(name: &'static str, x: f64) -> Result<f64, WeftError> {
    if x > 0.0 && x.is_finite() {
        Ok(x)
    } else {
        Err(WeftError::Type {
            expected: format!("positive {name}"),
            got: x.to_string(),
        })
    }
}

fn probability(x: f64) -> Result<f64, WeftError> {
    if (0.0..=1.0).contains(&x) {
        Ok(x)
    } else {
        Err(WeftError::Type {
            expected: "weight in [0, 1]".to_owned(),
            got: x.to_string(),
        })
    }
}

/// Weighted coin; `(flip)` defaults to a fair one.
#[derive(Debug)]
struct FlipPsp;

impl FlipPsp {
    fn weight(args: &Args) -> Result<f64, WeftError> {
        match args.operand_values.len() {
            0 => Ok(0.5),
            1 => probability(args.operand_values[0].as_double()?),
            got => Err(WeftError::arity("flip", 1, got)),
        }
    }
}

impl Psp for FlipPsp {
    fn name(&self) -> &'static str {
        "flip"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        let weight = Self::weight(args)?;
        let draw = Bernoulli::new(weight)
            .map_err(|_| WeftError::Type {
                expected: "weight in [0, 1]".to_owned(),
                got: weight.to_string(),
            })?
            .sample(rng);
        Ok(SimValue::Plain(Value::Bool(draw)))
    }

    fn log_density(
        &self,
        value: &Value,
        args: &Args,
        _aux: Option<&dyn SpAux>,
    ) -> Result<f64, WeftError> {
        Ok(bernoulli_log_density(value.as_bool()?, Self::weight(args)?))
    }

    fn is_random(&self) -> bool {
        true
    }

    fn can_absorb(&self, _query: &AbsorbQuery<'_>) -> bool {
        true
    }
}

/// Gaussian with mean and standard deviation operands.
#[derive(Debug)]
struct NormalPsp;

impl Psp for NormalPsp {
    fn name(&self) -> &'static str {
        "normal"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity("normal", 2, args)?;
        let mu = args.operand_values[0].as_double()?;
        let sigma = positive("scale", args.operand_values[1].as_double()?)?;
        let draw = Normal::new(mu, sigma)
            .map_err(|_| WeftError::Type {
                expected: "positive scale".to_owned(),
                got: sigma.to_string(),
            })?
            .sample(rng);
        Ok(SimValue::Plain(Value::Number(draw)))
    }

    fn log_density(
        &self,
        value: &Value,
        args: &Args,
        _aux: Option<&dyn SpAux>,
    ) -> Result<f64, WeftError> {
        expect_arity("normal", 2, args)?;
        let x = value.as_double()?;
        let mu = args.operand_values[0].as_double()?;
        let sigma = positive("scale", args.operand_values[1].as_double()?)?;
        let z = (x - mu) / sigma;
        Ok(-0.5 * z * z - sigma.ln() - 0.5 * (2.0 * PI).ln())
    }

    fn is_random(&self) -> bool {
        true
    }

    fn can_absorb(&self, _query: &AbsorbQuery<'_>) -> bool {
        true
    }
}

/// Beta distribution over the unit interval.
#[derive(Debug)]
struct BetaPsp;

impl Psp for BetaPsp {
    fn name(&self) -> &'static str {
        "beta"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity("beta", 2, args)?;
        let alpha = positive("alpha", args.operand_values[0].as_double()?)?;
        let beta = positive("beta", args.operand_values[1].as_double()?)?;
        let draw = Beta::new(alpha, beta)
            .map_err(|_| WeftError::Type {
                expected: "positive shape".to_owned(),
                got: format!("({alpha}, {beta})"),
            })?
            .sample(rng);
        Ok(SimValue::Plain(Value::Number(draw)))
    }

    fn log_density(
        &self,
        value: &Value,
        args: &Args,
        _aux: Option<&dyn SpAux>,
    ) -> Result<f64, WeftError> {
        expect_arity("beta", 2, args)?;
        let x = value.as_double()?;
        let alpha = positive("alpha", args.operand_values[0].as_double()?)?;
        let beta = positive("beta", args.operand_values[1].as_double()?)?;
        if !(0.0..=1.0).contains(&x) {
            return Ok(f64::NEG_INFINITY);
        }
        Ok((alpha - 1.0) * x.ln() + (beta - 1.0) * (1.0 - x).ln() - ln_beta_fn(alpha, beta))
    }

    fn is_random(&self) -> bool {
        true
    }

    fn can_absorb(&self, _query: &AbsorbQuery<'_>) -> bool {
        true
    }
}

/// Uniform draw from a closed interval.
#[derive(Debug)]
struct UniformContinuousPsp;

impl Psp for UniformContinuousPsp {
    fn name(&self) -> &'static str {
        "uniform_continuous"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity("uniform_continuous", 2, args)?;
        let low = args.operand_values[0].as_double()?;
        let high = args.operand_values[1].as_double()?;
        if !(low < high) {
            return Err(WeftError::Type {
                expected: "non-empty interval".to_owned(),
                got: format!("[{low}, {high}]"),
            });
        }
        Ok(SimValue::Plain(Value::Number(rng.gen_range(low..high))))
    }

    fn log_density(
        &self,
        value: &Value,
        args: &Args,
        _aux: Option<&dyn SpAux>,
    ) -> Result<f64, WeftError> {
        expect_arity("uniform_continuous", 2, args)?;
        let x = value.as_double()?;
        let low = args.operand_values[0].as_double()?;
        let high = args.operand_values[1].as_double()?;
        if x < low || x > high {
            return Ok(f64::NEG_INFINITY);
        }
        Ok(-(high - low).ln())
    }

    fn is_random(&self) -> bool {
        true
    }

    fn can_absorb(&self, _query: &AbsorbQuery<'_>) -> bool {
        true
    }
}

/// The primitive distribution procedures.
pub fn builtins() -> Vec<(&'static str, Arc<dyn Sp>)> {
    vec![
        ("flip", SimpleSp::shared("flip", Box::new(FlipPsp))),
        ("normal", SimpleSp::shared("normal", Box::new(NormalPsp))),
        ("beta", SimpleSp::shared("beta", Box::new(BetaPsp))),
        (
            "uniform_continuous",
            SimpleSp::shared("uniform_continuous", Box::new(UniformContinuousPsp)),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ln_gamma_matches_factorials() {
        // Gamma(n) = (n-1)!
        assert!((ln_gamma(5.0) - 24.0_f64.ln()).abs() < 1e-10);
        assert!((ln_gamma(1.0)).abs() < 1e-10);
        assert!((ln_gamma(0.5) - PI.sqrt().ln()).abs() < 1e-10);
    }
}
