//! Collapsed and uncollapsed beta-Bernoulli makers.

use std::any::Any;
use std::sync::Arc;

use rand_distr::{Bernoulli, Beta, Distribution};
use weft_core::{TraceRng, Value, WeftError};

use crate::sp::{AbsorbQuery, Args, NullRequestPsp, Psp, SimValue, Sp, SpAux, SpRecord};
use crate::sps::dist::{bernoulli_log_density, ln_beta_fn};
use crate::sps::{expect_arity, SimpleSp};

/// Sufficient statistics of a collapsed beta-Bernoulli instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BetaBernoulliAux {
    /// Number of incorporated `true` draws.
    pub heads: u64,
    /// Number of incorporated `false` draws.
    pub tails: u64,
}

impl SpAux for BetaBernoulliAux {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_aux(&self) -> Box<dyn SpAux> {
        Box::new(self.clone())
    }
}

fn counts(aux: Option<&dyn SpAux>) -> Result<&BetaBernoulliAux, WeftError> {
    aux.and_then(|a| a.as_any().downcast_ref::<BetaBernoulliAux>())
        .ok_or_else(|| {
            WeftError::Assertion("beta-bernoulli application lost its statistics".to_owned())
        })
}

fn counts_mut(aux: Option<&mut dyn SpAux>) -> Result<&mut BetaBernoulliAux, WeftError> {
    aux.and_then(|a| a.as_any_mut().downcast_mut::<BetaBernoulliAux>())
        .ok_or_else(|| {
            WeftError::Assertion("beta-bernoulli application lost its statistics".to_owned())
        })
}

fn bump(counter: &mut u64, up: bool) -> Result<(), WeftError> {
    if up {
        *counter += 1;
        Ok(())
    } else if *counter == 0 {
        Err(WeftError::Assertion(
            "beta-bernoulli count would go negative".to_owned(),
        ))
    } else {
        *counter -= 1;
        Ok(())
    }
}

/// Output PSP of a made collapsed beta-Bernoulli.
#[derive(Debug)]
struct CollapsedOutputPsp {
    alpha: f64,
    beta: f64,
}

impl CollapsedOutputPsp {
    fn weight(&self, aux: &BetaBernoulliAux) -> f64 {
        let a = self.alpha + aux.heads as f64;
        let b = self.beta + aux.tails as f64;
        a / (a + b)
    }
}

impl Psp for CollapsedOutputPsp {
    fn name(&self) -> &'static str {
        "beta-bernoulli"
    }

    fn simulate(
        &self,
        args: &Args,
        aux: Option<&dyn SpAux>,
        rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity("beta-bernoulli", 0, args)?;
        let weight = self.weight(counts(aux)?);
        let draw = Bernoulli::new(weight)
            .map_err(|_| WeftError::Assertion("posterior weight left [0, 1]".to_owned()))?
            .sample(rng);
        Ok(SimValue::Plain(Value::Bool(draw)))
    }

    fn log_density(
        &self,
        value: &Value,
        _args: &Args,
        aux: Option<&dyn SpAux>,
    ) -> Result<f64, WeftError> {
        Ok(bernoulli_log_density(
            value.as_bool()?,
            self.weight(counts(aux)?),
        ))
    }

    fn incorporate(
        &self,
        value: &Value,
        _args: &Args,
        aux: Option<&mut dyn SpAux>,
    ) -> Result<(), WeftError> {
        let aux = counts_mut(aux)?;
        if value.as_bool()? {
            bump(&mut aux.heads, true)
        } else {
            bump(&mut aux.tails, true)
        }
    }

    fn unincorporate(
        &self,
        value: &Value,
        _args: &Args,
        aux: Option<&mut dyn SpAux>,
    ) -> Result<(), WeftError> {
        let aux = counts_mut(aux)?;
        if value.as_bool()? {
            bump(&mut aux.heads, false)
        } else {
            bump(&mut aux.tails, false)
        }
    }

    fn is_random(&self) -> bool {
        true
    }

    fn can_absorb(&self, _query: &AbsorbQuery<'_>) -> bool {
        true
    }

    fn log_density_of_counts(&self, aux: &dyn SpAux) -> Result<f64, WeftError> {
        let aux = counts(Some(aux))?;
        let a = self.alpha + aux.heads as f64;
        let b = self.beta + aux.tails as f64;
        Ok(ln_beta_fn(a, b) - ln_beta_fn(self.alpha, self.beta))
    }
}

#[derive(Debug)]
struct CollapsedBetaBernoulliSp {
    request: NullRequestPsp,
    output: CollapsedOutputPsp,
}

impl Sp for CollapsedBetaBernoulliSp {
    fn name(&self) -> &'static str {
        "beta-bernoulli"
    }

    fn request_psp(&self) -> &dyn Psp {
        &self.request
    }

    fn output_psp(&self) -> &dyn Psp {
        &self.output
    }

    fn construct_aux(&self) -> Option<Box<dyn SpAux>> {
        Some(Box::new(BetaBernoulliAux::default()))
    }
}

/// Maker PSP for the collapsed beta-Bernoulli.
#[derive(Debug)]
struct MakeCollapsedPsp;

impl Psp for MakeCollapsedPsp {
    fn name(&self) -> &'static str {
        "make_beta_bernoulli"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        _rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity("make_beta_bernoulli", 2, args)?;
        let alpha = args.operand_values[0].as_double()?;
        let beta = args.operand_values[1].as_double()?;
        Ok(SimValue::Record(SpRecord::new(Arc::new(
            CollapsedBetaBernoulliSp {
                request: NullRequestPsp,
                output: CollapsedOutputPsp { alpha, beta },
            },
        ))))
    }

    fn children_can_aaa(&self) -> bool {
        true
    }
}

/// Statistics of an uncollapsed beta-Bernoulli instance: the sampled weight
/// plus the counts its applications have incorporated.
#[derive(Debug, Clone, PartialEq)]
pub struct UBetaBernoulliAux {
    /// The latent coin weight.
    pub weight: f64,
    /// Number of incorporated `true` draws.
    pub heads: u64,
    /// Number of incorporated `false` draws.
    pub tails: u64,
}

impl SpAux for UBetaBernoulliAux {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_aux(&self) -> Box<dyn SpAux> {
        Box::new(self.clone())
    }
}

fn ucounts(aux: Option<&dyn SpAux>) -> Result<&UBetaBernoulliAux, WeftError> {
    aux.and_then(|a| a.as_any().downcast_ref::<UBetaBernoulliAux>())
        .ok_or_else(|| {
            WeftError::Assertion("beta-bernoulli application lost its statistics".to_owned())
        })
}

fn ucounts_mut(aux: Option<&mut dyn SpAux>) -> Result<&mut UBetaBernoulliAux, WeftError> {
    aux.and_then(|a| a.as_any_mut().downcast_mut::<UBetaBernoulliAux>())
        .ok_or_else(|| {
            WeftError::Assertion("beta-bernoulli application lost its statistics".to_owned())
        })
}

/// Output PSP of a made uncollapsed beta-Bernoulli.
#[derive(Debug)]
struct UncollapsedOutputPsp;

impl Psp for UncollapsedOutputPsp {
    fn name(&self) -> &'static str {
        "ubeta-bernoulli"
    }

    fn simulate(
        &self,
        args: &Args,
        aux: Option<&dyn SpAux>,
        rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        expect_arity("ubeta-bernoulli", 0, args)?;
        let weight = ucounts(aux)?.weight;
        let draw = Bernoulli::new(weight)
            .map_err(|_| WeftError::Assertion("latent weight left [0, 1]".to_owned()))?
            .sample(rng);
        Ok(SimValue::Plain(Value::Bool(draw)))
    }

    fn log_density(
        &self,
        value: &Value,
        _args: &Args,
        aux: Option<&dyn SpAux>,
    ) -> Result<f64, WeftError> {
        Ok(bernoulli_log_density(value.as_bool()?, ucounts(aux)?.weight))
    }

    fn incorporate(
        &self,
        value: &Value,
        _args: &Args,
        aux: Option<&mut dyn SpAux>,
    ) -> Result<(), WeftError> {
        let aux = ucounts_mut(aux)?;
        if value.as_bool()? {
            bump(&mut aux.heads, true)
        } else {
            bump(&mut aux.tails, true)
        }
    }

    fn unincorporate(
        &self,
        value: &Value,
        _args: &Args,
        aux: Option<&mut dyn SpAux>,
    ) -> Result<(), WeftError> {
        let aux = ucounts_mut(aux)?;
        if value.as_bool()? {
            bump(&mut aux.heads, false)
        } else {
            bump(&mut aux.tails, false)
        }
    }

    fn is_random(&self) -> bool {
        true
    }

    fn can_absorb(&self, _query: &AbsorbQuery<'_>) -> bool {
        true
    }

    fn log_density_of_counts(&self, aux: &dyn SpAux) -> Result<f64, WeftError> {
        let aux = ucounts(Some(aux))?;
        Ok(aux.heads as f64 * aux.weight.ln() + aux.tails as f64 * (1.0 - aux.weight).ln())
    }
}

#[derive(Debug)]
struct UncollapsedBetaBernoulliSp {
    alpha: f64,
    beta: f64,
    request: NullRequestPsp,
    output: UncollapsedOutputPsp,
}

impl Sp for UncollapsedBetaBernoulliSp {
    fn name(&self) -> &'static str {
        "ubeta-bernoulli"
    }

    fn request_psp(&self) -> &dyn Psp {
        &self.request
    }

    fn output_psp(&self) -> &dyn Psp {
        &self.output
    }

    fn has_ae_kernel(&self) -> bool {
        true
    }

    fn ae_infer(&self, aux: &mut dyn SpAux, rng: &mut TraceRng) -> Result<(), WeftError> {
        let aux = ucounts_mut(Some(aux))?;
        let a = self.alpha + aux.heads as f64;
        let b = self.beta + aux.tails as f64;
        aux.weight = Beta::new(a, b)
            .map_err(|_| WeftError::Assertion("conjugate posterior shapes left (0, inf)".to_owned()))?
            .sample(rng);
        Ok(())
    }
}

/// Maker PSP for the uncollapsed beta-Bernoulli; random, and absorbing in
/// the maker itself by scoring the latent weight under its prior.
#[derive(Debug)]
struct MakeUncollapsedPsp;

impl MakeUncollapsedPsp {
    fn shapes(args: &Args) -> Result<(f64, f64), WeftError> {
        expect_arity("make_ubeta_bernoulli", 2, args)?;
        Ok((
            args.operand_values[0].as_double()?,
            args.operand_values[1].as_double()?,
        ))
    }
}

impl Psp for MakeUncollapsedPsp {
    fn name(&self) -> &'static str {
        "make_ubeta_bernoulli"
    }

    fn simulate(
        &self,
        args: &Args,
        _aux: Option<&dyn SpAux>,
        rng: &mut TraceRng,
    ) -> Result<SimValue, WeftError> {
        let (alpha, beta) = Self::shapes(args)?;
        let weight = Beta::new(alpha, beta)
            .map_err(|_| WeftError::Type {
                expected: "positive shape".to_owned(),
                got: format!("({alpha}, {beta})"),
            })?
            .sample(rng);
        Ok(SimValue::Record(SpRecord::with_aux(
            Arc::new(UncollapsedBetaBernoulliSp {
                alpha,
                beta,
                request: NullRequestPsp,
                output: UncollapsedOutputPsp,
            }),
            Box::new(UBetaBernoulliAux {
                weight,
                heads: 0,
                tails: 0,
            }),
        )))
    }

    fn log_density(
        &self,
        _value: &Value,
        args: &Args,
        aux: Option<&dyn SpAux>,
    ) -> Result<f64, WeftError> {
        // Absorbs changes to its shapes by scoring the made instance's
        // latent weight under the new prior.
        let (alpha, beta) = Self::shapes(args)?;
        let weight = ucounts(aux)?.weight;
        if !(0.0..=1.0).contains(&weight) {
            return Ok(f64::NEG_INFINITY);
        }
        Ok((alpha - 1.0) * weight.ln() + (beta - 1.0) * (1.0 - weight).ln()
            - ln_beta_fn(alpha, beta))
    }

    fn is_random(&self) -> bool {
        true
    }

    fn can_absorb(&self, _query: &AbsorbQuery<'_>) -> bool {
        true
    }

    fn children_can_aaa(&self) -> bool {
        true
    }
}

/// The beta-Bernoulli maker procedures.
pub fn builtins() -> Vec<(&'static str, Arc<dyn Sp>)> {
    vec![
        (
            "make_beta_bernoulli",
            SimpleSp::shared("make_beta_bernoulli", Box::new(MakeCollapsedPsp)),
        ),
        (
            "make_ubeta_bernoulli",
            SimpleSp::shared("make_ubeta_bernoulli", Box::new(MakeUncollapsedPsp)),
        ),
    ]
}
