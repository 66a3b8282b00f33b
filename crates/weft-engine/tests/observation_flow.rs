//! Observation propagation: make_consistent, constraint registration,
//! failure rollback, and count updates under constrained draws.

use std::collections::BTreeSet;

use weft_core::{Value, WeftError};
use weft_engine::consistency::{check_choice_partition, check_request_counts};
use weft_engine::sps::betabern::{BetaBernoulliAux, UBetaBernoulliAux};
use weft_engine::{construct_scaffold, detach_and_extract, regen_and_attach, Db, SpAux, Trace};

fn sym(name: &str) -> Value {
    Value::symbol(name)
}

fn num(x: f64) -> Value {
    Value::Number(x)
}

fn app(items: Vec<Value>) -> Value {
    Value::Array(items)
}

#[test]
fn observations_constrain_after_make_consistent() {
    let mut trace = Trace::new(51);
    let (did_x, _) = trace
        .assume("x", app(vec![sym("flip"), num(0.5)]))
        .unwrap();
    trace.observe(sym("x"), Value::Bool(true)).unwrap();

    assert_eq!(trace.unpropagated_observations().len(), 1);
    let weight = trace.make_consistent().unwrap();
    assert!(weight.is_finite());
    assert!(trace.unpropagated_observations().is_empty());

    let x_root = trace.family_root_of(did_x).unwrap();
    assert!(trace.constrained_choices().contains(&x_root));
    assert_eq!(trace.report(did_x).unwrap(), Value::Bool(true));
    check_choice_partition(&trace).unwrap();

    // With every choice pinned, an empty proposal moves nothing and weighs
    // nothing.
    let before = trace.canonical_state();
    let empty: Vec<BTreeSet<_>> = vec![BTreeSet::new()];
    let mut scaffold = construct_scaffold(&trace, &empty, false).unwrap();
    let (rho, mut db) = detach_and_extract(&mut trace, &mut scaffold).unwrap();
    let xi = regen_and_attach(&mut trace, &mut scaffold, true, &mut db).unwrap();
    assert_eq!(rho, 0.0);
    assert_eq!(xi, 0.0);
    assert_eq!(before, trace.canonical_state());
}

#[test]
fn impossible_observation_rolls_back() {
    let mut trace = Trace::new(52);
    let (did_x, _) = trace
        .assume("x", app(vec![sym("flip"), num(0.0)]))
        .unwrap();
    trace.observe(sym("x"), Value::Bool(true)).unwrap();

    let before = trace.canonical_state();
    let err = trace.make_consistent().unwrap_err();
    assert_eq!(err, WeftError::UnpropagatedObservation);
    assert_eq!(
        before,
        trace.canonical_state(),
        "a failed propagation must leave the graph as it was"
    );
    assert_eq!(trace.report(did_x).unwrap(), Value::Bool(false));
    assert!(trace.constrained_choices().is_empty());
}

#[test]
fn double_observation_is_rejected() {
    let mut trace = Trace::new(53);
    trace
        .assume("x", app(vec![sym("flip"), num(0.5)]))
        .unwrap();
    trace.observe(sym("x"), Value::Bool(true)).unwrap();
    trace.observe(sym("x"), Value::Bool(false)).unwrap();
    let err = trace.make_consistent().unwrap_err();
    assert_eq!(err, WeftError::DoubleConstrain);
}

#[test]
fn observing_a_constant_fails_cleanly() {
    let mut trace = Trace::new(54);
    let before = trace.canonical_state();
    let err = trace
        .observe(app(vec![sym("quote"), num(1.0)]), Value::Bool(true))
        .unwrap_err();
    assert!(matches!(err, WeftError::Observation(_)));
    assert_eq!(before, trace.canonical_state());
}

#[test]
fn constrained_draw_updates_collapsed_counts() {
    let mut trace = Trace::new(55);
    let (did_coin, _) = trace
        .assume(
            "coin",
            app(vec![sym("make_beta_bernoulli"), num(1.0), num(1.0)]),
        )
        .unwrap();
    trace.observe(app(vec![sym("coin")]), Value::Bool(true)).unwrap();
    trace.make_consistent().unwrap();

    let maker = trace.family_root_of(did_coin).unwrap();
    let aux = trace
        .made_aux(maker)
        .and_then(|a| a.as_any().downcast_ref::<BetaBernoulliAux>())
        .expect("collapsed maker keeps counts");
    assert_eq!((aux.heads, aux.tails), (1, 0));
    check_request_counts(&trace).unwrap();
    check_choice_partition(&trace).unwrap();
}

#[test]
fn aaa_step_preserves_constrained_counts() {
    let mut trace = Trace::new(56);
    let (did_a, _) = trace
        .assume(
            "a",
            app(vec![sym("uniform_continuous"), num(0.5), num(2.0)]),
        )
        .unwrap();
    let (did_coin, _) = trace
        .assume("coin", app(vec![sym("make_beta_bernoulli"), sym("a"), sym("a")]))
        .unwrap();
    trace.observe(app(vec![sym("coin")]), Value::Bool(true)).unwrap();
    trace.make_consistent().unwrap();

    let a_root = trace.family_root_of(did_a).unwrap();
    let maker = trace.family_root_of(did_coin).unwrap();

    let mut pnodes = BTreeSet::new();
    pnodes.insert(a_root);
    let mut scaffold = construct_scaffold(&trace, &[pnodes], false).unwrap();
    assert!(scaffold.is_aaa(maker));
    let (rho, db) = detach_and_extract(&mut trace, &mut scaffold).unwrap();
    let mut fresh = Db::new();
    let xi = regen_and_attach(&mut trace, &mut scaffold, false, &mut fresh).unwrap();
    trace.dispose(db).unwrap();
    assert!(rho.is_finite() && xi.is_finite());

    let aux = trace
        .made_aux(maker)
        .and_then(|a| a.as_any().downcast_ref::<BetaBernoulliAux>())
        .expect("counts must ride through the AAA step");
    assert_eq!((aux.heads, aux.tails), (1, 0));
    check_request_counts(&trace).unwrap();
    check_choice_partition(&trace).unwrap();
}

#[test]
fn ae_kernel_resamples_the_latent_weight() {
    let mut trace = Trace::new(57);
    let (did_coin, _) = trace
        .assume(
            "coin",
            app(vec![sym("make_ubeta_bernoulli"), num(1.0), num(1.0)]),
        )
        .unwrap();
    trace.observe(app(vec![sym("coin")]), Value::Bool(true)).unwrap();
    trace.make_consistent().unwrap();

    let maker = trace.family_root_of(did_coin).unwrap();
    assert!(trace.ae_kernel_makers().contains(&maker));

    let before = trace
        .made_aux(maker)
        .and_then(|a| a.as_any().downcast_ref::<UBetaBernoulliAux>())
        .expect("uncollapsed maker keeps its weight")
        .clone();
    assert_eq!((before.heads, before.tails), (1, 0));

    trace.run_ae_kernel(maker).unwrap();
    let after = trace
        .made_aux(maker)
        .and_then(|a| a.as_any().downcast_ref::<UBetaBernoulliAux>())
        .unwrap();
    assert_eq!((after.heads, after.tails), (1, 0));
    assert!(after.weight > 0.0 && after.weight < 1.0);
}
