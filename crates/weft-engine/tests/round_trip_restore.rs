//! Round-trip weight symmetry: detach followed by a restoring regen must
//! reproduce the removal weight and leave the trace bit-identical.

use std::collections::BTreeSet;

use proptest::prelude::*;
use weft_core::{NodeId, Value};
use weft_engine::{construct_scaffold, detach_and_extract, regen_and_attach, Trace};

fn sym(name: &str) -> Value {
    Value::symbol(name)
}

fn num(x: f64) -> Value {
    Value::Number(x)
}

fn app(items: Vec<Value>) -> Value {
    Value::Array(items)
}

fn quote(datum: Value) -> Value {
    app(vec![sym("quote"), datum])
}

fn round_trip(trace: &mut Trace, principal: NodeId) -> f64 {
    let before = trace.canonical_state();
    let mut pnodes = BTreeSet::new();
    pnodes.insert(principal);
    let mut scaffold = construct_scaffold(trace, &[pnodes], false).unwrap();
    let (rho, mut db) = detach_and_extract(trace, &mut scaffold).unwrap();
    let xi = regen_and_attach(trace, &mut scaffold, true, &mut db).unwrap();
    assert!(
        (rho - xi).abs() < 1e-9,
        "removal weight {rho} diverged from restore weight {xi}"
    );
    assert_eq!(before, trace.canonical_state(), "restore changed the trace");
    rho
}

fn round_trip_all_choices(trace: &mut Trace) {
    let choices: Vec<NodeId> = trace.unconstrained_choices().iter().copied().collect();
    assert!(!choices.is_empty(), "model has no random choices");
    for choice in choices {
        round_trip(trace, choice);
    }
}

#[test]
fn normal_chain_restores() {
    let mut trace = Trace::new(11);
    trace
        .assume("mu", app(vec![sym("normal"), num(0.0), num(1.0)]))
        .unwrap();
    trace
        .assume("y", app(vec![sym("normal"), sym("mu"), num(1.0)]))
        .unwrap();
    trace.predict(sym("mu")).unwrap();
    round_trip_all_choices(&mut trace);
}

#[test]
fn compound_application_restores() {
    let mut trace = Trace::new(12);
    trace
        .assume(
            "f",
            app(vec![
                sym("make_csp"),
                quote(Value::Array(vec![sym("x")])),
                quote(app(vec![sym("normal"), sym("x"), num(1.0)])),
            ]),
        )
        .unwrap();
    trace.predict(app(vec![sym("f"), num(2.0)])).unwrap();
    trace.predict(app(vec![sym("f"), num(-3.0)])).unwrap();
    round_trip_all_choices(&mut trace);
}

#[test]
fn memoized_families_restore() {
    let mut trace = Trace::new(13);
    trace
        .assume(
            "f",
            app(vec![
                sym("mem"),
                app(vec![
                    sym("make_csp"),
                    quote(Value::Array(vec![sym("i")])),
                    quote(app(vec![sym("normal"), num(0.0), num(1.0)])),
                ]),
            ]),
        )
        .unwrap();
    trace.predict(app(vec![sym("f"), num(1.0)])).unwrap();
    trace.predict(app(vec![sym("f"), num(1.0)])).unwrap();
    trace.predict(app(vec![sym("f"), num(2.0)])).unwrap();
    round_trip_all_choices(&mut trace);
}

#[test]
fn branch_brush_restores() {
    let mut trace = Trace::new(14);
    let lambda_one = app(vec![
        sym("make_csp"),
        quote(Value::Array(vec![])),
        quote(num(1.0)),
    ]);
    let lambda_two = app(vec![
        sym("make_csp"),
        quote(Value::Array(vec![])),
        quote(num(2.0)),
    ]);
    trace
        .assume(
            "g",
            app(vec![
                sym("branch"),
                app(vec![sym("flip"), num(0.5)]),
                quote(lambda_one),
                quote(lambda_two),
            ]),
        )
        .unwrap();
    trace.predict(app(vec![sym("g")])).unwrap();
    round_trip_all_choices(&mut trace);
}

#[test]
fn collapsed_maker_aaa_restores() {
    let mut trace = Trace::new(15);
    trace
        .assume(
            "a",
            app(vec![sym("uniform_continuous"), num(0.5), num(2.0)]),
        )
        .unwrap();
    trace
        .assume("coin", app(vec![sym("make_beta_bernoulli"), sym("a"), sym("a")]))
        .unwrap();
    trace.predict(app(vec![sym("coin")])).unwrap();
    trace.predict(app(vec![sym("coin")])).unwrap();
    round_trip_all_choices(&mut trace);
}

#[test]
fn uncollapsed_maker_aaa_restores() {
    let mut trace = Trace::new(16);
    trace
        .assume(
            "coin",
            app(vec![sym("make_ubeta_bernoulli"), num(1.0), num(1.0)]),
        )
        .unwrap();
    trace.predict(app(vec![sym("coin")])).unwrap();
    trace.predict(app(vec![sym("coin")])).unwrap();
    round_trip_all_choices(&mut trace);
}

// Numeric expression grammar for generated models: every sub-expression
// evaluates to a number, so any composition is well-typed.
fn expr_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        (-4.0..4.0f64).prop_map(Value::Number),
        Just(app(vec![sym("normal"), num(0.0), num(1.0)])),
        Just(app(vec![sym("uniform_continuous"), num(-1.0), num(1.0)])),
    ];
    leaf.prop_recursive(3, 24, 3, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone())
                .prop_map(|(a, b)| app(vec![sym("add"), a, b])),
            (inner.clone(), inner.clone())
                .prop_map(|(a, b)| app(vec![sym("mul"), a, b])),
            inner
                .clone()
                .prop_map(|a| app(vec![sym("normal"), a, num(1.0)])),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn generated_models_restore(exp in expr_strategy(), seed in 0u64..1024) {
        let mut trace = Trace::new(seed);
        trace.assume("root", exp).unwrap();
        trace.predict(sym("root")).unwrap();
        let choices: Vec<NodeId> =
            trace.unconstrained_choices().iter().copied().collect();
        for choice in choices {
            round_trip(&mut trace, choice);
        }
    }
}
