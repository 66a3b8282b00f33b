//! Branch proposals: the taken arm becomes brush, restores reproduce it
//! exactly, and accepted flips rebuild the other arm.

use std::collections::BTreeSet;

use weft_core::Value;
use weft_engine::consistency::{check_choice_partition, check_request_counts};
use weft_engine::{construct_scaffold, detach_and_extract, regen_and_attach, Db, Trace};

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

fn branch_model(trace: &mut Trace) -> weft_core::DirectiveId {
    let lambda = |body: f64| {
        app(vec![
            sym("make_csp"),
            quote(Value::Array(vec![])),
            quote(num(body)),
        ])
    };
    trace
        .assume(
            "g",
            app(vec![
                sym("branch"),
                app(vec![sym("flip"), num(0.5)]),
                quote(lambda(1.0)),
                quote(lambda(2.0)),
            ]),
        )
        .unwrap();
    let (did, _) = trace.predict(app(vec![sym("g")])).unwrap();
    did
}

fn the_predicate(trace: &Trace) -> weft_core::NodeId {
    let choices: Vec<_> = trace.unconstrained_choices().iter().copied().collect();
    assert_eq!(choices.len(), 1, "only the predicate is a random choice");
    choices[0]
}

#[test]
fn restore_rebuilds_the_brush_identically() {
    let mut trace = Trace::new(71);
    let did = branch_model(&mut trace);
    let before = trace.canonical_state();
    let value_before = trace.report(did).unwrap();

    let mut pnodes = BTreeSet::new();
    pnodes.insert(the_predicate(&trace));
    let mut scaffold = construct_scaffold(&trace, &[pnodes], false).unwrap();
    assert!(!scaffold.brush_nodes().is_empty());

    let (rho, mut db) = detach_and_extract(&mut trace, &mut scaffold).unwrap();
    let xi = regen_and_attach(&mut trace, &mut scaffold, true, &mut db).unwrap();
    assert!((rho - xi).abs() < 1e-9);
    assert_eq!(before, trace.canonical_state());
    assert_eq!(trace.report(did).unwrap(), value_before);
}

#[test]
fn accepted_flips_rebuild_a_coherent_arm() {
    let mut trace = Trace::new(72);
    let did = branch_model(&mut trace);

    // Drive several accepted forward steps; whatever arm is live, the
    // prediction must be that arm's constant and the books must balance.
    for _ in 0..8 {
        let mut pnodes = BTreeSet::new();
        pnodes.insert(the_predicate(&trace));
        let mut scaffold = construct_scaffold(&trace, &[pnodes], false).unwrap();
        let (_rho, db) = detach_and_extract(&mut trace, &mut scaffold).unwrap();
        let mut fresh = Db::new();
        regen_and_attach(&mut trace, &mut scaffold, false, &mut fresh).unwrap();
        trace.dispose(db).unwrap();

        let value = trace.report(did).unwrap().as_double().unwrap();
        assert!(value == 1.0 || value == 2.0);
        check_request_counts(&trace).unwrap();
        check_choice_partition(&trace).unwrap();
    }
}

#[test]
fn dead_arms_are_reclaimed_after_acceptance() {
    let mut trace = Trace::new(73);
    branch_model(&mut trace);
    let baseline = trace.node_count();

    for _ in 0..16 {
        let mut pnodes = BTreeSet::new();
        pnodes.insert(the_predicate(&trace));
        let mut scaffold = construct_scaffold(&trace, &[pnodes], false).unwrap();
        let (_rho, db) = detach_and_extract(&mut trace, &mut scaffold).unwrap();
        let mut fresh = Db::new();
        regen_and_attach(&mut trace, &mut scaffold, false, &mut fresh).unwrap();
        trace.dispose(db).unwrap();
    }
    // Disposal keeps the arena from growing with every accepted flip.
    assert!(trace.node_count() <= baseline + 16);
}
