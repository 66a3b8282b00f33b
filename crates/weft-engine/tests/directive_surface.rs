//! The directive surface: assume/predict/report, freeze, forget, and the
//! error paths that must leave the trace untouched.

use std::collections::BTreeSet;

use weft_core::{Value, WeftError};
use weft_engine::consistency::check_choice_partition;
use weft_engine::{
    construct_scaffold, detach_and_extract, regen_and_attach, Db, NodeKind, Trace,
};

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
fn reports_are_stable_between_steps() {
    let mut trace = Trace::new(61);
    let (did_x, value) = trace
        .assume("x", app(vec![sym("normal"), num(0.0), num(1.0)]))
        .unwrap();
    let (did_p, predicted) = trace.predict(sym("x")).unwrap();
    assert_eq!(value, predicted);
    assert_eq!(trace.report(did_x).unwrap(), trace.report(did_p).unwrap());
    assert_eq!(trace.report(did_x).unwrap(), value);

    // A forward step on x may move it, but both reports move together.
    let x_root = trace.family_root_of(did_x).unwrap();
    let mut pnodes = BTreeSet::new();
    pnodes.insert(x_root);
    let mut scaffold = construct_scaffold(&trace, &[pnodes], false).unwrap();
    let (_rho, db) = detach_and_extract(&mut trace, &mut scaffold).unwrap();
    let mut fresh = Db::new();
    regen_and_attach(&mut trace, &mut scaffold, false, &mut fresh).unwrap();
    trace.dispose(db).unwrap();
    assert_eq!(trace.report(did_x).unwrap(), trace.report(did_p).unwrap());
}

#[test]
fn removal_weight_is_the_child_log_density() {
    let mut trace = Trace::new(62);
    let (did_mu, mu_value) = trace
        .assume("mu", app(vec![sym("normal"), num(0.0), num(1.0)]))
        .unwrap();
    let (did_y, y_value) = trace
        .assume("y", app(vec![sym("normal"), sym("mu"), num(1.0)]))
        .unwrap();
    let mu = mu_value.as_double().unwrap();
    let y = y_value.as_double().unwrap();
    let expected = {
        let z = y - mu;
        -0.5 * z * z - 0.5 * (2.0 * std::f64::consts::PI).ln()
    };

    let mu_root = trace.family_root_of(did_mu).unwrap();
    let mut pnodes = BTreeSet::new();
    pnodes.insert(mu_root);
    let mut scaffold = construct_scaffold(&trace, &[pnodes], false).unwrap();
    let (rho, mut db) = detach_and_extract(&mut trace, &mut scaffold).unwrap();
    assert!((rho - expected).abs() < 1e-9);
    regen_and_attach(&mut trace, &mut scaffold, true, &mut db).unwrap();
    assert_eq!(trace.report(did_y).unwrap(), y_value);
}

#[test]
fn freeze_collapses_a_family_to_its_value() {
    let mut trace = Trace::new(63);
    let (did, value) = trace
        .assume("z", app(vec![sym("normal"), num(0.0), num(1.0)]))
        .unwrap();
    let root = trace.family_root_of(did).unwrap();
    let nodes_before = trace.node_count();

    trace.freeze(did).unwrap();
    assert_eq!(trace.report(did).unwrap(), value);
    assert!(matches!(
        trace.node(root).unwrap().kind,
        NodeKind::Constant
    ));
    assert!(trace.node_count() < nodes_before);
    assert!(
        !trace.unconstrained_choices().contains(&root),
        "a frozen family offers nothing to propose on"
    );
    check_choice_partition(&trace).unwrap();

    // The frozen value still reads through bindings.
    let (_, via_binding) = trace.predict(sym("z")).unwrap();
    assert_eq!(via_binding, value);
}

#[test]
fn forget_removes_the_family() {
    let mut trace = Trace::new(64);
    let (did, _) = trace
        .predict(app(vec![sym("normal"), num(0.0), num(1.0)]))
        .unwrap();
    let root = trace.family_root_of(did).unwrap();
    let nodes_before = trace.node_count();

    trace.forget(did).unwrap();
    assert!(trace.report(did).is_err());
    assert!(!trace.has_node(root));
    assert!(trace.node_count() < nodes_before);
    check_choice_partition(&trace).unwrap();
}

#[test]
fn referenced_assumes_cannot_be_forgotten() {
    let mut trace = Trace::new(65);
    let (did_x, _) = trace
        .assume("x", app(vec![sym("normal"), num(0.0), num(1.0)]))
        .unwrap();
    trace.predict(sym("x")).unwrap();
    let err = trace.forget(did_x).unwrap_err();
    assert!(matches!(err, WeftError::Observation(_)));
}

#[test]
fn unbound_symbols_leave_the_trace_untouched() {
    let mut trace = Trace::new(66);
    trace
        .assume("x", app(vec![sym("normal"), num(0.0), num(1.0)]))
        .unwrap();
    let before = trace.canonical_state();
    let count = trace.node_count();

    let err = trace.assume("z", sym("undefined_thing")).unwrap_err();
    assert_eq!(err, WeftError::UnboundSymbol("undefined_thing".to_owned()));
    assert_eq!(trace.node_count(), count);
    assert_eq!(before, trace.canonical_state());
}

#[test]
fn arity_errors_leave_the_trace_untouched() {
    let mut trace = Trace::new(67);
    let before = trace.canonical_state();
    let err = trace
        .predict(app(vec![sym("normal"), num(1.0)]))
        .unwrap_err();
    assert_eq!(
        err,
        WeftError::Arity {
            sp: "normal".to_owned(),
            expected: 2,
            got: 1,
        }
    );
    assert_eq!(before, trace.canonical_state());
}

#[test]
fn applying_a_non_procedure_is_a_type_error() {
    let mut trace = Trace::new(68);
    let before = trace.canonical_state();
    let err = trace.predict(app(vec![num(1.0), num(2.0)])).unwrap_err();
    assert!(matches!(err, WeftError::Type { .. }));
    assert_eq!(before, trace.canonical_state());
}
