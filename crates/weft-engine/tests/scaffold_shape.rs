//! Scaffold classification: DRG membership, absorption, AAA detection,
//! brush discovery, and shape stability across a non-restoring step.

use std::collections::BTreeSet;

use weft_core::{NodeId, Value};
use weft_engine::{
    construct_scaffold, detach_and_extract, regen_and_attach, Db, NodeKind, Scaffold, Trace,
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

fn quote(datum: Value) -> Value {
    app(vec![sym("quote"), datum])
}

fn singleton(node: NodeId) -> Vec<BTreeSet<NodeId>> {
    let mut set = BTreeSet::new();
    set.insert(node);
    vec![set]
}

fn shape(scaffold: &Scaffold) -> (Vec<NodeId>, Vec<NodeId>, Vec<NodeId>, Vec<NodeId>) {
    (
        scaffold.resampling_nodes(),
        scaffold.absorbing_nodes(),
        scaffold.aaa_nodes(),
        scaffold.brush_nodes(),
    )
}

#[test]
fn chain_children_absorb_parameter_changes() {
    let mut trace = Trace::new(21);
    let (did_mu, _) = trace
        .assume("mu", app(vec![sym("normal"), num(0.0), num(1.0)]))
        .unwrap();
    let (did_y, _) = trace
        .assume("y", app(vec![sym("normal"), sym("mu"), num(1.0)]))
        .unwrap();
    let mu_root = trace.family_root_of(did_mu).unwrap();
    let y_root = trace.family_root_of(did_y).unwrap();

    let scaffold = construct_scaffold(&trace, &singleton(mu_root), false).unwrap();
    assert!(scaffold.is_resampling(mu_root));
    assert!(scaffold.is_absorbing(y_root), "y should absorb mu's move");
    assert!(!scaffold.is_resampling(y_root));
    assert!(scaffold.brush_nodes().is_empty());
    assert!(scaffold.aaa_nodes().is_empty());
    // The lookup feeding y resamples transparently.
    let lookups: Vec<NodeId> = scaffold
        .resampling_nodes()
        .into_iter()
        .filter(|n| matches!(trace.node(*n).unwrap().kind, NodeKind::Lookup { .. }))
        .collect();
    assert_eq!(lookups.len(), 1);
}

#[test]
fn shape_is_stable_across_a_forward_step() {
    let mut trace = Trace::new(22);
    let (did_mu, _) = trace
        .assume("mu", app(vec![sym("normal"), num(0.0), num(1.0)]))
        .unwrap();
    trace
        .assume("y", app(vec![sym("normal"), sym("mu"), num(1.0)]))
        .unwrap();
    let mu_root = trace.family_root_of(did_mu).unwrap();

    let first = construct_scaffold(&trace, &singleton(mu_root), false).unwrap();
    let first_shape = shape(&first);
    let first_border: Vec<Vec<NodeId>> = first.border().to_vec();

    let mut working = construct_scaffold(&trace, &singleton(mu_root), false).unwrap();
    let (_rho, db) = detach_and_extract(&mut trace, &mut working).unwrap();
    let mut fresh = Db::new();
    regen_and_attach(&mut trace, &mut working, false, &mut fresh).unwrap();
    trace.dispose(db).unwrap();

    let second = construct_scaffold(&trace, &singleton(mu_root), false).unwrap();
    assert_eq!(first_shape, shape(&second));
    assert_eq!(first_border, second.border().to_vec());
}

#[test]
fn maker_upstream_of_counts_is_tagged_aaa() {
    let mut trace = Trace::new(23);
    let (did_a, _) = trace
        .assume(
            "a",
            app(vec![sym("uniform_continuous"), num(0.5), num(2.0)]),
        )
        .unwrap();
    let (did_coin, _) = trace
        .assume("coin", app(vec![sym("make_beta_bernoulli"), sym("a"), sym("a")]))
        .unwrap();
    trace.predict(app(vec![sym("coin")])).unwrap();
    trace.predict(app(vec![sym("coin")])).unwrap();

    let a_root = trace.family_root_of(did_a).unwrap();
    let coin_root = trace.family_root_of(did_coin).unwrap();
    let scaffold = construct_scaffold(&trace, &singleton(a_root), false).unwrap();
    assert!(scaffold.is_aaa(coin_root), "maker should take the AAA path");
    assert!(scaffold.is_resampling(coin_root));
    // Downstream coin draws are not pulled into the proposal individually.
    for choice in trace.unconstrained_choices() {
        if *choice != a_root && *choice != coin_root {
            assert!(!scaffold.is_resampling(*choice));
            assert!(!scaffold.is_absorbing(*choice));
        }
    }
}

#[test]
fn flipped_predicate_brushes_the_taken_branch() {
    let mut trace = Trace::new(24);
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
    trace.predict(app(vec![sym("g")])).unwrap();

    let flip_out = *trace
        .unconstrained_choices()
        .iter()
        .next()
        .expect("the predicate is the only choice");
    let scaffold = construct_scaffold(&trace, &singleton(flip_out), false).unwrap();
    assert!(
        !scaffold.brush_nodes().is_empty(),
        "the taken branch must become brush"
    );
    // Brush is structural: none of it stays in the resampling counts.
    for node in scaffold.brush_nodes() {
        assert!(!scaffold.is_resampling(node));
        assert!(!scaffold.is_absorbing(node));
    }
}

#[test]
fn border_sections_follow_principal_sets() {
    let mut trace = Trace::new(25);
    let (did_x, _) = trace
        .assume("x", app(vec![sym("normal"), num(0.0), num(1.0)]))
        .unwrap();
    let (did_z, _) = trace
        .assume("z", app(vec![sym("normal"), num(5.0), num(1.0)]))
        .unwrap();
    let x_root = trace.family_root_of(did_x).unwrap();
    let z_root = trace.family_root_of(did_z).unwrap();

    let mut first = BTreeSet::new();
    first.insert(x_root);
    let mut second = BTreeSet::new();
    second.insert(z_root);
    let scaffold = construct_scaffold(&trace, &[first, second], false).unwrap();
    assert_eq!(scaffold.border().len(), 2);
    assert!(scaffold.border()[0].contains(&x_root));
    assert!(scaffold.border()[1].contains(&z_root));
}
