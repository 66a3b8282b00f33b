//! Choice partition and scope/block bookkeeping.

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

#[test]
fn registries_partition_the_active_choices() {
    let mut trace = Trace::new(41);
    trace
        .assume("x", app(vec![sym("flip"), num(0.5)]))
        .unwrap();
    trace
        .assume("y", app(vec![sym("normal"), num(0.0), num(1.0)]))
        .unwrap();
    check_choice_partition(&trace).unwrap();

    trace.observe(sym("x"), Value::Bool(true)).unwrap();
    trace.make_consistent().unwrap();
    check_choice_partition(&trace).unwrap();

    let choices: Vec<_> = trace.unconstrained_choices().iter().copied().collect();
    for choice in choices {
        let mut pnodes = BTreeSet::new();
        pnodes.insert(choice);
        let mut scaffold = construct_scaffold(&trace, &[pnodes], false).unwrap();
        let (_rho, db) = detach_and_extract(&mut trace, &mut scaffold).unwrap();
        let mut fresh = Db::new();
        regen_and_attach(&mut trace, &mut scaffold, false, &mut fresh).unwrap();
        trace.dispose(db).unwrap();
        check_choice_partition(&trace).unwrap();
        check_request_counts(&trace).unwrap();
    }
}

#[test]
fn default_scope_blocks_are_singletons() {
    let mut trace = Trace::new(42);
    trace
        .assume("x", app(vec![sym("normal"), num(0.0), num(1.0)]))
        .unwrap();
    trace
        .assume("y", app(vec![sym("flip"), num(0.25)]))
        .unwrap();

    let default = Value::symbol("default");
    assert_eq!(trace.num_blocks(&default), 2);
    for choice in trace.unconstrained_choices().clone() {
        let block = Value::Node(choice);
        let members = trace.nodes_in_block(&default, &block).unwrap();
        assert_eq!(members.len(), 1);
        assert!(members.contains(&choice));
    }
    let sampled = trace.sample_block(&default).unwrap();
    assert!(matches!(sampled, Value::Node(_)));
}

#[test]
fn include_tags_collect_the_tagged_subtrace() {
    let mut trace = Trace::new(43);
    trace
        .assume(
            "x",
            app(vec![
                sym("scope_include"),
                quote(sym("s")),
                num(1.0),
                app(vec![sym("normal"), num(0.0), num(1.0)]),
            ]),
        )
        .unwrap();

    let scope = sym("s");
    let block = num(1.0);
    assert_eq!(trace.num_blocks(&scope), 1);
    let members = trace.select(&scope, &block).unwrap();
    assert_eq!(members.len(), 1);
    let choice = *members.iter().next().unwrap();
    assert!(trace.unconstrained_choices().contains(&choice));
}

#[test]
fn exclude_tags_hide_their_subtrace() {
    let mut trace = Trace::new(44);
    trace
        .assume(
            "x",
            app(vec![
                sym("scope_include"),
                quote(sym("s")),
                num(1.0),
                app(vec![
                    sym("add"),
                    app(vec![sym("normal"), num(0.0), num(1.0)]),
                    app(vec![
                        sym("scope_exclude"),
                        quote(sym("s")),
                        app(vec![sym("normal"), num(5.0), num(1.0)]),
                    ]),
                ]),
            ]),
        )
        .unwrap();

    assert_eq!(trace.unconstrained_choices().len(), 2);
    let members = trace.select(&sym("s"), &num(1.0)).unwrap();
    assert_eq!(
        members.len(),
        1,
        "the excluded draw must not reach scope s"
    );
}

#[test]
fn tags_unwind_when_their_directive_is_forgotten() {
    let mut trace = Trace::new(45);
    let (did, _) = trace
        .predict(app(vec![
            sym("scope_include"),
            quote(sym("s")),
            num(1.0),
            app(vec![sym("normal"), num(0.0), num(1.0)]),
        ]))
        .unwrap();
    assert_eq!(trace.num_blocks(&sym("s")), 1);
    trace.forget(did).unwrap();
    assert_eq!(trace.num_blocks(&sym("s")), 0);
    check_choice_partition(&trace).unwrap();
}
