//! Request accounting across memoized families: sharing, forgetting, and
//! collection when the last requester leaves.

use weft_core::Value;
use weft_engine::consistency::check_request_counts;
use weft_engine::Trace;

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

fn memoized_normal(trace: &mut Trace) {
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
}

#[test]
fn equal_arguments_share_one_family() {
    let mut trace = Trace::new(31);
    memoized_normal(&mut trace);
    let (p1, v1) = trace.predict(app(vec![sym("f"), num(1.0)])).unwrap();
    let (p2, v2) = trace.predict(app(vec![sym("f"), num(1.0)])).unwrap();
    let (p3, _) = trace.predict(app(vec![sym("f"), num(2.0)])).unwrap();

    assert_eq!(v1, v2, "shared family must share its value");

    let r1 = trace.family_root_of(p1).unwrap();
    let r2 = trace.family_root_of(p2).unwrap();
    let r3 = trace.family_root_of(p3).unwrap();
    let root_one = trace.esr_parents(r1)[0];
    assert_eq!(root_one, trace.esr_parents(r2)[0]);
    let root_two = trace.esr_parents(r3)[0];
    assert_ne!(root_one, root_two);

    assert_eq!(trace.num_requests(root_one), 2);
    assert_eq!(trace.num_requests(root_two), 1);
    check_request_counts(&trace).unwrap();
}

#[test]
fn forgetting_requesters_releases_the_family() {
    let mut trace = Trace::new(32);
    memoized_normal(&mut trace);
    let (p1, _) = trace.predict(app(vec![sym("f"), num(1.0)])).unwrap();
    let (p2, _) = trace.predict(app(vec![sym("f"), num(1.0)])).unwrap();

    let root_one = trace.esr_parents(trace.family_root_of(p1).unwrap())[0];
    assert_eq!(trace.num_requests(root_one), 2);

    trace.forget(p1).unwrap();
    assert_eq!(trace.num_requests(root_one), 1);
    check_request_counts(&trace).unwrap();

    trace.forget(p2).unwrap();
    assert_eq!(trace.num_requests(root_one), 0);
    assert!(
        !trace.has_node(root_one),
        "the last forget must collect the shared family"
    );
    check_request_counts(&trace).unwrap();
}

#[test]
fn counts_survive_a_forward_step() {
    use std::collections::BTreeSet;
    use weft_engine::{construct_scaffold, detach_and_extract, regen_and_attach, Db};

    let mut trace = Trace::new(33);
    memoized_normal(&mut trace);
    trace.predict(app(vec![sym("f"), num(1.0)])).unwrap();
    trace.predict(app(vec![sym("f"), num(1.0)])).unwrap();

    let choices: Vec<_> = trace.unconstrained_choices().iter().copied().collect();
    for choice in choices {
        let mut pnodes = BTreeSet::new();
        pnodes.insert(choice);
        let mut scaffold = construct_scaffold(&trace, &[pnodes], false).unwrap();
        let (_rho, db) = detach_and_extract(&mut trace, &mut scaffold).unwrap();
        let mut fresh = Db::new();
        regen_and_attach(&mut trace, &mut scaffold, false, &mut fresh).unwrap();
        trace.dispose(db).unwrap();
        check_request_counts(&trace).unwrap();
    }
}
