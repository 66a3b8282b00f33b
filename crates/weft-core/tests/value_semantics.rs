use std::collections::{BTreeMap, BTreeSet};

use weft_core::{Matrix, NodeId, Value, WeftError};

#[test]
fn accessors_return_payloads() {
    assert!(Value::Bool(true).as_bool().unwrap());
    assert_eq!(Value::Integer(3).as_integer().unwrap(), 3);
    assert_eq!(Value::Integer(3).as_double().unwrap(), 3.0);
    assert_eq!(Value::Number(2.5).as_double().unwrap(), 2.5);
    assert_eq!(Value::symbol("x").as_symbol().unwrap(), "x");
    assert_eq!(
        Value::SpRef(NodeId::from_raw(7)).as_sp_ref().unwrap(),
        NodeId::from_raw(7)
    );
}

#[test]
fn mismatched_accessor_reports_both_kinds() {
    let err = Value::Bool(true).as_double().unwrap_err();
    assert_eq!(
        err,
        WeftError::Type {
            expected: "number".to_owned(),
            got: "bool".to_owned(),
        }
    );
}

#[test]
fn lists_round_trip_through_pairs() {
    let list = Value::list(vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]);
    let items = list.as_list().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(*items[1], Value::Integer(2));
    assert!(Value::Nil.as_list().unwrap().is_empty());
    assert!(Value::Integer(1).as_list().is_err());
}

#[test]
fn structural_equality_ignores_provenance() {
    let a = Value::Array(vec![Value::Number(1.0), Value::symbol("x")]);
    let b = Value::Array(vec![Value::Number(1.0), Value::symbol("x")]);
    assert_eq!(a, b);
    assert_ne!(a, Value::Array(vec![Value::Number(1.0)]));
}

#[test]
fn values_key_ordered_maps() {
    let mut map: BTreeMap<Value, i32> = BTreeMap::new();
    map.insert(Value::Number(1.5), 1);
    map.insert(Value::Bool(false), 2);
    map.insert(Value::symbol("a"), 3);
    map.insert(Value::Number(-2.0), 4);
    // Deterministic order: rank first, then contents.
    let keys: Vec<&Value> = map.keys().collect();
    assert_eq!(keys[0], &Value::Bool(false));
    assert_eq!(keys[1], &Value::Number(-2.0));
    assert_eq!(keys[2], &Value::Number(1.5));
    assert_eq!(keys[3], &Value::symbol("a"));
}

#[test]
fn distinct_float_bits_stay_distinct() {
    let mut set = BTreeSet::new();
    set.insert(Value::Number(0.0));
    set.insert(Value::Number(-0.0));
    // total_cmp distinguishes signed zeros, so both survive as keys.
    assert_eq!(set.len(), 2);
}

#[test]
fn matrix_shape_is_checked() {
    let m = Matrix::new(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    assert_eq!(m.get(1, 0), Some(3.0));
    assert_eq!(m.get(2, 0), None);
    assert!(Matrix::new(2, 2, vec![1.0]).is_err());
}

#[test]
fn serde_round_trips_plain_values() {
    let value = Value::Array(vec![
        Value::symbol("normal"),
        Value::Number(0.0),
        Value::Integer(1),
    ]);
    let json = serde_json::to_string(&value).unwrap();
    let back: Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value, back);
}
