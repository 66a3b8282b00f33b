use weft_core::WeftError;

#[test]
fn messages_name_the_offenders() {
    let err = WeftError::type_mismatch("number", "bool");
    assert_eq!(err.to_string(), "type mismatch: expected number, got bool");

    let err = WeftError::UnboundSymbol("mu".to_owned());
    assert_eq!(err.to_string(), "unbound symbol: mu");

    let err = WeftError::arity("normal", 2, 1);
    assert_eq!(err.to_string(), "normal expected 2 operands, got 1");
}

#[test]
fn only_assertions_poison_the_trace() {
    assert!(WeftError::Assertion("broken edge".to_owned()).poisons_trace());
    assert!(!WeftError::DoubleConstrain.poisons_trace());
    assert!(!WeftError::UnpropagatedObservation.poisons_trace());
    assert!(!WeftError::UnboundSymbol("x".to_owned()).poisons_trace());
}

#[test]
fn errors_serialize_for_host_transport() {
    let err = WeftError::Arity {
        sp: "beta".to_owned(),
        expected: 2,
        got: 3,
    };
    let json = serde_json::to_string(&err).unwrap();
    let back: WeftError = serde_json::from_str(&json).unwrap();
    assert_eq!(err, back);
}
