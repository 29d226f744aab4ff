//! Cache lifetime of index tables. Kept to one test so nothing else in this
//! binary touches the process-wide cache while it is being counted.

use std::sync::Arc;

use tenseval::lookup_table::{IndexLookupTable, NO_INDEX};
use tenseval::{BinaryOp, EngineConfig, Function, InterpretedFunction, NoConstants, Node, PeekLabel, TensorSpec, ValueType};

fn transpose() -> Function {
    let body = Node::Peek {
        child: Box::new(Node::Symbol(2)),
        spec: vec![("a".into(), PeekLabel::Expr(Node::Symbol(1))), ("b".into(), PeekLabel::Expr(Node::Symbol(0)))],
    };
    let root = Node::Lambda {
        value_type: ValueType::from_spec("tensor(x[2],y[3])"),
        bindings: vec![0],
        lambda: Arc::new(Function::new(&["x", "y", "m"], body)),
    };
    Function::new(&["m"], root)
}

#[test]
fn tables_live_as_long_as_their_handles() {
    let before = IndexLookupTable::num_cached();

    // direct handles
    let fun = Arc::new(Function::new(&["i"], Node::binary(BinaryOp::Sub, Node::Symbol(0), Node::Number(1.0))));
    let ty = ValueType::from_spec("tensor(i[3])");
    let first = IndexLookupTable::create(&fun, &ty);
    let second = IndexLookupTable::create(&fun, &ty);
    assert_eq!(first.table(), &[NO_INDEX, 0, 1]);
    assert_eq!(IndexLookupTable::ref_count(&fun, &ty), 2);
    assert_eq!(IndexLookupTable::num_cached(), before + 1);
    let third = first.clone();
    assert_eq!(IndexLookupTable::ref_count(&fun, &ty), 3);
    drop(first);
    drop(third);
    assert!(IndexLookupTable::is_cached(&fun, &ty));
    drop(second);
    assert!(!IndexLookupTable::is_cached(&fun, &ty));
    assert_eq!(IndexLookupTable::num_cached(), before);

    // a compiled lambda peek holds its table until the function is dropped
    let param = TensorSpec::from_expr("tensor(a[3],b[2]):[[1,2],[3,4],[5,6]]").unwrap();
    let compiled = InterpretedFunction::compile(
        &transpose(),
        &[param.value_type().clone()],
        &NoConstants,
        &EngineConfig::default(),
    );
    assert_eq!(compiled.graph().count_kind("dense_lambda_peek"), 1);
    assert_eq!(IndexLookupTable::num_cached(), before + 1);
    let value = tenseval::value_from_spec(&param, &*EngineConfig::default().factory());
    let result = tenseval::spec_from_value(&*compiled.eval(&[value.as_ref()]).unwrap());
    let expected = TensorSpec::from_expr("tensor(x[2],y[3]):[[1,3,5],[2,4,6]]").unwrap();
    assert!(result.approx_eq(&expected, 0.0), "{result}");
    drop(compiled);
    assert_eq!(IndexLookupTable::num_cached(), before);

}
