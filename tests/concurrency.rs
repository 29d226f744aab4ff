//! One compiled function evaluated from many threads at once.

use std::sync::Arc;
use std::thread;

use tenseval::lookup_table::IndexLookupTable;
use tenseval::{
    Aggr, BinaryOp, EngineConfig, Function, InterpretedFunction, NoConstants, Node, TensorSpec, UnaryOp, Value,
    ValueType, spec_from_value, value_from_spec,
};

const THREADS: usize = 8;

fn scaled_vector(scale: f64) -> TensorSpec {
    let cells: Vec<String> = (0..4).map(|i| format!("{}", scale * (i as f64 + 1.0))).collect();
    TensorSpec::from_expr(&format!("tensor(y[4]):[{}]", cells.join(","))).unwrap()
}

#[test]
fn shared_function_gives_independent_results() {
    // relu(v * m) summed over y, with an in-place map on the temporary
    let product = Node::reduce(Node::join(Node::Symbol(0), Node::Symbol(1), BinaryOp::Mul), Aggr::Sum, &["y"]);
    let root = Node::map(Node::join(product, Node::Number(1.0), BinaryOp::Sub), UnaryOp::Relu);
    let matrix = TensorSpec::from_expr("tensor(x[2],y[4]):[[1,1,1,1],[1,-1,1,-1]]").unwrap();
    let types = [ValueType::from_spec("tensor(y[4])"), matrix.value_type().clone()];
    let f = InterpretedFunction::compile(&Function::new(&["v", "m"], root), &types, &NoConstants, &EngineConfig::default());
    let factory = EngineConfig::default().factory();
    let m = value_from_spec(&matrix, &*factory);

    let results: Vec<TensorSpec> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let (f, m, factory) = (&f, &m, &factory);
                s.spawn(move || {
                    let v = value_from_spec(&scaled_vector(t as f64), &**factory);
                    let mut last = None;
                    for _ in 0..50 {
                        let params: [&dyn Value; 2] = [v.as_ref(), m.as_ref()];
                        last = Some(spec_from_value(&*f.eval(&params).unwrap()));
                    }
                    last.unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (t, result) in results.iter().enumerate() {
        // v = t*[1,2,3,4]: row 0 sums to 10t, row 1 to -2t
        let expected = TensorSpec::from_expr(&format!("tensor(x[2]):[{},0]", (10.0 * t as f64 - 1.0).max(0.0))).unwrap();
        assert!(result.approx_eq(&expected, 1e-12), "thread {t}: {result}");
    }
}

#[test]
fn concurrent_table_requests_share_one_entry() {
    let fun = Arc::new(Function::new(&["i", "j"], Node::binary(BinaryOp::Add, Node::Symbol(0), Node::Symbol(1))));
    let ty = ValueType::from_spec("tensor(i[16],j[16])");
    let tables: Vec<IndexLookupTable> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS).map(|_| s.spawn(|| IndexLookupTable::create(&fun, &ty))).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(IndexLookupTable::ref_count(&fun, &ty), THREADS);
    assert!(tables.windows(2).all(|w| std::ptr::eq(w[0].table(), w[1].table())));
    drop(tables);
    assert!(!IndexLookupTable::is_cached(&fun, &ty));
}
