//! Kernels that run a compiled inner function per cell or per subspace.

use std::sync::Arc;

use crate::graph::Graph;
use crate::types::ValueType;
use crate::value::{Cell, DenseView, DoubleValue, Value, ValueBuilder, ValueBuilderFactory};
use crate::vm::{InterpretedFunction, State};

// ---- Tensor lambda ----

#[derive(Debug)]
pub(crate) struct LambdaParams {
    result_type: ValueType,
    bindings: Vec<usize>,
    sizes: Vec<usize>,
    fun: InterpretedFunction,
}

impl LambdaParams {
    pub fn new(ty: &ValueType, bindings: &[usize], inner: &Arc<Graph>, factory: &Arc<dyn ValueBuilderFactory>) -> Self {
        LambdaParams {
            result_type: ty.clone(),
            bindings: bindings.to_vec(),
            sizes: ty.dimensions().iter().map(|d| d.size as usize).collect(),
            fun: InterpretedFunction::new((**inner).clone(), factory.clone()),
        }
    }
}

/// Evaluate the inner function once per cell, row-major, with the cell's
/// dimension indices followed by the bound outer parameters.
pub(crate) fn op_lambda<O: Cell>(state: &mut State<'_>, param: u64) {
    let p: &LambdaParams = state.stash(param);
    let bound: Vec<&dyn Value> = p.bindings.iter().map(|&b| state.params[b]).collect();
    let mut coords = vec![0usize; p.sizes.len()];
    let mut builder = ValueBuilder::<O>::new(&p.result_type, 1);
    let empty: [&str; 0] = [];
    let (out, _) = builder.add_subspace(&empty);
    for cell in out.iter_mut() {
        let indices: Vec<DoubleValue> = coords.iter().map(|&i| DoubleValue::new(i as f64)).collect();
        let mut args: Vec<&dyn Value> = indices.iter().map(|v| v as &dyn Value).collect();
        args.extend(bound.iter().copied());
        *cell = O::from_f64(p.fun.run(&args).as_double());
        for (c, size) in coords.iter_mut().zip(&p.sizes).rev() {
            *c += 1;
            if *c < *size {
                break;
            }
            *c = 0;
        }
    }
    let value = builder.build(p.result_type.clone(), state.factory);
    state.push_owned(value);
}

// ---- map_subspaces ----

#[derive(Debug)]
pub(crate) struct MapSubspacesParams {
    result_type: ValueType,
    inner_type: ValueType,
    in_size: usize,
    fun: InterpretedFunction,
}

impl MapSubspacesParams {
    pub fn new(input: &ValueType, result: &ValueType, inner: &Arc<Graph>, factory: &Arc<dyn ValueBuilderFactory>) -> Self {
        MapSubspacesParams {
            result_type: result.clone(),
            inner_type: input.dense_subspace_type(),
            in_size: input.dense_subspace_size(),
            fun: InterpretedFunction::new((**inner).clone(), factory.clone()),
        }
    }
}

/// Run the inner function on every dense subspace; each result lands in the
/// subspace with the same labels.
pub(crate) fn op_map_subspaces<O: Cell>(state: &mut State<'_>, param: u64) {
    let p: &MapSubspacesParams = state.stash(param);
    let input = state.pop();
    let (index, cells) = (input.index(), input.cells());
    let mut builder = ValueBuilder::<O>::new(&p.result_type, index.size());
    for s in 0..index.size() {
        // A subspace without indexed dimensions is passed as a plain number.
        let scalar;
        let view;
        let arg: &dyn Value = if p.inner_type.is_double() {
            scalar = DoubleValue::new(cells.get(s));
            &scalar
        } else {
            view = DenseView::new(p.inner_type.clone(), cells.slice(s * p.in_size, p.in_size));
            &view
        };
        let args = [arg];
        let result = p.fun.run(&args);
        let (out, _) = builder.add_subspace(index.labels(s));
        let rc = result.cells();
        for (k, cell) in out.iter_mut().enumerate() {
            *cell = O::from_f64(rc.get(k));
        }
    }
    let value = builder.build(p.result_type.clone(), state.factory);
    state.push_owned(value);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::ast::{Aggr, BinaryOp, Function, Node};
    use crate::config::EngineConfig;
    use crate::graph::NoConstants;
    use crate::types::ValueType;
    use crate::value::{TensorSpec, Value, spec_from_value, value_from_spec};
    use crate::vm::InterpretedFunction;

    fn eval(root: Node, params: &[&str]) -> TensorSpec {
        let specs: Vec<TensorSpec> = params.iter().map(|p| TensorSpec::from_expr(p).unwrap()).collect();
        let config = EngineConfig::default();
        let values: Vec<Box<dyn Value>> = specs.iter().map(|s| value_from_spec(s, config.factory().as_ref())).collect();
        let refs: Vec<&dyn Value> = values.iter().map(|v| v.as_ref()).collect();
        let types: Vec<ValueType> = specs.iter().map(|s| s.value_type().clone()).collect();
        let names: Vec<&str> = params.iter().map(|_| "p").collect();
        let f = InterpretedFunction::compile(&Function::new(&names, root), &types, &NoConstants, &config);
        spec_from_value(&*f.eval(&refs).unwrap())
    }

    #[test]
    fn lambda_reads_indices_and_bindings() {
        // tensor(x[2],y[3])(x*10+y+a)
        let body = Node::binary(
            BinaryOp::Add,
            Node::binary(BinaryOp::Add, Node::binary(BinaryOp::Mul, Node::Symbol(0), Node::Number(10.0)), Node::Symbol(1)),
            Node::Symbol(2),
        );
        let root = Node::Lambda {
            value_type: ValueType::from_spec("tensor(x[2],y[3])"),
            bindings: vec![0],
            lambda: Arc::new(Function::new(&["x", "y", "a"], body)),
        };
        let out = eval(root, &["0.5"]);
        let expected = TensorSpec::from_expr("tensor(x[2],y[3]):[[0.5,1.5,2.5],[10.5,11.5,12.5]]").unwrap();
        assert!(out.approx_eq(&expected, 0.0), "{out}");
    }

    #[test]
    fn map_subspaces_reduces_each_subspace() {
        let lambda = Arc::new(Function::new(&["s"], Node::reduce(Node::Symbol(0), Aggr::Max, &[])));
        let root = Node::MapSubspaces { child: Box::new(Node::Symbol(0)), lambda };
        let out = eval(root, &["tensor<float>(k{},x[3]):{a:[1,7,2],b:[-1,-2,-3]}"]);
        let expected = TensorSpec::from_expr("tensor(k{}):{a:7,b:-1}").unwrap();
        assert!(out.approx_eq(&expected, 0.0), "{out}");
    }

    #[test]
    fn map_subspaces_over_sparse_passes_numbers() {
        let lambda = Arc::new(Function::new(&["s"], Node::binary(BinaryOp::Mul, Node::Symbol(0), Node::Number(3.0))));
        let root = Node::MapSubspaces { child: Box::new(Node::Symbol(0)), lambda };
        let out = eval(root, &["tensor<float>(k{}):{a:1,b:2}"]);
        let expected = TensorSpec::from_expr("tensor(k{}):{a:3,b:6}").unwrap();
        assert!(out.approx_eq(&expected, 0.0), "{out}");
    }
}
