//! Specialized kernels chosen by the optimizer. Most of them assume dense
//! operands and write straight into a single output subspace.

use crate::graph::{JoinFn, Overlap};
use crate::lookup_table::{IndexLookupTable, NO_INDEX};
use crate::types::ValueType;
use crate::value::{Cell, DoubleValue, Relabeled, ValueBuilder, ValueRef};
use crate::vm::State;

use super::generic::{self, MapParams};

/// Build a value without mapped dimensions from its cells.
fn dense_result<O: Cell>(state: &mut State<'_>, ty: &ValueType, fill: impl FnOnce(&mut [O])) {
    let mut builder = ValueBuilder::<O>::new(ty, 1);
    let empty: [&str; 0] = [];
    let (out, _) = builder.add_subspace(&empty);
    fill(out);
    let value = builder.build(ty.clone(), state.factory);
    state.push_owned(value);
}

// ---- Relabel ----

/// Reinterpret the top of the stack under a new type with the same cell layout.
pub(crate) fn op_relabel(state: &mut State<'_>, param: u64) {
    let ty: &ValueType = state.stash(param);
    let child = state.pop();
    state.push_owned(Box::new(Relabeled::new(ty.clone(), child)));
}

// ---- Map ----

/// Map that overwrites the operand's cells when the stack owns them.
pub(crate) fn op_map_inplace<T: Cell>(state: &mut State<'_>, param: u64) {
    let p: &MapParams = state.stash(param);
    let mut input = state.pop();
    if let Some(cells) = input.as_mut().and_then(|v| v.cells_mut()) {
        if cells.cell_type() == T::CELL_TYPE {
            for c in T::unwrap_mut(cells) {
                *c = T::from_f64(p.function.apply(c.to_f64()));
            }
            state.push(input);
            return;
        }
    }
    state.push(input);
    generic::op_map::<T, T>(state, param);
}

// ---- Reduce specializations ----

/// `reduce(a*b, sum)` over two dense vectors of the same dimension.
pub(crate) fn op_dot_product<A: Cell, B: Cell>(state: &mut State<'_>, _param: u64) {
    let rhs = state.pop();
    let lhs = state.pop();
    let (a, b) = (A::unwrap(lhs.cells()), B::unwrap(rhs.cells()));
    let sum: f64 = a.iter().zip(b).map(|(x, y)| x.to_f64() * y.to_f64()).sum();
    state.push_owned(Box::new(DoubleValue::new(sum)));
}

#[derive(Debug)]
pub(crate) struct XwParams {
    pub result_type: ValueType,
    pub vector_size: usize,
    pub result_size: usize,
    /// The common dimension is the matrix's inner (last) dimension.
    pub common_inner: bool,
}

/// Vector times matrix, summed over the dimension they share.
pub(crate) fn op_xw_product<V: Cell, M: Cell, O: Cell>(state: &mut State<'_>, param: u64) {
    let p: &XwParams = state.stash(param);
    let matrix = state.pop();
    let vector = state.pop();
    let (v, m) = (V::unwrap(vector.cells()), M::unwrap(matrix.cells()));
    let (n, rows) = (p.vector_size, p.result_size);
    dense_result::<O>(state, &p.result_type, |out| {
        for (r, cell) in out.iter_mut().enumerate() {
            let mut sum = 0.0;
            for (c, x) in v.iter().enumerate() {
                let at = if p.common_inner { r * n + c } else { c * rows + r };
                sum += x.to_f64() * m[at].to_f64();
            }
            *cell = O::from_f64(sum);
        }
    });
}

#[derive(Debug)]
pub(crate) struct MatMulParams {
    pub result_type: ValueType,
    pub lhs_size: usize,
    pub common_size: usize,
    pub rhs_size: usize,
    pub lhs_common_inner: bool,
    pub rhs_common_inner: bool,
}

/// Matrix multiplication of two rank-2 dense tensors sharing one dimension.
/// The result is laid out with the lhs dimension outermost.
pub(crate) fn op_matmul<L: Cell, R: Cell, O: Cell>(state: &mut State<'_>, param: u64) {
    let p: &MatMulParams = state.stash(param);
    let rhs = state.pop();
    let lhs = state.pop();
    let (a, b) = (L::unwrap(lhs.cells()), R::unwrap(rhs.cells()));
    let (ls, cs, rs) = (p.lhs_size, p.common_size, p.rhs_size);
    let a_at = |i: usize, k: usize| if p.lhs_common_inner { i * cs + k } else { k * ls + i };
    let b_at = |j: usize, k: usize| if p.rhs_common_inner { j * cs + k } else { k * rs + j };
    dense_result::<O>(state, &p.result_type, |out| {
        for i in 0..ls {
            for j in 0..rs {
                let mut sum = 0.0;
                for k in 0..cs {
                    sum += a[a_at(i, k)].to_f64() * b[b_at(j, k)].to_f64();
                }
                out[i * rs + j] = O::from_f64(sum);
            }
        }
    });
}

#[derive(Debug)]
pub(crate) struct MixedInnerParams {
    result_type: ValueType,
    mixed_size: usize,
    vector_size: usize,
    out_size: usize,
}

impl MixedInnerParams {
    /// The vector's dimensions are the innermost indexed dimensions of the
    /// mixed operand.
    pub fn new(mixed: &ValueType, vector: &ValueType, result: &ValueType) -> Self {
        let mixed_size = mixed.dense_subspace_size();
        let vector_size = vector.dense_subspace_size();
        MixedInnerParams {
            result_type: result.clone(),
            mixed_size,
            vector_size,
            out_size: result.dense_subspace_size(),
        }
    }
}

/// Inner product of every dense subspace of a mixed tensor with a dense vector.
pub(crate) fn op_mixed_inner_product<M: Cell, V: Cell, O: Cell>(state: &mut State<'_>, param: u64) {
    let p: &MixedInnerParams = state.stash(param);
    let vector = state.pop();
    let mixed = state.pop();
    let (m, v) = (M::unwrap(mixed.cells()), V::unwrap(vector.cells()));
    let index = mixed.index();
    let mut builder = ValueBuilder::<O>::new(&p.result_type, index.size());
    for s in 0..index.size() {
        let block = &m[s * p.mixed_size..(s + 1) * p.mixed_size];
        let (out, _) = builder.add_subspace(index.labels(s));
        for (o, cell) in out.iter_mut().enumerate().take(p.out_size) {
            let row = &block[o * p.vector_size..(o + 1) * p.vector_size];
            let sum: f64 = row.iter().zip(v).map(|(x, y)| x.to_f64() * y.to_f64()).sum();
            *cell = O::from_f64(sum);
        }
    }
    let value = builder.build(p.result_type.clone(), state.factory);
    state.push_owned(value);
}

// ---- Join specializations ----

#[derive(Debug)]
pub(crate) struct SimpleJoinParams {
    pub result_type: ValueType,
    pub function: JoinFn,
    /// The primary operand has the result's dimensions.
    pub primary_is_lhs: bool,
    pub overlap: Overlap,
    pub inplace: bool,
    /// Cells in the secondary operand's dense subspace.
    pub secondary_size: usize,
}

/// Join of two dense tensors where one operand's dimensions are a contiguous
/// run of the other's.
pub(crate) fn op_simple_join<L: Cell, R: Cell, O: Cell>(state: &mut State<'_>, param: u64) {
    let p: &SimpleJoinParams = state.stash(param);
    let rhs = state.pop();
    let lhs = state.pop();
    if p.primary_is_lhs {
        simple_join::<L, R, O>(state, p, lhs, rhs);
    } else {
        simple_join::<R, L, O>(state, p, rhs, lhs);
    }
}

fn simple_join<'a, P: Cell, S: Cell, O: Cell>(
    state: &mut State<'a>,
    p: &SimpleJoinParams,
    mut primary: ValueRef<'a>,
    secondary: ValueRef<'a>,
) {
    let sec = S::unwrap(secondary.cells());
    debug_assert_eq!(sec.len(), p.secondary_size);
    let n = primary.cells().len();
    let block = (n / p.secondary_size.max(1)).max(1);
    let sec_at = |i: usize| {
        let j = match p.overlap {
            Overlap::Full => i,
            Overlap::Inner => i % p.secondary_size,
            Overlap::Outer => i / block,
        };
        sec[j].to_f64()
    };
    let apply = |pv: f64, sv: f64| {
        if p.primary_is_lhs { p.function.apply(pv, sv) } else { p.function.apply(sv, pv) }
    };
    if p.inplace && P::CELL_TYPE == O::CELL_TYPE {
        if let Some(cells) = primary.as_mut().and_then(|v| v.cells_mut()) {
            for (i, c) in O::unwrap_mut(cells).iter_mut().enumerate() {
                *c = O::from_f64(apply(c.to_f64(), sec_at(i)));
            }
            state.push(primary);
            return;
        }
    }
    let prim = P::unwrap(primary.cells());
    dense_result::<O>(state, &p.result_type, |out| {
        for (i, cell) in out.iter_mut().enumerate() {
            *cell = O::from_f64(apply(prim[i].to_f64(), sec_at(i)));
        }
    });
}

#[derive(Debug)]
pub(crate) struct NumberJoinParams {
    pub result_type: ValueType,
    pub function: JoinFn,
    pub number_is_lhs: bool,
    pub inplace: bool,
}

/// Join of a tensor with a scalar; the tensor keeps its index.
pub(crate) fn op_join_with_number<T: Cell, O: Cell>(state: &mut State<'_>, param: u64) {
    let p: &NumberJoinParams = state.stash(param);
    let rhs = state.pop();
    let lhs = state.pop();
    let (mut tensor, number) = if p.number_is_lhs { (rhs, lhs) } else { (lhs, rhs) };
    let s = number.as_double();
    let apply = |t: f64| if p.number_is_lhs { p.function.apply(s, t) } else { p.function.apply(t, s) };
    if p.inplace && T::CELL_TYPE == O::CELL_TYPE {
        if let Some(cells) = tensor.as_mut().and_then(|v| v.cells_mut()) {
            for c in O::unwrap_mut(cells) {
                *c = O::from_f64(apply(c.to_f64()));
            }
            state.push(tensor);
            return;
        }
    }
    let cells = T::unwrap(tensor.cells());
    let index = tensor.index();
    let size = p.result_type.dense_subspace_size();
    let mut builder = ValueBuilder::<O>::new(&p.result_type, index.size());
    for s in 0..index.size() {
        let (out, _) = builder.add_subspace(index.labels(s));
        for (o, cell) in out.iter_mut().enumerate() {
            *cell = O::from_f64(apply(cells[s * size + o].to_f64()));
        }
    }
    let value = builder.build(p.result_type.clone(), state.factory);
    state.push_owned(value);
}

// ---- Lambda peek ----

#[derive(Debug)]
pub(crate) struct LambdaPeekParams {
    pub result_type: ValueType,
    pub param: usize,
    pub table: IndexLookupTable,
}

/// A tensor lambda that only permutes or gathers cells of one parameter;
/// positions come from a precomputed table.
pub(crate) fn op_lambda_peek<S: Cell, O: Cell>(state: &mut State<'_>, param: u64) {
    let p: &LambdaPeekParams = state.stash(param);
    let source = S::unwrap(state.params[p.param].cells());
    dense_result::<O>(state, &p.result_type, |out| {
        for (cell, &at) in out.iter_mut().zip(p.table.table()) {
            *cell = match at {
                NO_INDEX => O::default(),
                at => source.get(at as usize).map_or(O::default(), |v| O::from_f64(v.to_f64())),
            };
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::ast::{Aggr, BinaryOp, Function, Node, PeekLabel};
    use crate::config::{Backend, EngineConfig};
    use crate::graph::NoConstants;
    use crate::types::ValueType;
    use crate::value::{TensorSpec, Value, spec_from_value, value_from_spec};
    use crate::vm::InterpretedFunction;

    fn compile(root: Node, types: &[&str], optimize: bool) -> InterpretedFunction {
        let types: Vec<ValueType> = types.iter().map(|t| ValueType::from_spec(t)).collect();
        let names: Vec<&str> = types.iter().map(|_| "p").collect();
        let config = EngineConfig { optimize, backend: Backend::Fast };
        InterpretedFunction::compile(&Function::new(&names, root), &types, &NoConstants, &config)
    }

    fn eval(f: &InterpretedFunction, params: &[&str]) -> TensorSpec {
        let values: Vec<Box<dyn Value>> = params
            .iter()
            .map(|p| value_from_spec(&TensorSpec::from_expr(p).unwrap(), &crate::value::FastValueBuilderFactory))
            .collect();
        let refs: Vec<&dyn Value> = values.iter().map(|v| v.as_ref()).collect();
        spec_from_value(&*f.eval(&refs).unwrap())
    }

    // Optimized and unoptimized programs must agree.
    fn check(root: Node, params: &[&str], kernel: &str) -> TensorSpec {
        let types: Vec<String> = params.iter().map(|p| TensorSpec::from_expr(p).unwrap().value_type().to_spec()).collect();
        let types: Vec<&str> = types.iter().map(String::as_str).collect();
        let fast = compile(root.clone(), &types, true);
        assert!(fast.dump_program().contains(kernel), "{}", fast.dump_program());
        let slow = compile(root, &types, false);
        let (a, b) = (eval(&fast, params), eval(&slow, params));
        assert!(a.approx_eq(&b, 1e-9), "{a} vs {b}");
        a
    }

    fn mul(a: usize, b: usize) -> Node {
        Node::join(Node::Symbol(a), Node::Symbol(b), BinaryOp::Mul)
    }

    #[test]
    fn dot_product() {
        let out = check(
            Node::reduce(mul(0, 1), Aggr::Sum, &[]),
            &["tensor(x[3]):[1,2,3]", "tensor<float>(x[3]):[4,5,6]"],
            "dense_dot_product",
        );
        assert_eq!(out.as_double(), 32.0);
    }

    #[test]
    fn xw_product_both_layouts() {
        let out = check(
            Node::reduce(mul(0, 1), Aggr::Sum, &["x"]),
            &["tensor(x[2]):[1,2]", "tensor(x[2],y[3]):[[1,2,3],[4,5,6]]"],
            "dense_xw_product",
        );
        assert!(out.approx_eq(&TensorSpec::from_expr("tensor(y[3]):[9,12,15]").unwrap(), 0.0));
        check(
            Node::reduce(mul(0, 1), Aggr::Sum, &["y"]),
            &["tensor(y[3]):[1,0,2]", "tensor(x[2],y[3]):[[1,2,3],[4,5,6]]"],
            "dense_xw_product",
        );
    }

    #[test]
    fn matmul() {
        check(
            Node::reduce(mul(0, 1), Aggr::Sum, &["y"]),
            &["tensor(x[2],y[3]):[[1,2,3],[4,5,6]]", "tensor(y[3],z[2]):[[1,0],[0,1],[2,2]]"],
            "dense_matmul",
        );
    }

    #[test]
    fn mixed_inner_product() {
        check(
            Node::reduce(mul(0, 1), Aggr::Sum, &["y"]),
            &["tensor(k{},x[2],y[2]):{a:[[1,2],[3,4]],b:[[0,1],[1,0]]}", "tensor(y[2]):[10,20]"],
            "mixed_inner_product",
        );
    }

    #[test]
    fn simple_join_overlaps() {
        check(mul(0, 1), &["tensor(x[2],y[3]):[[1,2,3],[4,5,6]]", "tensor(y[3]):[1,10,100]"], "dense_simple_join");
        check(
            Node::join(Node::Symbol(0), Node::Symbol(1), BinaryOp::Sub),
            &["tensor(x[2]):[1,2]", "tensor(x[2],y[3]):[[1,2,3],[4,5,6]]"],
            "dense_simple_join",
        );
    }

    #[test]
    fn join_with_number_keeps_sparse_index() {
        let out = check(
            Node::join(Node::Number(2.0), Node::Symbol(0), BinaryOp::Sub),
            &["tensor(k{}):{a:1,b:5}"],
            "join_with_number",
        );
        assert!(out.approx_eq(&TensorSpec::from_expr("tensor(k{}):{a:1,b:-3}").unwrap(), 0.0));
    }

    #[test]
    fn lambda_peek_transposes() {
        // tensor(x[2],y[3])(m{x:y,y:x}) over m: tensor(x[3],y[2])
        let body = Node::Peek {
            child: Box::new(Node::Symbol(2)),
            spec: vec![("x".into(), PeekLabel::Expr(Node::Symbol(1))), ("y".into(), PeekLabel::Expr(Node::Symbol(0)))],
        };
        let lambda = Node::Lambda {
            value_type: ValueType::from_spec("tensor(x[2],y[3])"),
            bindings: vec![0],
            lambda: Arc::new(Function::new(&["x", "y", "m"], body)),
        };
        let out = check(lambda, &["tensor(x[3],y[2]):[[1,2],[3,4],[5,6]]"], "dense_lambda_peek");
        assert!(out.approx_eq(&TensorSpec::from_expr("tensor(x[2],y[3]):[[1,3,5],[2,4,6]]").unwrap(), 0.0));
    }
}
