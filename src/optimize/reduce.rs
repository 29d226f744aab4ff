//! Reduce rewrites: sum-of-products kernels and trivial reductions.

use crate::ast::{Aggr, BinaryOp};
use crate::graph::{Graph, NodeId, NodeKind};
use crate::types::{Dimension, ValueType};

/// `reduce(join(a, b, mul), sum, dims)`, with an empty list resolved to every
/// dimension of the product.
fn sum_of_products(graph: &Graph, id: NodeId) -> Option<(NodeId, NodeId, Vec<String>)> {
    let NodeKind::Reduce { child, aggr: Aggr::Sum, dims } = graph.kind(id) else {
        return None;
    };
    let (lhs, rhs, function) = graph.kind(*child).as_join()?;
    if !function.is_op(BinaryOp::Mul) {
        return None;
    }
    let dims = if dims.is_empty() {
        graph.result_type_of(*child).dimensions().iter().map(|d| d.name.clone()).collect()
    } else {
        dims.clone()
    };
    Some((lhs, rhs, dims))
}

fn names(ty: &ValueType) -> Vec<&str> {
    ty.dimensions().iter().map(|d| d.name.as_str()).collect()
}

fn only_dims(ty: &ValueType, dims: &[String]) -> bool {
    ty.dimensions().len() == dims.len() && dims.iter().all(|d| ty.dimension(d).is_some())
}

pub(super) fn dense_dot_product(graph: &Graph, id: NodeId) -> Option<NodeKind> {
    let (lhs, rhs, _) = sum_of_products(graph, id)?;
    let (a, b) = (graph.result_type_of(lhs), graph.result_type_of(rhs));
    if !graph.result_type_of(id).is_double() || !a.is_dense() || !a.same_dimensions(b) {
        return None;
    }
    Some(NodeKind::DenseDotProduct { lhs, rhs })
}

pub(super) fn dense_xw_product(graph: &Graph, id: NodeId) -> Option<NodeKind> {
    let (lhs, rhs, dims) = sum_of_products(graph, id)?;
    let [common] = dims.as_slice() else {
        return None;
    };
    let try_order = |vector: NodeId, matrix: NodeId| -> Option<NodeKind> {
        let (v, m) = (graph.result_type_of(vector), graph.result_type_of(matrix));
        if !v.is_dense() || !m.is_dense() || !only_dims(v, &dims) || m.dimensions().len() != 2 {
            return None;
        }
        let common_at = m.dimension_index(common)?;
        let other = &m.dimensions()[1 - common_at];
        Some(NodeKind::DenseXWProduct {
            vector,
            matrix,
            vector_size: v.dense_subspace_size(),
            result_size: other.size as usize,
            common_inner: common_at == 1,
        })
    };
    try_order(lhs, rhs).or_else(|| try_order(rhs, lhs))
}

pub(super) fn dense_matmul(graph: &Graph, id: NodeId) -> Option<NodeKind> {
    let (lhs, rhs, dims) = sum_of_products(graph, id)?;
    let [common] = dims.as_slice() else {
        return None;
    };
    let (a, b) = (graph.result_type_of(lhs), graph.result_type_of(rhs));
    if !a.is_dense() || !b.is_dense() || a.dimensions().len() != 2 || b.dimensions().len() != 2 {
        return None;
    }
    let (ai, bi) = (a.dimension_index(common)?, b.dimension_index(common)?);
    let (a_other, b_other): (&Dimension, &Dimension) = (&a.dimensions()[1 - ai], &b.dimensions()[1 - bi]);
    if a_other.name == b_other.name {
        return None;
    }
    // The result keeps the dimension that sorts first outermost.
    let (lhs, rhs, ai, bi, a_other, b_other) =
        if a_other.name < b_other.name { (lhs, rhs, ai, bi, a_other, b_other) } else { (rhs, lhs, bi, ai, b_other, a_other) };
    Some(NodeKind::DenseMatMul {
        lhs,
        rhs,
        lhs_size: a_other.size as usize,
        common_size: graph.result_type_of(lhs).dimensions()[ai].size as usize,
        rhs_size: b_other.size as usize,
        lhs_common_inner: ai == 1,
        rhs_common_inner: bi == 1,
    })
}

pub(super) fn mixed_inner_product(graph: &Graph, id: NodeId) -> Option<NodeKind> {
    let (lhs, rhs, dims) = sum_of_products(graph, id)?;
    let try_order = |mixed: NodeId, vector: NodeId| -> Option<NodeKind> {
        let (m, v) = (graph.result_type_of(mixed), graph.result_type_of(vector));
        if !v.is_dense() || !only_dims(v, &dims) || m.count_mapped_dimensions() == 0 {
            return None;
        }
        // The vector must be the innermost indexed block of the mixed operand.
        let indexed: Vec<&str> = m.indexed_dimensions().iter().map(|d| d.name.as_str()).collect();
        let vector_names = names(v);
        if !indexed.ends_with(&vector_names) {
            return None;
        }
        let sizes_match = v.dimensions().iter().all(|d| m.dimension(&d.name).is_some_and(|md| md.size == d.size));
        sizes_match.then_some(NodeKind::MixedInnerProduct { mixed, vector })
    };
    try_order(lhs, rhs).or_else(|| try_order(rhs, lhs))
}

/// Reducing only size-1 indexed dimensions with an aggregator that is the
/// identity on one value changes the type and nothing else.
pub(super) fn remove_trivial_dimensions(graph: &Graph, id: NodeId) -> Option<NodeKind> {
    let NodeKind::Reduce { child, aggr, dims } = graph.kind(id) else {
        return None;
    };
    let input = graph.result_type_of(*child);
    if !aggr.is_identity_on_single() || input.cell_type() != graph.result_type_of(id).cell_type() {
        return None;
    }
    let all_trivial = if dims.is_empty() {
        input.dimensions().iter().all(Dimension::is_trivial)
    } else {
        dims.iter().all(|name| input.dimension(name).is_some_and(Dimension::is_trivial))
    };
    all_trivial.then_some(NodeKind::Relabel { child: *child })
}

#[cfg(test)]
mod tests {
    use super::super::optimize;
    use crate::ast::{Aggr, BinaryOp, Function, Node};
    use crate::graph::{Graph, NoConstants, NodeKind};
    use crate::types::ValueType;

    fn optimized(root: Node, params: &[&str]) -> Graph {
        let names: Vec<&str> = params.iter().map(|_| "p").collect();
        let types: Vec<ValueType> = params.iter().map(|t| ValueType::from_spec(t)).collect();
        let mut g = Graph::build(&Function::new(&names, root), &types, &NoConstants);
        optimize(&mut g);
        g
    }

    fn product(aggr: Aggr, dims: &[&str]) -> Node {
        Node::reduce(Node::join(Node::Symbol(0), Node::Symbol(1), BinaryOp::Mul), aggr, dims)
    }

    fn root_name(root: Node, params: &[&str]) -> &'static str {
        let g = optimized(root, params);
        g.kind(g.root()).name()
    }

    #[test]
    fn dot_product_needs_identical_dense_shapes() {
        assert_eq!(root_name(product(Aggr::Sum, &[]), &["tensor(x[3])", "tensor(x[3])"]), "dense_dot_product");
        assert_eq!(root_name(product(Aggr::Sum, &["x"]), &["tensor(x[3])", "tensor<float>(x[3])"]), "dense_dot_product");
        assert_eq!(root_name(product(Aggr::Max, &[]), &["tensor(x[3])", "tensor(x[3])"]), "reduce");
        assert_eq!(root_name(product(Aggr::Sum, &[]), &["tensor(x{})", "tensor(x{})"]), "reduce");
    }

    #[test]
    fn xw_product_records_layout() {
        let g = optimized(product(Aggr::Sum, &["y"]), &["tensor(x[2],y[3])", "tensor(y[3])"]);
        match g.kind(g.root()) {
            NodeKind::DenseXWProduct { vector_size: 3, result_size: 2, common_inner: true, .. } => {}
            other => panic!("unexpected {other:?}"),
        }
        let g = optimized(product(Aggr::Sum, &["a"]), &["tensor(a[3])", "tensor(a[3],b[2])"]);
        assert!(matches!(g.kind(g.root()), NodeKind::DenseXWProduct { common_inner: false, .. }));
    }

    #[test]
    fn matmul_orders_operands_by_result_layout() {
        let g = optimized(product(Aggr::Sum, &["k"]), &["tensor(k[4],z[5])", "tensor(a[2],k[4])"]);
        match g.kind(g.root()) {
            NodeKind::DenseMatMul { lhs_size, common_size, rhs_size, lhs_common_inner, rhs_common_inner, .. } => {
                assert_eq!((*lhs_size, *common_size, *rhs_size), (2, 4, 5));
                assert!(*lhs_common_inner);
                assert!(!*rhs_common_inner);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn extra_dimensions_disqualify_dense_kernels() {
        let params = ["tensor(x[2],y[3],z[2])", "tensor(y[3],w[2])"];
        assert_eq!(root_name(product(Aggr::Sum, &["y"]), &params), "reduce");
    }

    #[test]
    fn mixed_inner_product_needs_innermost_vector() {
        let params = ["tensor(k{},x[2],y[3])", "tensor(y[3])"];
        assert_eq!(root_name(product(Aggr::Sum, &["y"]), &params), "mixed_inner_product");
        let params = ["tensor(k{},x[2],y[3])", "tensor(x[2])"];
        assert_eq!(root_name(product(Aggr::Sum, &["x"]), &params), "reduce");
    }

    #[test]
    fn trivial_reduce_becomes_relabel() {
        let params = ["tensor(k{},x[1],y[3])"];
        assert_eq!(root_name(Node::reduce(Node::Symbol(0), Aggr::Max, &["x"]), &params), "relabel");
        assert_eq!(root_name(Node::reduce(Node::Symbol(0), Aggr::Count, &["x"]), &params), "reduce");
        assert_eq!(root_name(Node::reduce(Node::Symbol(0), Aggr::Sum, &["y"]), &params), "reduce");
        let params = ["tensor<float>(x[1])"];
        // float cells reduced to a scalar become double
        assert_eq!(root_name(Node::reduce(Node::Symbol(0), Aggr::Sum, &[]), &params), "reduce");
    }
}
