//! Join rewrites.

use crate::ast::BinaryOp;
use crate::graph::{Graph, NodeId, NodeKind, Overlap};
use crate::types::ValueType;

fn generic_join(graph: &Graph, id: NodeId) -> Option<(NodeId, NodeId, &crate::graph::JoinFn)> {
    match graph.kind(id) {
        NodeKind::Join { lhs, rhs, function } => Some((*lhs, *rhs, function)),
        _ => None,
    }
}

/// Dense constant with only size-1 dimensions and every cell equal to 1.
fn is_unit_constant(graph: &Graph, id: NodeId) -> bool {
    let NodeKind::Const(value) = graph.kind(id) else {
        return false;
    };
    let ty = value.value_type();
    let cells = value.cells();
    ty.is_dense() && ty.dimensions().iter().all(|d| d.size == 1) && (0..cells.len()).all(|i| cells.get(i) == 1.0)
}

fn disjoint(a: &ValueType, b: &ValueType) -> bool {
    a.dimensions().iter().all(|d| b.dimension(&d.name).is_none())
}

/// `join(a, unit, mul)`, `join(unit, a, mul)` and `join(a, unit, div)` only
/// add size-1 dimensions to `a`.
pub(super) fn unit_dimension_addition(graph: &Graph, id: NodeId) -> Option<NodeKind> {
    let (lhs, rhs, function) = generic_join(graph, id)?;
    let result = graph.result_type_of(id);
    let check = |tensor: NodeId, unit: NodeId| {
        is_unit_constant(graph, unit)
            && disjoint(graph.result_type_of(tensor), graph.result_type_of(unit))
            && graph.result_type_of(tensor).cell_type() == result.cell_type()
    };
    if (function.is_op(BinaryOp::Mul) || function.is_op(BinaryOp::Div)) && check(lhs, rhs) {
        return Some(NodeKind::Relabel { child: lhs });
    }
    if function.is_op(BinaryOp::Mul) && check(rhs, lhs) {
        return Some(NodeKind::Relabel { child: rhs });
    }
    None
}

/// One side is a plain number: combine it with every cell of the other side.
pub(super) fn join_with_number(graph: &Graph, id: NodeId) -> Option<NodeKind> {
    let (lhs, rhs, function) = generic_join(graph, id)?;
    let (a, b) = (graph.result_type_of(lhs), graph.result_type_of(rhs));
    let number_is_lhs = match (a.is_double(), b.is_double()) {
        (true, false) => true,
        (false, true) => false,
        _ => return None,
    };
    let tensor = if number_is_lhs { rhs } else { lhs };
    let inplace = graph.result_is_mutable(tensor)
        && graph.result_type_of(tensor).cell_type() == graph.result_type_of(id).cell_type();
    Some(NodeKind::JoinWithNumber { lhs, rhs, function: function.clone(), number_is_lhs, inplace })
}

/// Where `secondary`'s dimensions sit inside `primary`'s, if they form its
/// outermost or innermost block.
fn block_overlap(primary: &ValueType, secondary: &ValueType) -> Option<Overlap> {
    let p = primary.dimensions();
    let s = secondary.dimensions();
    if p == s {
        Some(Overlap::Full)
    } else if p.ends_with(s) {
        Some(Overlap::Inner)
    } else if p.starts_with(s) {
        Some(Overlap::Outer)
    } else {
        None
    }
}

/// Both operands dense, and one of them has exactly the result's dimensions.
pub(super) fn dense_simple_join(graph: &Graph, id: NodeId) -> Option<NodeKind> {
    let (lhs, rhs, function) = generic_join(graph, id)?;
    let (a, b) = (graph.result_type_of(lhs), graph.result_type_of(rhs));
    let result = graph.result_type_of(id);
    if !a.is_dense() || !b.is_dense() {
        return None;
    }
    let can_overwrite = |primary: NodeId| {
        graph.result_is_mutable(primary) && graph.result_type_of(primary).cell_type() == result.cell_type()
    };
    let mut candidates = Vec::with_capacity(2);
    if a.same_dimensions(result) {
        candidates.push((true, block_overlap(a, b)?));
    }
    if b.same_dimensions(result) {
        candidates.push((false, block_overlap(b, a)?));
    }
    // Prefer a primary whose buffer can be reused.
    let (primary_is_lhs, overlap) = candidates
        .iter()
        .copied()
        .find(|&(is_lhs, _)| can_overwrite(if is_lhs { lhs } else { rhs }))
        .or_else(|| candidates.first().copied())?;
    let inplace = can_overwrite(if primary_is_lhs { lhs } else { rhs });
    Some(NodeKind::DenseSimpleJoin { lhs, rhs, function: function.clone(), primary_is_lhs, overlap, inplace })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::optimize;
    use crate::ast::{BinaryOp, Function, Node, UnaryOp};
    use crate::graph::{ConstantResolver, Graph, NodeKind, Overlap};
    use crate::types::ValueType;
    use crate::value::{FastValueBuilderFactory, TensorSpec, Value, value_from_spec};
    use std::collections::HashMap;

    fn optimized(root: Node, params: &[&str], constants: &dyn ConstantResolver) -> Graph {
        let names: Vec<&str> = params.iter().map(|_| "p").collect();
        let types: Vec<ValueType> = params.iter().map(|t| ValueType::from_spec(t)).collect();
        let mut g = Graph::build(&Function::new(&names, root), &types, constants);
        optimize(&mut g);
        g
    }

    fn constants(entries: &[(&str, &str)]) -> HashMap<String, Arc<dyn Value>> {
        entries
            .iter()
            .map(|(name, text)| {
                let value = value_from_spec(&TensorSpec::from_expr(text).unwrap(), &FastValueBuilderFactory);
                (name.to_string(), Arc::from(value))
            })
            .collect()
    }

    fn root_name(root: Node, params: &[&str]) -> &'static str {
        let g = optimized(root, params, &HashMap::<String, Arc<dyn Value>>::new());
        g.kind(g.root()).name()
    }

    #[test]
    fn unit_constant_only_relabels() {
        let table = constants(&[("one", "tensor(y[1]):[1]"), ("almost", "tensor(y[1]):[0.9]")]);
        let join = |c: &str, op, swap| {
            let (a, b) = (Node::Symbol(0), Node::Constant(c.to_string()));
            if swap { Node::join(b, a, op) } else { Node::join(a, b, op) }
        };
        let name = |root| {
            let g = optimized(root, &["tensor(x[3])"], &table);
            g.kind(g.root()).name()
        };
        assert_eq!(name(join("one", BinaryOp::Mul, false)), "relabel");
        assert_eq!(name(join("one", BinaryOp::Mul, true)), "relabel");
        assert_eq!(name(join("one", BinaryOp::Div, false)), "relabel");
        assert_ne!(name(join("one", BinaryOp::Div, true)), "relabel");
        assert_ne!(name(join("one", BinaryOp::Add, false)), "relabel");
        assert_ne!(name(join("almost", BinaryOp::Mul, false)), "relabel");
    }

    #[test]
    fn number_join_picks_the_tensor_side() {
        let g = optimized(
            Node::join(Node::Number(3.0), Node::map(Node::Symbol(0), UnaryOp::Neg), BinaryOp::Sub),
            &["tensor(k{})"],
            &HashMap::<String, Arc<dyn Value>>::new(),
        );
        match g.kind(g.root()) {
            NodeKind::JoinWithNumber { number_is_lhs: true, inplace: true, .. } => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(root_name(Node::join(Node::Symbol(0), Node::Symbol(1), BinaryOp::Add), &["double", "double"]), "join");
    }

    #[test]
    fn simple_join_overlaps() {
        let shapes = [
            ("tensor(x[2],y[3])", Overlap::Full),
            ("tensor(y[3])", Overlap::Inner),
            ("tensor(x[2])", Overlap::Outer),
        ];
        for (secondary, expected) in shapes {
            let g = optimized(
                Node::join(Node::Symbol(0), Node::Symbol(1), BinaryOp::Add),
                &["tensor(x[2],y[3])", secondary],
                &HashMap::<String, Arc<dyn Value>>::new(),
            );
            match g.kind(g.root()) {
                NodeKind::DenseSimpleJoin { overlap, primary_is_lhs: true, inplace: false, .. } => {
                    assert_eq!(*overlap, expected)
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        // y is in the middle of x,y,z
        assert_eq!(
            root_name(Node::join(Node::Symbol(0), Node::Symbol(1), BinaryOp::Add), &["tensor(x[2],y[3],z[2])", "tensor(y[3])"]),
            "join"
        );
    }

    #[test]
    fn simple_join_reuses_temporary() {
        let root = Node::join(Node::Symbol(0), Node::map(Node::Symbol(0), UnaryOp::Exp), BinaryOp::Sub);
        let g = optimized(root, &["tensor(x[4])"], &HashMap::<String, Arc<dyn Value>>::new());
        match g.kind(g.root()) {
            NodeKind::DenseSimpleJoin { primary_is_lhs: false, inplace: true, .. } => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
