//! Tensor lambdas that only gather cells of a bound dense parameter.
//!
//! `tensor(x[2],y[3])(m{a:y,b:(x+1)})` reads one cell of `m` per result cell,
//! at a position computed from the result cell's indices alone. That position
//! is folded into an index function, tabulated once per result type and
//! shared through the lookup-table cache.

use std::sync::Arc;

use crate::ast::{BinaryOp, Function, Node, PeekLabel, UnaryOp};
use crate::graph::{Graph, NodeId, NodeKind};
use crate::lookup_table::IndexLookupTable;
use crate::value::Label;

fn and(a: Node, b: Node) -> Node {
    Node::binary(BinaryOp::And, a, b)
}

/// `if(0 <= e_0 < n_0 && ..., floor(e_0)*s_0 + ..., -1)` over the result
/// cell's indices.
fn index_function(params: Vec<String>, exprs: Vec<(Node, u32)>) -> Function {
    let mut stride = 1.0;
    let mut offset: Option<Node> = None;
    let mut in_bounds: Option<Node> = None;
    for (expr, size) in exprs.into_iter().rev() {
        let check = and(
            Node::binary(BinaryOp::GreaterEqual, expr.clone(), Node::Number(0.0)),
            Node::binary(BinaryOp::Less, expr.clone(), Node::Number(size as f64)),
        );
        let term = Node::binary(BinaryOp::Mul, Node::unary(UnaryOp::Floor, expr), Node::Number(stride));
        offset = Some(match offset {
            Some(rest) => Node::binary(BinaryOp::Add, term, rest),
            None => term,
        });
        in_bounds = Some(match in_bounds {
            Some(rest) => and(check, rest),
            None => check,
        });
        stride *= size as f64;
    }
    let root = match (in_bounds, offset) {
        (Some(cond), Some(offset)) => Node::if_then_else(cond, offset, Node::Number(-1.0)),
        _ => Node::Number(0.0),
    };
    Function { params, root }
}

pub(super) fn dense_lambda_peek(graph: &Graph, id: NodeId) -> Option<NodeKind> {
    let NodeKind::Lambda { bindings, lambda, .. } = graph.kind(id) else {
        return None;
    };
    let ty = graph.result_type_of(id);
    let num_dims = ty.dimensions().len();
    let Node::Peek { child, spec } = &lambda.root else {
        return None;
    };
    let Node::Symbol(symbol) = **child else {
        return None;
    };
    let param = *bindings.get(symbol.checked_sub(num_dims)?)?;
    let source = graph.param_types().get(param)?;
    if !ty.is_dense() || !source.is_dense() || spec.len() != source.dimensions().len() {
        return None;
    }
    let mut exprs = Vec::with_capacity(spec.len());
    for dim in source.dimensions() {
        let (_, label) = spec.iter().find(|(name, _)| *name == dim.name)?;
        let expr = match label {
            PeekLabel::Label(Label::Indexed(i)) => Node::Number(*i as f64),
            PeekLabel::Expr(e) if e.is_scalar_only() && e.max_symbol().is_none_or(|s| s < num_dims) => e.clone(),
            _ => return None,
        };
        exprs.push((expr, dim.size));
    }
    let fun = Arc::new(index_function(lambda.params[..num_dims].to_vec(), exprs));
    let table = IndexLookupTable::create(&fun, ty);
    Some(NodeKind::DenseLambdaPeek { param, table })
}
