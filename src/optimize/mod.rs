//! Rewrite passes over a built graph.
//!
//! `optimize` walks the reachable nodes children first. Each node is offered
//! to the passes for its kind in priority order; the first pass that matches
//! returns a replacement, which is appended to the arena and re-pointed from
//! the parent. A pass that does not match leaves the node alone, so a failed
//! match and "no rewrite needed" look the same. Every replacement has the
//! result type of the node it replaces.
//!
//! Running `optimize` on an already optimized graph applies nothing.

use std::sync::Arc;

use tracing::debug;

use crate::graph::{Graph, NodeId, NodeKind, TensorFunction};

mod join;
mod lambda;
mod reduce;

/// A pass: the replacement kind for `id`, or `None` when it does not apply.
type Pass = fn(&Graph, NodeId) -> Option<NodeKind>;

fn passes_for(kind: &NodeKind) -> &'static [(&'static str, Pass)] {
    match kind {
        NodeKind::Reduce { .. } => &[
            ("dense_dot_product", reduce::dense_dot_product),
            ("dense_xw_product", reduce::dense_xw_product),
            ("dense_matmul", reduce::dense_matmul),
            ("mixed_inner_product", reduce::mixed_inner_product),
            ("remove_trivial_dimensions", reduce::remove_trivial_dimensions),
        ],
        NodeKind::Join { .. } => &[
            ("unit_dimension_addition", join::unit_dimension_addition),
            ("join_with_number", join::join_with_number),
            ("dense_simple_join", join::dense_simple_join),
        ],
        NodeKind::Map { .. } => &[("inplace_map", inplace_map)],
        NodeKind::Rename { .. } => &[("rename_to_relabel", rename_to_relabel)],
        NodeKind::Lambda { .. } => &[("dense_lambda_peek", lambda::dense_lambda_peek), ("nested", nested)],
        NodeKind::MapSubspaces { .. } => &[("nested", nested)],
        _ => &[],
    }
}

/// Apply every matching rewrite; returns how many were applied.
pub fn optimize(graph: &mut Graph) -> usize {
    let mut remap: Vec<NodeId> = (0..graph.arena_size() as u32).map(NodeId).collect();
    let mut rewrites = 0;
    for id in graph.postorder() {
        let node = graph.node(id);
        let children = node.kind.children();
        let moved: Vec<NodeId> = children.iter().map(|c| remap[c.index()]).collect();
        let mut current = id;
        if moved != children {
            let copy = TensorFunction { result_type: node.result_type.clone(), kind: node.kind.with_children(&moved) };
            current = graph.push(copy);
        }
        for (name, pass) in passes_for(graph.kind(current)) {
            if let Some(kind) = pass(graph, current) {
                debug!(pass = *name, from = graph.kind(current).name(), to = kind.name(), "rewrite");
                let result_type = graph.result_type_of(current).clone();
                current = graph.push(TensorFunction { result_type, kind });
                rewrites += 1;
                break;
            }
        }
        remap[id.index()] = current;
    }
    let root = remap[graph.root().index()];
    graph.set_root(root);
    rewrites
}

// ---- Small passes ----

/// A map may overwrite its operand when nothing else can observe it.
fn inplace_map(graph: &Graph, id: NodeId) -> Option<NodeKind> {
    let NodeKind::Map { child, function, inplace: false } = graph.kind(id) else {
        return None;
    };
    let same_cells = graph.result_type_of(*child).cell_type() == graph.result_type_of(id).cell_type();
    if !same_cells || !graph.result_is_mutable(*child) {
        return None;
    }
    Some(NodeKind::Map { child: *child, function: function.clone(), inplace: true })
}

/// A rename that keeps every dimension in the same relative position only
/// changes the type.
fn rename_to_relabel(graph: &Graph, id: NodeId) -> Option<NodeKind> {
    let NodeKind::Rename { child, from, to } = graph.kind(id) else {
        return None;
    };
    let renamed: Vec<&str> = graph
        .result_type_of(*child)
        .dimensions()
        .iter()
        .map(|d| from.iter().position(|f| *f == d.name).map_or(d.name.as_str(), |i| to[i].as_str()))
        .collect();
    if !renamed.windows(2).all(|w| w[0] < w[1]) {
        return None;
    }
    Some(NodeKind::Relabel { child: *child })
}

/// Optimize the graph of a nested function.
fn nested(graph: &Graph, id: NodeId) -> Option<NodeKind> {
    let optimized = |inner: &Arc<Graph>| {
        let mut copy = (**inner).clone();
        (optimize(&mut copy) > 0).then(|| Arc::new(copy))
    };
    match graph.kind(id) {
        NodeKind::MapSubspaces { child, inner } => {
            Some(NodeKind::MapSubspaces { child: *child, inner: optimized(inner)? })
        }
        NodeKind::Lambda { bindings, lambda, inner } => {
            Some(NodeKind::Lambda { bindings: bindings.clone(), lambda: lambda.clone(), inner: optimized(inner)? })
        }
        _ => None,
    }
}
