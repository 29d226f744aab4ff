//! Human-readable and JSON renderings of a graph, for debugging.
//!
//! ```text
//! reduce sum(y) : tensor(x[2])
//!   join mul : tensor(x[2],y[3])
//!     inject 0 : tensor(x[2],y[3])
//!     inject 1 : tensor(y[3])
//! ```

use std::fmt::Write;

use serde_json::{Value as Json, json};

use crate::graph::{Graph, NodeId, NodeKind, PeekTarget};

/// Key parameters of a node, as shown after its kind.
fn describe(kind: &NodeKind) -> String {
    match kind {
        NodeKind::Const(value) => value.value_type().to_spec(),
        NodeKind::Inject(param) => param.to_string(),
        NodeKind::Reduce { aggr, dims, .. } => format!("{}({})", aggr.name(), dims.join(",")),
        NodeKind::Map { function, inplace, .. } => {
            if *inplace { format!("{} inplace", function.name()) } else { function.name().to_string() }
        }
        NodeKind::Join { function, .. } | NodeKind::Merge { function, .. } => function.name().to_string(),
        NodeKind::Concat { dim, .. } => dim.clone(),
        NodeKind::Rename { from, to, .. } => format!("({}) -> ({})", from.join(","), to.join(",")),
        NodeKind::CellCast { cell_type, .. } => cell_type.name().to_string(),
        NodeKind::Create { cells } => format!("{} cells", cells.len()),
        NodeKind::Lambda { bindings, .. } => format!("bindings {:?}", bindings),
        NodeKind::Peek { spec, .. } => {
            let dims: Vec<String> = spec
                .iter()
                .map(|(dim, target)| match target {
                    PeekTarget::Label(label) => format!("{dim}:{label}"),
                    PeekTarget::Child(_) => format!("{dim}:(expr)"),
                })
                .collect();
            format!("{{{}}}", dims.join(","))
        }
        NodeKind::DenseXWProduct { vector_size, result_size, common_inner, .. } => {
            format!("{vector_size}x{result_size} common_inner={common_inner}")
        }
        NodeKind::DenseMatMul { lhs_size, common_size, rhs_size, lhs_common_inner, rhs_common_inner, .. } => {
            format!("{lhs_size}x{common_size}x{rhs_size} inner=({lhs_common_inner},{rhs_common_inner})")
        }
        NodeKind::DenseSimpleJoin { function, primary_is_lhs, overlap, inplace, .. } => format!(
            "{} primary={} overlap={}{}",
            function.name(),
            if *primary_is_lhs { "lhs" } else { "rhs" },
            overlap.name(),
            if *inplace { " inplace" } else { "" }
        ),
        NodeKind::JoinWithNumber { function, number_is_lhs, inplace, .. } => format!(
            "{} number={}{}",
            function.name(),
            if *number_is_lhs { "lhs" } else { "rhs" },
            if *inplace { " inplace" } else { "" }
        ),
        NodeKind::DenseLambdaPeek { param, table } => format!("param {} table {}", param, table.table().len()),
        NodeKind::MapSubspaces { .. }
        | NodeKind::If { .. }
        | NodeKind::Relabel { .. }
        | NodeKind::DenseDotProduct { .. }
        | NodeKind::MixedInnerProduct { .. } => String::new(),
    }
}

fn nested(kind: &NodeKind) -> Option<&Graph> {
    match kind {
        NodeKind::MapSubspaces { inner, .. } | NodeKind::Lambda { inner, .. } => Some(inner),
        _ => None,
    }
}

fn dump_node(graph: &Graph, id: NodeId, depth: usize, out: &mut String) {
    let node = graph.node(id);
    let params = describe(&node.kind);
    let pad = "  ".repeat(depth);
    let _ = write!(out, "{pad}{}", node.kind.name());
    if !params.is_empty() {
        let _ = write!(out, " {params}");
    }
    let _ = writeln!(out, " : {}", node.result_type);
    if let Some(inner) = nested(&node.kind) {
        let _ = writeln!(out, "{pad}  | inner");
        dump_node(inner, inner.root(), depth + 2, out);
    }
    for child in node.kind.children() {
        dump_node(graph, child, depth + 1, out);
    }
}

/// Indented tree from the root, one node per line.
pub fn dump_graph(graph: &Graph) -> String {
    let mut out = String::new();
    dump_node(graph, graph.root(), 0, &mut out);
    out
}

fn node_json(graph: &Graph, id: NodeId) -> Json {
    let node = graph.node(id);
    let children: Vec<Json> = node.kind.children().into_iter().map(|c| node_json(graph, c)).collect();
    let mut obj = json!({
        "kind": node.kind.name(),
        "params": describe(&node.kind),
        "type": node.result_type.to_spec(),
        "specialized": node.kind.is_specialized(),
        "children": children,
    });
    if let Some(inner) = nested(&node.kind) {
        obj["inner"] = node_json(inner, inner.root());
    }
    obj
}

/// The same tree as `dump_graph`, as JSON.
pub fn dump_json(graph: &Graph) -> Json {
    node_json(graph, graph.root())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Aggr, BinaryOp, Function, Node};
    use crate::graph::NoConstants;
    use crate::optimize::optimize;
    use crate::types::ValueType;

    fn graph() -> Graph {
        let root = Node::reduce(Node::join(Node::Symbol(0), Node::Symbol(1), BinaryOp::Mul), Aggr::Sum, &["y"]);
        let types = [ValueType::from_spec("tensor(x[2],y[3])"), ValueType::from_spec("tensor(y[3])")];
        Graph::build(&Function::new(&["a", "b"], root), &types, &NoConstants)
    }

    #[test]
    fn tree_lists_kinds_params_and_types() {
        let text = dump_graph(&graph());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "reduce sum(y) : tensor(x[2])",
                "  join mul : tensor(x[2],y[3])",
                "    inject 0 : tensor(x[2],y[3])",
                "    inject 1 : tensor(y[3])",
            ]
        );
    }

    #[test]
    fn optimized_tree_shows_kernel() {
        let mut g = graph();
        optimize(&mut g);
        let text = dump_graph(&g);
        assert!(text.starts_with("dense_xw_product 3x2 common_inner=true : tensor(x[2])"), "{text}");
    }

    #[test]
    fn json_mirrors_tree() {
        let v = dump_json(&graph());
        assert_eq!(v["kind"], "reduce");
        assert_eq!(v["specialized"], false);
        assert_eq!(v["children"][0]["children"][1]["type"], "tensor(y[3])");
    }
}
