//! Typed expression graph.
//!
//! The graph owns every node in one arena; nodes refer to their children by
//! `NodeId`. Rewrites append new nodes and re-point parents, so ids stay
//! stable for the lifetime of the graph.

use std::fmt;
use std::sync::Arc;

use crate::ast::{Aggr, BinaryOp, Function, UnaryOp};
use crate::lookup_table::IndexLookupTable;
use crate::types::{CellType, ValueType};
use crate::value::{Label, TensorAddress, Value};

pub mod build;

pub use build::{ConstantResolver, NoConstants, TypeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---- Cell functions ----

/// Per-cell function of a map.
#[derive(Debug, Clone)]
pub enum MapFn {
    Op(UnaryOp),
    Lambda(Arc<Function>),
}

impl MapFn {
    pub fn from_lambda(lambda: &Arc<Function>) -> Self {
        match lambda.as_unary_op() {
            Some(op) => MapFn::Op(op),
            None => MapFn::Lambda(lambda.clone()),
        }
    }

    #[inline]
    pub fn apply(&self, a: f64) -> f64 {
        match self {
            MapFn::Op(op) => op.apply(a),
            MapFn::Lambda(fun) => crate::interpreter::eval_scalar(&fun.root, &[a]),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MapFn::Op(op) => op.name(),
            MapFn::Lambda(_) => "lambda",
        }
    }
}

/// Per-cell function of a join or merge.
#[derive(Debug, Clone)]
pub enum JoinFn {
    Op(BinaryOp),
    Lambda(Arc<Function>),
}

impl JoinFn {
    pub fn from_lambda(lambda: &Arc<Function>) -> Self {
        match lambda.as_binary_op() {
            Some(op) => JoinFn::Op(op),
            None => JoinFn::Lambda(lambda.clone()),
        }
    }

    #[inline]
    pub fn apply(&self, a: f64, b: f64) -> f64 {
        match self {
            JoinFn::Op(op) => op.apply(a, b),
            JoinFn::Lambda(fun) => crate::interpreter::eval_scalar(&fun.root, &[a, b]),
        }
    }

    pub fn is_op(&self, op: BinaryOp) -> bool {
        matches!(self, JoinFn::Op(o) if *o == op)
    }

    pub fn is_commutative(&self) -> bool {
        matches!(self, JoinFn::Op(op) if op.is_commutative())
    }

    pub fn name(&self) -> &'static str {
        match self {
            JoinFn::Op(op) => op.name(),
            JoinFn::Lambda(_) => "lambda",
        }
    }
}

/// How the secondary operand of a dense simple join lines up with the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    /// Same dimensions.
    Full,
    /// Secondary covers the innermost dimensions and repeats for each outer index.
    Inner,
    /// Secondary covers the outermost dimensions; each cell repeats over an inner block.
    Outer,
}

impl Overlap {
    pub fn name(self) -> &'static str {
        match self {
            Overlap::Full => "full",
            Overlap::Inner => "inner",
            Overlap::Outer => "outer",
        }
    }
}

#[derive(Debug, Clone)]
pub enum PeekTarget {
    Label(Label),
    /// Label computed by a scalar child node.
    Child(NodeId),
}

// ---- Nodes ----

#[derive(Debug, Clone)]
pub enum NodeKind {
    Const(Arc<dyn Value>),
    /// Parameter by position.
    Inject(usize),
    Reduce {
        child: NodeId,
        aggr: Aggr,
        dims: Vec<String>,
    },
    Map {
        child: NodeId,
        function: MapFn,
        inplace: bool,
    },
    MapSubspaces {
        child: NodeId,
        inner: Arc<Graph>,
    },
    Join {
        lhs: NodeId,
        rhs: NodeId,
        function: JoinFn,
    },
    Merge {
        lhs: NodeId,
        rhs: NodeId,
        function: JoinFn,
    },
    Concat {
        lhs: NodeId,
        rhs: NodeId,
        dim: String,
    },
    Rename {
        child: NodeId,
        from: Vec<String>,
        to: Vec<String>,
    },
    CellCast {
        child: NodeId,
        cell_type: CellType,
    },
    Create {
        cells: Vec<(TensorAddress, NodeId)>,
    },
    /// Dense tensor generated cell by cell. `inner` takes the cell index per
    /// dimension followed by the bound parameters.
    Lambda {
        bindings: Vec<usize>,
        lambda: Arc<Function>,
        inner: Arc<Graph>,
    },
    Peek {
        child: NodeId,
        spec: Vec<(String, PeekTarget)>,
    },
    If {
        cond: NodeId,
        true_child: NodeId,
        false_child: NodeId,
    },

    // ---- Specialized ----
    /// Same cells and index as the child under the result type.
    Relabel {
        child: NodeId,
    },
    /// `reduce(a*b,sum)` over identical dense shapes.
    DenseDotProduct {
        lhs: NodeId,
        rhs: NodeId,
    },
    /// Vector times matrix summed over their one common dimension.
    DenseXWProduct {
        vector: NodeId,
        matrix: NodeId,
        vector_size: usize,
        result_size: usize,
        common_inner: bool,
    },
    DenseMatMul {
        lhs: NodeId,
        rhs: NodeId,
        lhs_size: usize,
        common_size: usize,
        rhs_size: usize,
        lhs_common_inner: bool,
        rhs_common_inner: bool,
    },
    /// Mixed tensor times dense vector summed over the vector's dimensions.
    MixedInnerProduct {
        mixed: NodeId,
        vector: NodeId,
    },
    DenseSimpleJoin {
        lhs: NodeId,
        rhs: NodeId,
        function: JoinFn,
        primary_is_lhs: bool,
        overlap: Overlap,
        inplace: bool,
    },
    /// Join of a tensor with a 0-dimension scalar.
    JoinWithNumber {
        lhs: NodeId,
        rhs: NodeId,
        function: JoinFn,
        number_is_lhs: bool,
        inplace: bool,
    },
    /// Dense lambda whose cells are peeks into a bound dense parameter at
    /// positions precomputed in a shared table.
    DenseLambdaPeek {
        param: usize,
        table: IndexLookupTable,
    },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Const(_) => "const",
            NodeKind::Inject(_) => "inject",
            NodeKind::Reduce { .. } => "reduce",
            NodeKind::Map { .. } => "map",
            NodeKind::MapSubspaces { .. } => "map_subspaces",
            NodeKind::Join { .. } => "join",
            NodeKind::Merge { .. } => "merge",
            NodeKind::Concat { .. } => "concat",
            NodeKind::Rename { .. } => "rename",
            NodeKind::CellCast { .. } => "cell_cast",
            NodeKind::Create { .. } => "create",
            NodeKind::Lambda { .. } => "lambda",
            NodeKind::Peek { .. } => "peek",
            NodeKind::If { .. } => "if",
            NodeKind::Relabel { .. } => "relabel",
            NodeKind::DenseDotProduct { .. } => "dense_dot_product",
            NodeKind::DenseXWProduct { .. } => "dense_xw_product",
            NodeKind::DenseMatMul { .. } => "dense_matmul",
            NodeKind::MixedInnerProduct { .. } => "mixed_inner_product",
            NodeKind::DenseSimpleJoin { .. } => "dense_simple_join",
            NodeKind::JoinWithNumber { .. } => "join_with_number",
            NodeKind::DenseLambdaPeek { .. } => "dense_lambda_peek",
        }
    }

    /// Children in the order their results are pushed on the stack.
    pub fn children(&self) -> Vec<NodeId> {
        match self {
            NodeKind::Const(_) | NodeKind::Inject(_) | NodeKind::Lambda { .. } | NodeKind::DenseLambdaPeek { .. } => {
                Vec::new()
            }
            NodeKind::Reduce { child, .. }
            | NodeKind::Map { child, .. }
            | NodeKind::MapSubspaces { child, .. }
            | NodeKind::Rename { child, .. }
            | NodeKind::CellCast { child, .. }
            | NodeKind::Relabel { child } => vec![*child],
            NodeKind::Join { lhs, rhs, .. }
            | NodeKind::Merge { lhs, rhs, .. }
            | NodeKind::Concat { lhs, rhs, .. }
            | NodeKind::DenseDotProduct { lhs, rhs }
            | NodeKind::DenseMatMul { lhs, rhs, .. }
            | NodeKind::DenseSimpleJoin { lhs, rhs, .. }
            | NodeKind::JoinWithNumber { lhs, rhs, .. } => vec![*lhs, *rhs],
            NodeKind::DenseXWProduct { vector, matrix, .. } => vec![*vector, *matrix],
            NodeKind::MixedInnerProduct { mixed, vector } => vec![*mixed, *vector],
            NodeKind::Create { cells } => cells.iter().map(|(_, id)| *id).collect(),
            NodeKind::Peek { child, spec } => {
                let mut out = vec![*child];
                out.extend(spec.iter().filter_map(|(_, t)| match t {
                    PeekTarget::Child(id) => Some(*id),
                    PeekTarget::Label(_) => None,
                }));
                out
            }
            NodeKind::If { cond, true_child, false_child } => vec![*cond, *true_child, *false_child],
        }
    }

    /// Copy of this node with its children replaced, in `children()` order.
    pub fn with_children(&self, new: &[NodeId]) -> NodeKind {
        let mut kind = self.clone();
        let mut it = new.iter().copied();
        let mut next = || it.next().expect("with_children: too few children");
        match &mut kind {
            NodeKind::Const(_) | NodeKind::Inject(_) | NodeKind::Lambda { .. } | NodeKind::DenseLambdaPeek { .. } => {}
            NodeKind::Reduce { child, .. }
            | NodeKind::Map { child, .. }
            | NodeKind::MapSubspaces { child, .. }
            | NodeKind::Rename { child, .. }
            | NodeKind::CellCast { child, .. }
            | NodeKind::Relabel { child } => *child = next(),
            NodeKind::Join { lhs, rhs, .. }
            | NodeKind::Merge { lhs, rhs, .. }
            | NodeKind::Concat { lhs, rhs, .. }
            | NodeKind::DenseDotProduct { lhs, rhs }
            | NodeKind::DenseMatMul { lhs, rhs, .. }
            | NodeKind::DenseSimpleJoin { lhs, rhs, .. }
            | NodeKind::JoinWithNumber { lhs, rhs, .. } => {
                *lhs = next();
                *rhs = next();
            }
            NodeKind::DenseXWProduct { vector, matrix, .. } => {
                *vector = next();
                *matrix = next();
            }
            NodeKind::MixedInnerProduct { mixed, vector } => {
                *mixed = next();
                *vector = next();
            }
            NodeKind::Create { cells } => {
                for (_, id) in cells.iter_mut() {
                    *id = next();
                }
            }
            NodeKind::Peek { child, spec } => {
                *child = next();
                for (_, target) in spec.iter_mut() {
                    if let PeekTarget::Child(id) = target {
                        *id = next();
                    }
                }
            }
            NodeKind::If { cond, true_child, false_child } => {
                *cond = next();
                *true_child = next();
                *false_child = next();
            }
        }
        kind
    }

    /// Operands and function of any join, generic or specialized.
    pub fn as_join(&self) -> Option<(NodeId, NodeId, &JoinFn)> {
        match self {
            NodeKind::Join { lhs, rhs, function }
            | NodeKind::DenseSimpleJoin { lhs, rhs, function, .. }
            | NodeKind::JoinWithNumber { lhs, rhs, function, .. } => Some((*lhs, *rhs, function)),
            _ => None,
        }
    }

    pub fn is_specialized(&self) -> bool {
        matches!(
            self,
            NodeKind::Relabel { .. }
                | NodeKind::DenseDotProduct { .. }
                | NodeKind::DenseXWProduct { .. }
                | NodeKind::DenseMatMul { .. }
                | NodeKind::MixedInnerProduct { .. }
                | NodeKind::DenseSimpleJoin { .. }
                | NodeKind::JoinWithNumber { .. }
                | NodeKind::DenseLambdaPeek { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct TensorFunction {
    pub result_type: ValueType,
    pub kind: NodeKind,
}

// ---- Graph ----

#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<TensorFunction>,
    root: NodeId,
    param_types: Vec<ValueType>,
    errors: Vec<TypeError>,
}

impl Graph {
    pub(crate) fn from_parts(nodes: Vec<TensorFunction>, root: NodeId, param_types: Vec<ValueType>, errors: Vec<TypeError>) -> Self {
        Graph { nodes, root, param_types, errors }
    }

    pub fn node(&self, id: NodeId) -> &TensorFunction {
        &self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.index()].kind
    }

    pub fn result_type_of(&self, id: NodeId) -> &ValueType {
        &self.nodes[id.index()].result_type
    }

    pub fn push(&mut self, node: TensorFunction) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn set_root(&mut self, root: NodeId) {
        self.root = root;
    }

    pub fn result_type(&self) -> &ValueType {
        self.result_type_of(self.root)
    }

    pub fn param_types(&self) -> &[ValueType] {
        &self.param_types
    }

    pub fn errors(&self) -> &[TypeError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Arena size, including nodes no longer reachable from the root.
    pub fn arena_size(&self) -> usize {
        self.nodes.len()
    }

    /// True when the node's output buffer may be overwritten by its consumer.
    pub fn result_is_mutable(&self, id: NodeId) -> bool {
        match self.kind(id) {
            NodeKind::Const(_) | NodeKind::Inject(_) => false,
            NodeKind::Relabel { child } => self.result_is_mutable(*child),
            NodeKind::If { true_child, false_child, .. } => {
                self.result_is_mutable(*true_child) && self.result_is_mutable(*false_child)
            }
            _ => true,
        }
    }

    /// Reachable nodes, children before parents, each once.
    pub fn postorder(&self) -> Vec<NodeId> {
        let mut seen = vec![false; self.nodes.len()];
        let mut out = Vec::new();
        self.postorder_from(self.root, &mut seen, &mut out);
        out
    }

    fn postorder_from(&self, id: NodeId, seen: &mut [bool], out: &mut Vec<NodeId>) {
        if seen[id.index()] {
            return;
        }
        seen[id.index()] = true;
        for child in self.kind(id).children() {
            self.postorder_from(child, seen, out);
        }
        out.push(id);
    }

    pub fn count_reachable(&self) -> usize {
        self.postorder().len()
    }

    /// Reachable nodes matching the predicate, in postorder.
    pub fn find_reachable(&self, pred: impl Fn(&NodeKind) -> bool) -> Vec<NodeId> {
        self.postorder().into_iter().filter(|id| pred(self.kind(*id))).collect()
    }

    pub fn count_kind(&self, name: &str) -> usize {
        self.find_reachable(|k| k.name() == name).len()
    }
}
