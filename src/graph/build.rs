//! Graph construction with shape inference.
//!
//! Every node gets its `ValueType` while the graph is built. Conflicts give the
//! sticky error type and are recorded, but building continues so all of them
//! surface at once. Only the first failure in a chain is reported; nodes
//! downstream of an error type are silently poisoned.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{Graph, JoinFn, MapFn, NodeId, NodeKind, PeekTarget, TensorFunction};
use crate::ast::{Function, Node, PeekLabel};
use crate::types::ValueType;
use crate::value::{
    DoubleValue, ErrorValue, FastValueBuilderFactory, Label, TensorAddress, TensorSpec, Value, value_from_spec,
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{op}: {message}")]
pub struct TypeError {
    pub op: &'static str,
    pub message: String,
    pub hint: Option<String>,
}

/// Supplies named constants (`constant(name)`) while the graph is built.
pub trait ConstantResolver {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Value>>;

    /// Known names, used for suggestions on a miss.
    fn names(&self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoConstants;

impl ConstantResolver for NoConstants {
    fn resolve(&self, _name: &str) -> Option<Arc<dyn Value>> {
        None
    }
}

impl ConstantResolver for HashMap<String, Arc<dyn Value>> {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Value>> {
        self.get(name).cloned()
    }

    fn names(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }
}

fn closest_match<'a>(name: &str, candidates: impl Iterator<Item = &'a String>) -> Option<String> {
    let mut best: Option<(String, usize)> = None;
    for candidate in candidates {
        let dist = levenshtein(name, candidate);
        if dist <= 2 && best.as_ref().is_none_or(|(_, d)| dist < *d) {
            best = Some((candidate.clone(), dist));
        }
    }
    best.map(|(s, _)| s)
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (m, n) = (a.len(), b.len());
    let mut dp = vec![vec![0usize; n + 1]; m + 1];
    for (i, row) in dp.iter_mut().enumerate().take(m + 1) {
        row[0] = i;
    }
    for (j, val) in dp[0].iter_mut().enumerate().take(n + 1) {
        *val = j;
    }
    for i in 1..=m {
        for j in 1..=n {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            dp[i][j] = (dp[i - 1][j] + 1).min(dp[i][j - 1] + 1).min(dp[i - 1][j - 1] + cost);
        }
    }
    dp[m][n]
}

struct Builder<'r> {
    nodes: Vec<TensorFunction>,
    param_types: Vec<ValueType>,
    resolver: &'r dyn ConstantResolver,
    errors: Vec<TypeError>,
}

impl Graph {
    /// Build the typed graph for `function` given its parameter types.
    /// Never fails: type errors are recorded and a root of error type
    /// collapses the graph to a single error constant.
    pub fn build(function: &Function, param_types: &[ValueType], resolver: &dyn ConstantResolver) -> Graph {
        let mut builder = Builder { nodes: Vec::new(), param_types: param_types.to_vec(), resolver, errors: Vec::new() };
        if function.num_params() != param_types.len() {
            builder.error(
                "function",
                format!("expected {} parameter types, got {}", function.num_params(), param_types.len()),
                None,
            );
        }
        let root = builder.build_node(&function.root);
        if builder.nodes[root.index()].result_type.is_error() || function.num_params() != param_types.len() {
            if builder.errors.is_empty() {
                builder.error("function", "result has error type".into(), None);
            }
            debug!(errors = builder.errors.len(), "tensor function collapsed to error");
            let mut graph = Graph::error_graph(builder.param_types);
            graph.errors = builder.errors;
            return graph;
        }
        debug!(nodes = builder.nodes.len(), "built tensor function graph");
        Graph::from_parts(builder.nodes, root, builder.param_types, Vec::new())
    }

    /// A graph whose only node is the error sentinel.
    pub fn error_graph(param_types: Vec<ValueType>) -> Graph {
        let node = TensorFunction { result_type: ValueType::error_type(), kind: NodeKind::Const(Arc::new(ErrorValue::new())) };
        Graph::from_parts(vec![node], NodeId(0), param_types, Vec::new())
    }
}

impl Builder<'_> {
    fn push(&mut self, result_type: ValueType, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(TensorFunction { result_type, kind });
        id
    }

    fn ty(&self, id: NodeId) -> &ValueType {
        &self.nodes[id.index()].result_type
    }

    fn error(&mut self, op: &'static str, message: String, hint: Option<String>) {
        self.errors.push(TypeError { op, message, hint });
    }

    /// Result type with error reporting: only the first failure in a chain is reported.
    fn checked(&mut self, op: &'static str, inputs: &[NodeId], ty: ValueType, message: impl FnOnce() -> String) -> ValueType {
        if ty.is_error() && inputs.iter().all(|id| !self.ty(*id).is_error()) {
            let msg = message();
            self.error(op, msg, None);
        }
        ty
    }

    fn constant(&mut self, value: Arc<dyn Value>) -> NodeId {
        let ty = value.value_type().clone();
        self.push(ty, NodeKind::Const(value))
    }

    fn const_double(&self, id: NodeId) -> Option<f64> {
        match &self.nodes[id.index()].kind {
            NodeKind::Const(v) if v.value_type().is_double() => Some(v.as_double()),
            _ => None,
        }
    }

    fn dimension_hint(&self, child: NodeId, dims: &[String]) -> Option<String> {
        let names: Vec<String> = self.ty(child).dimensions().iter().map(|d| d.name.clone()).collect();
        dims.iter()
            .filter(|d| !names.contains(d))
            .find_map(|d| closest_match(d, names.iter()).map(|m| format!("did you mean '{}' instead of '{}'?", m, d)))
    }

    fn build_node(&mut self, node: &Node) -> NodeId {
        match node {
            Node::Number(v) => self.constant(Arc::new(DoubleValue::new(*v))),
            Node::Symbol(i) => match self.param_types.get(*i).cloned() {
                Some(ty) => self.push(ty, NodeKind::Inject(*i)),
                None => {
                    self.error("symbol", format!("parameter {} out of range ({} parameters)", i, self.param_types.len()), None);
                    self.push(ValueType::error_type(), NodeKind::Inject(*i))
                }
            },
            Node::Constant(name) => match self.resolver.resolve(name) {
                Some(value) => self.constant(value),
                None => {
                    let known = self.resolver.names();
                    let hint = closest_match(name, known.iter()).map(|m| format!("did you mean '{}'?", m));
                    self.error("constant", format!("unknown constant '{}'", name), hint);
                    self.constant(Arc::new(ErrorValue::new()))
                }
            },
            Node::Unary { op, child } => {
                let child = self.build_node(child);
                if let Some(v) = self.const_double(child) {
                    return self.constant(Arc::new(DoubleValue::new(op.apply(v))));
                }
                let ty = self.ty(child).map();
                self.push(ty, NodeKind::Map { child, function: MapFn::Op(*op), inplace: false })
            }
            Node::Binary { op, lhs, rhs } => {
                let lhs = self.build_node(lhs);
                let rhs = self.build_node(rhs);
                if let (Some(a), Some(b)) = (self.const_double(lhs), self.const_double(rhs)) {
                    return self.constant(Arc::new(DoubleValue::new(op.apply(a, b))));
                }
                let ty = ValueType::join(self.ty(lhs), self.ty(rhs));
                let (lt, rt) = (self.ty(lhs).clone(), self.ty(rhs).clone());
                let ty = self.checked("join", &[lhs, rhs], ty, || format!("incompatible operands {} and {}", lt, rt));
                self.push(ty, NodeKind::Join { lhs, rhs, function: JoinFn::Op(*op) })
            }
            Node::If { cond, true_expr, false_expr } => {
                let cond = self.build_node(cond);
                let true_child = self.build_node(true_expr);
                let false_child = self.build_node(false_expr);
                if let Some(c) = self.const_double(cond) {
                    return if c != 0.0 { true_child } else { false_child };
                }
                let mut ty = ValueType::either(self.ty(true_child), self.ty(false_child));
                if self.ty(cond).is_error() {
                    ty = ValueType::error_type();
                }
                let (tt, ft) = (self.ty(true_child).clone(), self.ty(false_child).clone());
                let ty = self.checked("if", &[cond, true_child, false_child], ty, || {
                    format!("branches have different types {} and {}", tt, ft)
                });
                self.push(ty, NodeKind::If { cond, true_child, false_child })
            }
            Node::Map { child, lambda } => {
                let child = self.build_node(child);
                let mut ty = self.ty(child).map();
                if !is_scalar_lambda(lambda, 1) {
                    self.error("map", "lambda must be a scalar function of one parameter".into(), None);
                    ty = ValueType::error_type();
                }
                self.push(ty, NodeKind::Map { child, function: MapFn::from_lambda(lambda), inplace: false })
            }
            Node::Join { lhs, rhs, lambda } | Node::Merge { lhs, rhs, lambda } => {
                let is_join = matches!(node, Node::Join { .. });
                let op = if is_join { "join" } else { "merge" };
                let lhs = self.build_node(lhs);
                let rhs = self.build_node(rhs);
                let (lt, rt) = (self.ty(lhs).clone(), self.ty(rhs).clone());
                let ty = if is_join { ValueType::join(&lt, &rt) } else { ValueType::merge(&lt, &rt) };
                let mut ty = self.checked(op, &[lhs, rhs], ty, || format!("incompatible operands {} and {}", lt, rt));
                if !is_scalar_lambda(lambda, 2) {
                    self.error(op, "lambda must be a scalar function of two parameters".into(), None);
                    ty = ValueType::error_type();
                }
                let function = JoinFn::from_lambda(lambda);
                let kind = if is_join {
                    NodeKind::Join { lhs, rhs, function }
                } else {
                    NodeKind::Merge { lhs, rhs, function }
                };
                self.push(ty, kind)
            }
            Node::Reduce { child, aggr, dims } => {
                let child = self.build_node(child);
                let ty = self.ty(child).reduce(dims);
                if ty.is_error() && !self.ty(child).is_error() {
                    let hint = self.dimension_hint(child, dims);
                    let message = format!("cannot reduce {} over {:?}", self.ty(child), dims);
                    self.error("reduce", message, hint);
                }
                self.push(ty, NodeKind::Reduce { child, aggr: *aggr, dims: dims.clone() })
            }
            Node::Rename { child, from, to } => {
                let child = self.build_node(child);
                let ty = self.ty(child).rename(from, to);
                if ty.is_error() && !self.ty(child).is_error() {
                    let hint = self.dimension_hint(child, from);
                    let message = format!("cannot rename {:?} to {:?} in {}", from, to, self.ty(child));
                    self.error("rename", message, hint);
                }
                self.push(ty, NodeKind::Rename { child, from: from.clone(), to: to.clone() })
            }
            Node::Concat { lhs, rhs, dim } => {
                let lhs = self.build_node(lhs);
                let rhs = self.build_node(rhs);
                let (lt, rt) = (self.ty(lhs).clone(), self.ty(rhs).clone());
                let ty = ValueType::concat(&lt, &rt, dim);
                let ty = self.checked("concat", &[lhs, rhs], ty, || format!("cannot concat {} and {} along '{}'", lt, rt, dim));
                self.push(ty, NodeKind::Concat { lhs, rhs, dim: dim.clone() })
            }
            Node::CellCast { child, cell_type } => {
                let child = self.build_node(child);
                let from = self.ty(child).clone();
                let ty = from.cell_cast(*cell_type);
                let ty = self.checked("cell_cast", &[child], ty, || format!("cannot cast {} to {}", from, cell_type));
                self.push(ty, NodeKind::CellCast { child, cell_type: *cell_type })
            }
            Node::Create { value_type, cells } => self.build_create(value_type, cells),
            Node::Lambda { value_type, bindings, lambda } => self.build_lambda(node, value_type, bindings, lambda),
            Node::Peek { child, spec } => self.build_peek(child, spec),
            Node::MapSubspaces { child, lambda } => {
                let child = self.build_node(child);
                let outer = self.ty(child).clone();
                if outer.is_error() {
                    let inner = Arc::new(Graph::error_graph(vec![ValueType::error_type()]));
                    return self.push(ValueType::error_type(), NodeKind::MapSubspaces { child, inner });
                }
                let inner = Graph::build(lambda, &[outer.dense_subspace_type()], self.resolver);
                self.errors.extend(inner.errors().iter().cloned());
                let ty = ValueType::map_subspaces(&outer, inner.result_type());
                if ty.is_error() && !inner.result_type().is_error() {
                    self.error(
                        "map_subspaces",
                        format!("lambda result {} cannot be placed in subspaces of {}", inner.result_type(), outer),
                        None,
                    );
                }
                self.push(ty, NodeKind::MapSubspaces { child, inner: Arc::new(inner) })
            }
        }
    }

    fn build_create(&mut self, value_type: &ValueType, cells: &[(TensorAddress, Node)]) -> NodeId {
        let mut ty = value_type.clone();
        if ty.is_error() {
            self.error("create", "tensor type is invalid".into(), None);
        }
        let mut children = Vec::with_capacity(cells.len());
        for (address, expr) in cells {
            let id = self.build_node(expr);
            if !self.ty(id).is_double() {
                if !self.ty(id).is_error() {
                    self.error("create", format!("cell expression must be a number, got {}", self.ty(id)), None);
                }
                ty = ValueType::error_type();
            }
            if !ty.is_error() && !address_fits(&ty, address) {
                self.error("create", format!("address {:?} does not fit {}", address, ty), None);
                ty = ValueType::error_type();
            }
            children.push((canonical_address(&ty, address), id));
        }
        if ty.is_error() {
            return self.push(ty, NodeKind::Create { cells: children });
        }
        let folded: Option<Vec<f64>> = children.iter().map(|(_, id)| self.const_double(*id)).collect();
        if let Some(values) = folded {
            let mut spec = TensorSpec::new(ty.clone());
            for ((address, _), v) in children.iter().zip(values) {
                spec.add(address.clone(), v);
            }
            return self.constant(Arc::from(value_from_spec(&spec, &FastValueBuilderFactory)));
        }
        self.push(ty, NodeKind::Create { cells: children })
    }

    fn build_lambda(&mut self, node: &Node, value_type: &ValueType, bindings: &[usize], lambda: &Arc<Function>) -> NodeId {
        let num_dims = value_type.dimensions().len();
        let mut inner_types = vec![ValueType::double_type(); num_dims];
        let mut ok = value_type.is_dense();
        if !ok {
            self.error("lambda", format!("generated tensor must be dense, got {}", value_type), None);
        }
        if lambda.num_params() != num_dims + bindings.len() {
            self.error(
                "lambda",
                format!("lambda takes {} parameters, expected {}", lambda.num_params(), num_dims + bindings.len()),
                None,
            );
            ok = false;
        }
        for b in bindings {
            match self.param_types.get(*b) {
                Some(t) if !t.is_error() => inner_types.push(t.clone()),
                Some(_) => ok = false,
                None => {
                    self.error("lambda", format!("binding {} out of range", b), None);
                    ok = false;
                }
            }
        }
        if !ok {
            let inner = Arc::new(Graph::error_graph(inner_types));
            return self.push(ValueType::error_type(), NodeKind::Lambda { bindings: bindings.to_vec(), lambda: lambda.clone(), inner });
        }
        let inner = Graph::build(lambda, &inner_types, self.resolver);
        self.errors.extend(inner.errors().iter().cloned());
        if !inner.result_type().is_double() {
            if !inner.result_type().is_error() {
                self.error("lambda", format!("cell expression must be a number, got {}", inner.result_type()), None);
            }
            return self.push(ValueType::error_type(), NodeKind::Lambda { bindings: bindings.to_vec(), lambda: lambda.clone(), inner: Arc::new(inner) });
        }
        if bindings.is_empty() {
            let standalone = Function { params: Vec::new(), root: node.clone() };
            let spec = crate::interpreter::evaluate(&standalone, &[], self.resolver);
            return self.constant(Arc::from(value_from_spec(&spec, &FastValueBuilderFactory)));
        }
        self.push(value_type.clone(), NodeKind::Lambda { bindings: bindings.to_vec(), lambda: lambda.clone(), inner: Arc::new(inner) })
    }

    fn build_peek(&mut self, child: &Node, spec: &[(String, PeekLabel)]) -> NodeId {
        let child = self.build_node(child);
        let child_type = self.ty(child).clone();
        let dims: Vec<String> = spec.iter().map(|(d, _)| d.clone()).collect();
        let mut ty = child_type.peek(&dims);
        if ty.is_error() && !child_type.is_error() {
            let hint = self.dimension_hint(child, &dims);
            self.error("peek", format!("cannot peek {:?} in {}", dims, child_type), hint);
        }
        let mut targets = Vec::with_capacity(spec.len());
        for (dim, label) in spec {
            let target = match label {
                PeekLabel::Label(l) => {
                    if let (Label::Mapped(s), Some(d)) = (l, child_type.dimension(dim)) {
                        if d.is_indexed() {
                            self.error("peek", format!("label '{}' given for indexed dimension '{}'", s, dim), None);
                            ty = ValueType::error_type();
                        }
                    }
                    PeekTarget::Label(l.clone())
                }
                PeekLabel::Expr(expr) => {
                    let id = self.build_node(expr);
                    if !self.ty(id).is_double() {
                        if !self.ty(id).is_error() {
                            self.error("peek", format!("label expression must be a number, got {}", self.ty(id)), None);
                        }
                        ty = ValueType::error_type();
                    }
                    PeekTarget::Child(id)
                }
            };
            targets.push((dim.clone(), target));
        }
        self.push(ty, NodeKind::Peek { child, spec: targets })
    }
}

pub(crate) fn is_scalar_lambda(lambda: &Function, num_params: usize) -> bool {
    lambda.num_params() == num_params
        && lambda.root.is_scalar_only()
        && lambda.root.max_symbol().is_none_or(|m| m < num_params)
}

/// Integer labels given for mapped dimensions become their string form.
fn canonical_address(ty: &ValueType, address: &TensorAddress) -> TensorAddress {
    address
        .iter()
        .map(|(dim, label)| match (label, ty.dimension(dim)) {
            (Label::Indexed(i), Some(d)) if d.is_mapped() => (dim.clone(), Label::Mapped(i.to_string())),
            _ => (dim.clone(), label.clone()),
        })
        .collect()
}

pub(crate) fn address_fits(ty: &ValueType, address: &TensorAddress) -> bool {
    let dims = ty.dimensions();
    address.len() == dims.len()
        && dims.iter().all(|d| match address.get(&d.name) {
            Some(Label::Mapped(_)) => d.is_mapped(),
            Some(Label::Indexed(i)) => d.is_mapped() || (*i as u64) < d.size as u64,
            None => false,
        })
}
