//! Reference evaluator.
//!
//! Walks the AST directly over `TensorSpec` values with plain address maps:
//! no graph, no optimizer, no kernels. Slow, but simple enough to serve as
//! the ground truth the compiled path is tested against.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ast::{Aggr, Function, Node, PeekLabel};
use crate::graph::ConstantResolver;
use crate::graph::build::is_scalar_lambda;
use crate::types::ValueType;
use crate::value::spec::for_each_dense_address;
use crate::value::{Label, TensorAddress, TensorSpec, spec_from_value};

/// Evaluate a scalar-only expression (numbers, parameters, scalar operators,
/// `if`). Anything else, or a missing parameter, evaluates to NaN.
pub fn eval_scalar(node: &Node, args: &[f64]) -> f64 {
    match node {
        Node::Number(v) => *v,
        Node::Symbol(i) => args.get(*i).copied().unwrap_or(f64::NAN),
        Node::Unary { op, child } => op.apply(eval_scalar(child, args)),
        Node::Binary { op, lhs, rhs } => op.apply(eval_scalar(lhs, args), eval_scalar(rhs, args)),
        Node::If { cond, true_expr, false_expr } => {
            if eval_scalar(cond, args) != 0.0 {
                eval_scalar(true_expr, args)
            } else {
                eval_scalar(false_expr, args)
            }
        }
        _ => f64::NAN,
    }
}

/// Evaluate `function` over the given parameters.
pub fn evaluate(function: &Function, params: &[TensorSpec], constants: &dyn ConstantResolver) -> TensorSpec {
    if function.num_params() != params.len() {
        return TensorSpec::error();
    }
    let normalized: Vec<TensorSpec> = params.iter().map(TensorSpec::normalize).collect();
    let ctx = Context { params: &normalized, constants };
    ctx.eval(&function.root)
}

struct Context<'a> {
    params: &'a [TensorSpec],
    constants: &'a dyn ConstantResolver,
}

fn finish(ty: ValueType, cells: BTreeMap<TensorAddress, f64>) -> TensorSpec {
    if ty.is_error() {
        return TensorSpec::error();
    }
    let mut spec = TensorSpec::new(ty);
    for (address, value) in cells {
        spec.add(address, value);
    }
    spec.normalize()
}

/// True when both addresses agree on every dimension they share.
fn compatible(a: &TensorAddress, b: &TensorAddress, skip: Option<&str>) -> bool {
    a.iter().all(|(dim, label)| Some(dim.as_str()) == skip || b.get(dim).is_none_or(|other| other == label))
}

fn mapped_label(dim: &str, ty: &ValueType, label: &Label) -> Option<Label> {
    match (label, ty.dimension(dim)) {
        (Label::Indexed(i), Some(d)) if d.is_mapped() => Some(Label::Mapped(i.to_string())),
        (l, Some(_)) => Some(l.clone()),
        (_, None) => None,
    }
}

/// String label selected by a computed mapped-dimension peek.
pub fn label_from_number(v: f64) -> String {
    (v as i64).to_string()
}

/// Index selected by a computed indexed-dimension peek, if in bounds.
pub fn index_from_number(v: f64, size: u32) -> Option<usize> {
    if v >= 0.0 && v < size as f64 { Some(v.floor() as usize) } else { None }
}

impl Context<'_> {
    fn eval(&self, node: &Node) -> TensorSpec {
        match node {
            Node::Number(v) => TensorSpec::from_double(*v),
            Node::Symbol(i) => self.params.get(*i).cloned().unwrap_or_else(TensorSpec::error),
            Node::Constant(name) => match self.constants.resolve(name) {
                Some(value) => spec_from_value(value.as_ref()).normalize(),
                None => TensorSpec::error(),
            },
            Node::Unary { op, child } => {
                let a = self.eval(child);
                self.map(&a, |v| op.apply(v))
            }
            Node::Binary { op, lhs, rhs } => {
                let (a, b) = (self.eval(lhs), self.eval(rhs));
                join(&a, &b, |x, y| op.apply(x, y))
            }
            Node::If { cond, true_expr, false_expr } => {
                let c = self.eval(cond);
                let t = self.eval(true_expr);
                let f = self.eval(false_expr);
                let ty = ValueType::either(t.value_type(), f.value_type());
                if ty.is_error() || c.value_type().is_error() {
                    return TensorSpec::error();
                }
                if c.as_double() != 0.0 { t } else { f }
            }
            Node::Map { child, lambda } => {
                if !is_scalar_lambda(lambda, 1) {
                    return TensorSpec::error();
                }
                let a = self.eval(child);
                self.map(&a, |v| eval_scalar(&lambda.root, &[v]))
            }
            Node::Join { lhs, rhs, lambda } => {
                if !is_scalar_lambda(lambda, 2) {
                    return TensorSpec::error();
                }
                let (a, b) = (self.eval(lhs), self.eval(rhs));
                join(&a, &b, |x, y| eval_scalar(&lambda.root, &[x, y]))
            }
            Node::Merge { lhs, rhs, lambda } => {
                if !is_scalar_lambda(lambda, 2) {
                    return TensorSpec::error();
                }
                let (a, b) = (self.eval(lhs), self.eval(rhs));
                merge(&a, &b, |x, y| eval_scalar(&lambda.root, &[x, y]))
            }
            Node::Reduce { child, aggr, dims } => reduce(&self.eval(child), *aggr, dims),
            Node::Rename { child, from, to } => rename(&self.eval(child), from, to),
            Node::Concat { lhs, rhs, dim } => concat(&self.eval(lhs), &self.eval(rhs), dim),
            Node::CellCast { child, cell_type } => {
                let a = self.eval(child);
                let ty = a.value_type().cell_cast(*cell_type);
                finish(ty, a.cells().clone())
            }
            Node::Create { value_type, cells } => {
                let mut out = BTreeMap::new();
                for (address, expr) in cells {
                    let v = self.eval(expr);
                    if !v.value_type().is_double() {
                        return TensorSpec::error();
                    }
                    let mut canonical = TensorAddress::new();
                    for (dim, label) in address {
                        match mapped_label(dim, value_type, label) {
                            Some(l) => canonical.insert(dim.clone(), l),
                            None => return TensorSpec::error(),
                        };
                    }
                    out.insert(canonical, v.as_double());
                }
                finish(value_type.clone(), out)
            }
            Node::Lambda { value_type, bindings, lambda } => self.lambda(value_type, bindings, lambda),
            Node::Peek { child, spec } => self.peek(child, spec),
            Node::MapSubspaces { child, lambda } => self.map_subspaces(&self.eval(child), lambda),
        }
    }

    fn map(&self, a: &TensorSpec, f: impl Fn(f64) -> f64) -> TensorSpec {
        let ty = a.value_type().map();
        finish(ty, a.cells().iter().map(|(k, v)| (k.clone(), f(*v))).collect())
    }

    fn lambda(&self, value_type: &ValueType, bindings: &[usize], lambda: &Arc<Function>) -> TensorSpec {
        if !value_type.is_dense() || lambda.num_params() != value_type.dimensions().len() + bindings.len() {
            return TensorSpec::error();
        }
        let mut bound = Vec::with_capacity(bindings.len());
        for b in bindings {
            match self.params.get(*b) {
                Some(p) => bound.push(p.clone()),
                None => return TensorSpec::error(),
            }
        }
        let dims: Vec<(String, usize)> =
            value_type.dimensions().iter().map(|d| (d.name.clone(), d.size as usize)).collect();
        let mut cells = BTreeMap::new();
        let mut failed = false;
        for_each_dense_address(&dims, |dense| {
            let mut args: Vec<TensorSpec> = dense.iter().map(|(_, i)| TensorSpec::from_double(*i as f64)).collect();
            args.extend(bound.iter().cloned());
            let v = evaluate(lambda, &args, self.constants);
            if !v.value_type().is_double() {
                failed = true;
            }
            let address = dense.iter().map(|(d, i)| (d.clone(), Label::Indexed(*i))).collect();
            cells.insert(address, v.as_double());
        });
        if failed {
            return TensorSpec::error();
        }
        finish(value_type.clone(), cells)
    }

    fn peek(&self, child: &Node, spec: &[(String, PeekLabel)]) -> TensorSpec {
        let a = self.eval(child);
        let dims: Vec<String> = spec.iter().map(|(d, _)| d.clone()).collect();
        let ty = a.value_type().peek(&dims);
        if ty.is_error() {
            return TensorSpec::error();
        }
        // Selected label per peeked dimension; None when out of bounds.
        let mut selected: Vec<(String, Option<Label>)> = Vec::with_capacity(spec.len());
        for (dim, label) in spec {
            let Some(d) = a.value_type().dimension(dim).cloned() else {
                return TensorSpec::error();
            };
            let choice = match label {
                PeekLabel::Label(Label::Mapped(s)) if d.is_mapped() => Some(Label::Mapped(s.clone())),
                PeekLabel::Label(Label::Mapped(_)) => return TensorSpec::error(),
                PeekLabel::Label(Label::Indexed(i)) if d.is_mapped() => Some(Label::Mapped(i.to_string())),
                PeekLabel::Label(Label::Indexed(i)) => (*i < d.size as usize).then_some(Label::Indexed(*i)),
                PeekLabel::Expr(expr) => {
                    let v = self.eval(expr);
                    if !v.value_type().is_double() {
                        return TensorSpec::error();
                    }
                    let v = v.as_double();
                    if d.is_mapped() {
                        Some(Label::Mapped(label_from_number(v)))
                    } else {
                        index_from_number(v, d.size).map(Label::Indexed)
                    }
                }
            };
            selected.push((dim.clone(), choice));
        }
        let mut cells = BTreeMap::new();
        if selected.iter().all(|(_, l)| l.is_some()) {
            for (address, value) in a.cells() {
                let matches = selected.iter().all(|(d, l)| address.get(d) == l.as_ref());
                if matches {
                    let rest: TensorAddress =
                        address.iter().filter(|(d, _)| !dims.contains(d)).map(|(d, l)| (d.clone(), l.clone())).collect();
                    cells.insert(rest, *value);
                }
            }
        }
        if ty.is_double() {
            return TensorSpec::from_double(cells.values().sum());
        }
        finish(ty, cells)
    }

    fn map_subspaces(&self, a: &TensorSpec, lambda: &Arc<Function>) -> TensorSpec {
        let outer = a.value_type().clone();
        if outer.is_error() || lambda.num_params() != 1 {
            return TensorSpec::error();
        }
        let inner_type = outer.dense_subspace_type();
        let mut groups: BTreeMap<TensorAddress, BTreeMap<TensorAddress, f64>> = BTreeMap::new();
        for (address, value) in a.cells() {
            let (sparse, dense): (TensorAddress, TensorAddress) =
                address.iter().map(|(d, l)| (d.clone(), l.clone())).partition(|(_, l)| matches!(l, Label::Mapped(_)));
            groups.entry(sparse).or_default().insert(dense, *value);
        }
        let mut result_type: Option<ValueType> = None;
        let mut cells = BTreeMap::new();
        for (sparse, dense) in groups {
            let mut arg = TensorSpec::new(inner_type.clone());
            for (k, v) in dense {
                arg.add(k, v);
            }
            let out = evaluate(lambda, &[arg], self.constants);
            let ty = ValueType::map_subspaces(&outer, out.value_type());
            if ty.is_error() || result_type.as_ref().is_some_and(|t| *t != ty) {
                return TensorSpec::error();
            }
            result_type = Some(ty);
            for (k, v) in out.cells() {
                let mut address = sparse.clone();
                address.extend(k.iter().map(|(d, l)| (d.clone(), l.clone())));
                cells.insert(address, *v);
            }
        }
        let ty = match result_type {
            Some(ty) => ty,
            // No subspaces: type the lambda on an empty argument.
            None => {
                let out = evaluate(lambda, &[TensorSpec::new(inner_type)], self.constants);
                ValueType::map_subspaces(&outer, out.value_type())
            }
        };
        finish(ty, cells)
    }
}

fn join(a: &TensorSpec, b: &TensorSpec, f: impl Fn(f64, f64) -> f64) -> TensorSpec {
    let ty = ValueType::join(a.value_type(), b.value_type());
    if ty.is_error() {
        return TensorSpec::error();
    }
    let mut cells = BTreeMap::new();
    for (ka, va) in a.cells() {
        for (kb, vb) in b.cells() {
            if compatible(ka, kb, None) {
                let mut address = ka.clone();
                address.extend(kb.iter().map(|(d, l)| (d.clone(), l.clone())));
                cells.insert(address, f(*va, *vb));
            }
        }
    }
    finish(ty, cells)
}

fn merge(a: &TensorSpec, b: &TensorSpec, f: impl Fn(f64, f64) -> f64) -> TensorSpec {
    let ty = ValueType::merge(a.value_type(), b.value_type());
    if ty.is_error() {
        return TensorSpec::error();
    }
    let mut cells = a.cells().clone();
    for (k, vb) in b.cells() {
        let merged = match cells.get(k) {
            Some(va) => f(*va, *vb),
            None => *vb,
        };
        cells.insert(k.clone(), merged);
    }
    finish(ty, cells)
}

fn reduce(a: &TensorSpec, aggr: Aggr, dims: &[String]) -> TensorSpec {
    let ty = a.value_type().reduce(dims);
    if ty.is_error() {
        return TensorSpec::error();
    }
    let mut groups: BTreeMap<TensorAddress, Vec<f64>> = BTreeMap::new();
    for (address, value) in a.cells() {
        let kept: TensorAddress = address
            .iter()
            .filter(|(d, _)| !dims.is_empty() && !dims.contains(d))
            .map(|(d, l)| (d.clone(), l.clone()))
            .collect();
        groups.entry(kept).or_default().push(*value);
    }
    if ty.is_double() {
        let values = groups.remove(&TensorAddress::new()).unwrap_or_default();
        return TensorSpec::from_double(aggr.aggregate(&values));
    }
    finish(ty, groups.into_iter().map(|(k, values)| (k, aggr.aggregate(&values))).collect())
}

fn rename(a: &TensorSpec, from: &[String], to: &[String]) -> TensorSpec {
    let ty = a.value_type().rename(from, to);
    if ty.is_error() {
        return TensorSpec::error();
    }
    let cells = a
        .cells()
        .iter()
        .map(|(address, v)| {
            let renamed = address
                .iter()
                .map(|(d, l)| match from.iter().position(|f| f == d) {
                    Some(i) => (to[i].clone(), l.clone()),
                    None => (d.clone(), l.clone()),
                })
                .collect();
            (renamed, *v)
        })
        .collect();
    finish(ty, cells)
}

fn concat(a: &TensorSpec, b: &TensorSpec, dim: &str) -> TensorSpec {
    let ty = ValueType::concat(a.value_type(), b.value_type(), dim);
    if ty.is_error() {
        return TensorSpec::error();
    }
    let a_size = a.value_type().dimension(dim).map_or(1, |d| d.size as usize);
    let index_of = |address: &TensorAddress| match address.get(dim) {
        Some(Label::Indexed(i)) => *i,
        _ => 0,
    };
    let mut cells = BTreeMap::new();
    for (ka, va) in a.cells() {
        for (kb, vb) in b.cells() {
            if !compatible(ka, kb, Some(dim)) {
                continue;
            }
            let mut common = ka.clone();
            common.extend(kb.iter().map(|(d, l)| (d.clone(), l.clone())));
            common.remove(dim);
            let mut left = common.clone();
            left.insert(dim.to_string(), Label::Indexed(index_of(ka)));
            cells.insert(left, *va);
            let mut right = common;
            right.insert(dim.to_string(), Label::Indexed(a_size + index_of(kb)));
            cells.insert(right, *vb);
        }
    }
    finish(ty, cells)
}
