//! Typed expression AST handed to the engine by the expression parser.
//!
//! The engine never parses expression text; it consumes this tree. Lambdas are
//! shared through `Arc` so their identity can key caches.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{CellType, ValueType};
use crate::value::{Label, TensorAddress};

// ---- Span infrastructure ----

/// Byte range within type-spec or tensor-literal text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn merge(self, other: Span) -> Span {
        Span { start: self.start.min(other.start), end: self.end.max(other.end) }
    }
}

// ---- Operators ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
    Cos,
    Sin,
    Tan,
    Cosh,
    Sinh,
    Tanh,
    Acos,
    Asin,
    Atan,
    Exp,
    Log10,
    Log,
    Sqrt,
    Ceil,
    Fabs,
    Floor,
    Isnan,
    Relu,
    Sigmoid,
    Elu,
    Erf,
    Square,
    Cube,
    Inv,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Not => "not",
            UnaryOp::Cos => "cos",
            UnaryOp::Sin => "sin",
            UnaryOp::Tan => "tan",
            UnaryOp::Cosh => "cosh",
            UnaryOp::Sinh => "sinh",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Acos => "acos",
            UnaryOp::Asin => "asin",
            UnaryOp::Atan => "atan",
            UnaryOp::Exp => "exp",
            UnaryOp::Log10 => "log10",
            UnaryOp::Log => "log",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Ceil => "ceil",
            UnaryOp::Fabs => "fabs",
            UnaryOp::Floor => "floor",
            UnaryOp::Isnan => "isnan",
            UnaryOp::Relu => "relu",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Elu => "elu",
            UnaryOp::Erf => "erf",
            UnaryOp::Square => "square",
            UnaryOp::Cube => "cube",
            UnaryOp::Inv => "inv",
        }
    }

    pub fn function(self) -> fn(f64) -> f64 {
        match self {
            UnaryOp::Neg => |a| -a,
            UnaryOp::Not => |a| if a != 0.0 { 0.0 } else { 1.0 },
            UnaryOp::Cos => f64::cos,
            UnaryOp::Sin => f64::sin,
            UnaryOp::Tan => f64::tan,
            UnaryOp::Cosh => f64::cosh,
            UnaryOp::Sinh => f64::sinh,
            UnaryOp::Tanh => f64::tanh,
            UnaryOp::Acos => f64::acos,
            UnaryOp::Asin => f64::asin,
            UnaryOp::Atan => f64::atan,
            UnaryOp::Exp => f64::exp,
            UnaryOp::Log10 => f64::log10,
            UnaryOp::Log => f64::ln,
            UnaryOp::Sqrt => f64::sqrt,
            UnaryOp::Ceil => f64::ceil,
            UnaryOp::Fabs => f64::abs,
            UnaryOp::Floor => f64::floor,
            UnaryOp::Isnan => |a| if a.is_nan() { 1.0 } else { 0.0 },
            UnaryOp::Relu => |a| a.max(0.0),
            UnaryOp::Sigmoid => |a| 1.0 / (1.0 + (-a).exp()),
            UnaryOp::Elu => |a| if a < 0.0 { a.exp() - 1.0 } else { a },
            UnaryOp::Erf => erf,
            UnaryOp::Square => |a| a * a,
            UnaryOp::Cube => |a| a * a * a,
            UnaryOp::Inv => |a| 1.0 / a,
        }
    }

    pub fn apply(self, a: f64) -> f64 {
        (self.function())(a)
    }
}

/// Error function, Abramowitz and Stegun 7.1.26 (|error| < 1.5e-7).
fn erf(x: f64) -> f64 {
    if x.is_nan() {
        return x;
    }
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t * (0.254_829_592 + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Equal,
    NotEqual,
    Approx,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    And,
    Or,
    Min,
    Max,
    Atan2,
    Ldexp,
    Fmod,
}

fn truth(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

fn approx_equal(a: f64, b: f64) -> bool {
    a == b || (a - b).abs() <= 1e-6 * a.abs().max(b.abs())
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Mod => "mod",
            BinaryOp::Pow => "pow",
            BinaryOp::Equal => "equal",
            BinaryOp::NotEqual => "not_equal",
            BinaryOp::Approx => "approx",
            BinaryOp::Less => "less",
            BinaryOp::LessEqual => "less_equal",
            BinaryOp::Greater => "greater",
            BinaryOp::GreaterEqual => "greater_equal",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Min => "min",
            BinaryOp::Max => "max",
            BinaryOp::Atan2 => "atan2",
            BinaryOp::Ldexp => "ldexp",
            BinaryOp::Fmod => "fmod",
        }
    }

    pub fn function(self) -> fn(f64, f64) -> f64 {
        match self {
            BinaryOp::Add => |a, b| a + b,
            BinaryOp::Sub => |a, b| a - b,
            BinaryOp::Mul => |a, b| a * b,
            BinaryOp::Div => |a, b| a / b,
            BinaryOp::Mod | BinaryOp::Fmod => |a, b| a % b,
            BinaryOp::Pow => f64::powf,
            BinaryOp::Equal => |a, b| truth(a == b),
            BinaryOp::NotEqual => |a, b| truth(a != b),
            BinaryOp::Approx => |a, b| truth(approx_equal(a, b)),
            BinaryOp::Less => |a, b| truth(a < b),
            BinaryOp::LessEqual => |a, b| truth(a <= b),
            BinaryOp::Greater => |a, b| truth(a > b),
            BinaryOp::GreaterEqual => |a, b| truth(a >= b),
            BinaryOp::And => |a, b| truth(a != 0.0 && b != 0.0),
            BinaryOp::Or => |a, b| truth(a != 0.0 || b != 0.0),
            BinaryOp::Min => f64::min,
            BinaryOp::Max => f64::max,
            BinaryOp::Atan2 => f64::atan2,
            BinaryOp::Ldexp => |a, b| a * 2f64.powi(b as i32),
        }
    }

    pub fn apply(self, a: f64, b: f64) -> f64 {
        (self.function())(a, b)
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Mul
                | BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::Approx
                | BinaryOp::And
                | BinaryOp::Or
                | BinaryOp::Min
                | BinaryOp::Max
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggr {
    Avg,
    Count,
    Prod,
    Sum,
    Max,
    Median,
    Min,
}

impl Aggr {
    pub fn name(self) -> &'static str {
        match self {
            Aggr::Avg => "avg",
            Aggr::Count => "count",
            Aggr::Prod => "prod",
            Aggr::Sum => "sum",
            Aggr::Max => "max",
            Aggr::Median => "median",
            Aggr::Min => "min",
        }
    }

    /// Aggregating a single value returns that value.
    pub fn is_identity_on_single(self) -> bool {
        !matches!(self, Aggr::Count)
    }

    /// Aggregate a finished list of values; the empty list gives 0.
    pub fn aggregate(self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            Aggr::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Aggr::Count => values.len() as f64,
            Aggr::Prod => values.iter().product(),
            Aggr::Sum => values.iter().sum(),
            Aggr::Max => values.iter().copied().fold(f64::NEG_INFINITY, nan_max),
            Aggr::Min => values.iter().copied().fold(f64::INFINITY, nan_min),
            Aggr::Median => median(values),
        }
    }
}

/// Larger of two values; NaN if either is NaN.
pub fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() { f64::NAN } else { a.max(b) }
}

pub fn nan_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() { f64::NAN } else { a.min(b) }
}

/// Median of the values; the mean of the two middle values for even counts.
/// Any NaN makes the result NaN.
pub fn median(values: &[f64]) -> f64 {
    if values.iter().any(|v| v.is_nan()) {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    if n == 0 {
        0.0
    } else if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

// ---- Core AST types ----

/// A function: named parameters and a root expression.
/// Parameter `i` is referenced as `Node::Symbol(i)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub params: Vec<String>,
    pub root: Node,
}

/// Label selector for one dimension of a peek.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeekLabel {
    /// `{x:3}` or `{key:foo}`
    Label(Label),
    /// `{x:(i+1)}`
    Expr(Node),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Number(f64),
    /// Parameter by position.
    Symbol(usize),
    /// `constant(name)`, resolved when the graph is built.
    Constant(String),
    Unary {
        op: UnaryOp,
        child: Box<Node>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    If {
        cond: Box<Node>,
        true_expr: Box<Node>,
        false_expr: Box<Node>,
    },
    /// `map(child, f(a)(...))`
    Map {
        child: Box<Node>,
        lambda: Arc<Function>,
    },
    /// `join(lhs, rhs, f(a,b)(...))`
    Join {
        lhs: Box<Node>,
        rhs: Box<Node>,
        lambda: Arc<Function>,
    },
    /// `merge(lhs, rhs, f(a,b)(...))`
    Merge {
        lhs: Box<Node>,
        rhs: Box<Node>,
        lambda: Arc<Function>,
    },
    /// `reduce(child, aggr, dims...)`; empty dims reduce everything.
    Reduce {
        child: Box<Node>,
        aggr: Aggr,
        dims: Vec<String>,
    },
    /// `rename(child, (from...), (to...))`
    Rename {
        child: Box<Node>,
        from: Vec<String>,
        to: Vec<String>,
    },
    /// `concat(lhs, rhs, dim)`
    Concat {
        lhs: Box<Node>,
        rhs: Box<Node>,
        dim: String,
    },
    /// `cell_cast(child, float)`
    CellCast {
        child: Box<Node>,
        cell_type: CellType,
    },
    /// `tensor(x[2]):{{x:0}:a,{x:1}:b+1}`: every cell is a scalar expression.
    Create {
        value_type: ValueType,
        cells: Vec<(TensorAddress, Node)>,
    },
    /// `tensor(x[3])(x*2)`: the lambda takes one parameter per dimension
    /// (the cell index) followed by the bound outer parameters.
    Lambda {
        value_type: ValueType,
        bindings: Vec<usize>,
        lambda: Arc<Function>,
    },
    /// `child{x:1,y:(a+1)}`
    Peek {
        child: Box<Node>,
        spec: Vec<(String, PeekLabel)>,
    },
    /// `map_subspaces(child, f(s)(...))`
    MapSubspaces {
        child: Box<Node>,
        lambda: Arc<Function>,
    },
}

impl Function {
    pub fn new(params: &[&str], root: Node) -> Self {
        Function { params: params.iter().map(|p| p.to_string()).collect(), root }
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    /// `f(a)(op(a))` recognised as the builtin unary operator.
    pub fn as_unary_op(&self) -> Option<UnaryOp> {
        match &self.root {
            Node::Unary { op, child } if self.params.len() == 1 && **child == Node::Symbol(0) => Some(*op),
            _ => None,
        }
    }

    /// `f(a,b)(op(a,b))` recognised as the builtin binary operator.
    pub fn as_binary_op(&self) -> Option<BinaryOp> {
        match &self.root {
            Node::Binary { op, lhs, rhs }
                if self.params.len() == 2 && **lhs == Node::Symbol(0) && **rhs == Node::Symbol(1) =>
            {
                Some(*op)
            }
            _ => None,
        }
    }

    /// Lambda built around a single builtin unary operator.
    pub fn unary(op: UnaryOp) -> Arc<Function> {
        Arc::new(Function::new(&["a"], Node::unary(op, Node::Symbol(0))))
    }

    /// Lambda built around a single builtin binary operator.
    pub fn binary(op: BinaryOp) -> Arc<Function> {
        Arc::new(Function::new(&["a", "b"], Node::binary(op, Node::Symbol(0), Node::Symbol(1))))
    }
}

impl Node {
    pub fn unary(op: UnaryOp, child: Node) -> Node {
        Node::Unary { op, child: Box::new(child) }
    }

    pub fn binary(op: BinaryOp, lhs: Node, rhs: Node) -> Node {
        Node::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    pub fn join(lhs: Node, rhs: Node, op: BinaryOp) -> Node {
        Node::Join { lhs: Box::new(lhs), rhs: Box::new(rhs), lambda: Function::binary(op) }
    }

    pub fn merge(lhs: Node, rhs: Node, op: BinaryOp) -> Node {
        Node::Merge { lhs: Box::new(lhs), rhs: Box::new(rhs), lambda: Function::binary(op) }
    }

    pub fn map(child: Node, op: UnaryOp) -> Node {
        Node::Map { child: Box::new(child), lambda: Function::unary(op) }
    }

    pub fn reduce(child: Node, aggr: Aggr, dims: &[&str]) -> Node {
        Node::Reduce { child: Box::new(child), aggr, dims: dims.iter().map(|d| d.to_string()).collect() }
    }

    pub fn rename(child: Node, from: &[&str], to: &[&str]) -> Node {
        Node::Rename {
            child: Box::new(child),
            from: from.iter().map(|d| d.to_string()).collect(),
            to: to.iter().map(|d| d.to_string()).collect(),
        }
    }

    pub fn concat(lhs: Node, rhs: Node, dim: &str) -> Node {
        Node::Concat { lhs: Box::new(lhs), rhs: Box::new(rhs), dim: dim.to_string() }
    }

    pub fn cell_cast(child: Node, cell_type: CellType) -> Node {
        Node::CellCast { child: Box::new(child), cell_type }
    }

    pub fn if_then_else(cond: Node, true_expr: Node, false_expr: Node) -> Node {
        Node::If { cond: Box::new(cond), true_expr: Box::new(true_expr), false_expr: Box::new(false_expr) }
    }

    /// True when the subtree only combines numbers and parameters with scalar
    /// operators, so it can run per cell without building a graph.
    pub fn is_scalar_only(&self) -> bool {
        match self {
            Node::Number(_) | Node::Symbol(_) => true,
            Node::Unary { child, .. } => child.is_scalar_only(),
            Node::Binary { lhs, rhs, .. } => lhs.is_scalar_only() && rhs.is_scalar_only(),
            Node::If { cond, true_expr, false_expr } => {
                cond.is_scalar_only() && true_expr.is_scalar_only() && false_expr.is_scalar_only()
            }
            _ => false,
        }
    }

    /// Largest parameter index used anywhere below this node.
    pub fn max_symbol(&self) -> Option<usize> {
        let mut max: Option<usize> = None;
        self.visit(&mut |n| {
            if let Node::Symbol(i) = n {
                max = Some(max.map_or(*i, |m: usize| m.max(*i)));
            }
        });
        max
    }

    /// Pre-order walk over this node and its direct expression children.
    /// Lambda bodies are separate functions and are not entered.
    pub fn visit(&self, f: &mut impl FnMut(&Node)) {
        f(self);
        match self {
            Node::Number(_) | Node::Symbol(_) | Node::Constant(_) | Node::Lambda { .. } => {}
            Node::Unary { child, .. }
            | Node::Map { child, .. }
            | Node::Reduce { child, .. }
            | Node::Rename { child, .. }
            | Node::CellCast { child, .. }
            | Node::MapSubspaces { child, .. } => child.visit(f),
            Node::Binary { lhs, rhs, .. }
            | Node::Join { lhs, rhs, .. }
            | Node::Merge { lhs, rhs, .. }
            | Node::Concat { lhs, rhs, .. } => {
                lhs.visit(f);
                rhs.visit(f);
            }
            Node::If { cond, true_expr, false_expr } => {
                cond.visit(f);
                true_expr.visit(f);
                false_expr.visit(f);
            }
            Node::Create { cells, .. } => {
                for (_, node) in cells {
                    node.visit(f);
                }
            }
            Node::Peek { child, spec } => {
                child.visit(f);
                for (_, label) in spec {
                    if let PeekLabel::Expr(node) = label {
                        node.visit(f);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_lambdas_are_recognised() {
        assert_eq!(Function::binary(BinaryOp::Mul).as_binary_op(), Some(BinaryOp::Mul));
        assert_eq!(Function::unary(UnaryOp::Exp).as_unary_op(), Some(UnaryOp::Exp));
        let swapped = Function::new(&["a", "b"], Node::binary(BinaryOp::Sub, Node::Symbol(1), Node::Symbol(0)));
        assert_eq!(swapped.as_binary_op(), None);
    }

    #[test]
    fn operators() {
        assert_eq!(BinaryOp::Ldexp.apply(3.0, 2.0), 12.0);
        assert_eq!(BinaryOp::Mod.apply(7.0, 3.0), 1.0);
        assert_eq!(BinaryOp::Approx.apply(1.0, 1.0 + 1e-9), 1.0);
        assert_eq!(UnaryOp::Not.apply(0.0), 1.0);
        assert_eq!(UnaryOp::Elu.apply(-0.0), 0.0);
        assert!((UnaryOp::Erf.apply(1.0) - 0.842_700_79).abs() < 1e-6);
        assert!((UnaryOp::Sigmoid.apply(0.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn aggregators() {
        let v = [3.0, 1.0, 4.0, 2.0];
        assert_eq!(Aggr::Avg.aggregate(&v), 2.5);
        assert_eq!(Aggr::Count.aggregate(&v), 4.0);
        assert_eq!(Aggr::Prod.aggregate(&v), 24.0);
        assert_eq!(Aggr::Median.aggregate(&v), 2.5);
        assert_eq!(Aggr::Median.aggregate(&v[..3]), 3.0);
        assert_eq!(Aggr::Max.aggregate(&[]), 0.0);
    }

    #[test]
    fn scalar_only_and_symbols() {
        let n = Node::binary(BinaryOp::Add, Node::Symbol(2), Node::unary(UnaryOp::Neg, Node::Symbol(0)));
        assert!(n.is_scalar_only());
        assert_eq!(n.max_symbol(), Some(2));
        assert!(!Node::reduce(Node::Symbol(0), Aggr::Sum, &[]).is_scalar_only());
    }

    #[test]
    fn serde_roundtrip() {
        let f = Function::new(&["x"], Node::reduce(Node::map(Node::Symbol(0), UnaryOp::Sqrt), Aggr::Sum, &["d"]));
        let json = serde_json::to_string(&f).unwrap();
        let back: Function = serde_json::from_str(&json).unwrap();
        assert_eq!(back, f);
    }
}
