//! Instruction compiler and stack-machine interpreter.
//!
//! Every graph node compiles to one `Instruction`: a kernel selected for the
//! cell types it sees plus a 64-bit parameter. The parameter is either an
//! inline integer (parameter index, jump target) or a handle into the
//! `Stash`, which holds the precomputed sizes, strides and plans of each
//! node. Executing an instruction pops its operands and pushes one result.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::ast::Function;
use crate::config::EngineConfig;
use crate::graph::{ConstantResolver, Graph};
use crate::optimize::optimize;
use crate::types::ValueType;
use crate::value::{MemoryUsage, TensorSpec, Value, ValueBuilderFactory, ValueRef, spec_from_value};

pub mod compile;
pub(crate) mod ops;

pub use compile::CompileContext;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("expected {expected} parameters, got {got}")]
    ParamCount { expected: usize, got: usize },
    #[error("parameter {index} has type {got}, compiled for {expected}")]
    ParamType { index: usize, expected: String, got: String },
}

// ── Instructions ────────────────────────────────────────────────────

pub type OpFn = for<'a> fn(&mut State<'a>, u64);

#[derive(Clone, Copy)]
pub struct Instruction {
    pub name: &'static str,
    pub function: OpFn,
    pub param: u64,
}

impl Instruction {
    pub fn new(name: &'static str, function: OpFn, param: u64) -> Self {
        Instruction { name, function, param }
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.param)
    }
}

// ── Stash ───────────────────────────────────────────────────────────

/// Per-program storage for instruction parameters that do not fit inline.
/// Lives as long as the compiled program.
#[derive(Default)]
pub struct Stash {
    items: Vec<Box<dyn Any + Send + Sync>>,
    constants: MemoryUsage,
}

impl Stash {
    pub fn new() -> Self {
        Stash::default()
    }

    /// Store `item`, returning the handle to put in the instruction.
    pub fn create<T: Any + Send + Sync>(&mut self, item: T) -> u64 {
        self.items.push(Box::new(item));
        (self.items.len() - 1) as u64
    }

    pub fn create_value(&mut self, value: Arc<dyn Value>) -> u64 {
        self.constants.merge(value.memory_usage());
        self.create(value)
    }

    /// Panics when the handle refers to a different type.
    pub fn get<T: Any>(&self, handle: u64) -> &T {
        self.items
            .get(handle as usize)
            .and_then(|item| item.downcast_ref::<T>())
            .unwrap_or_else(|| panic!("stash entry {} is not a {}", handle, std::any::type_name::<T>()))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let own = self.items.iter().map(|item| std::mem::size_of_val(&**item)).sum::<usize>();
        let mut usage = MemoryUsage {
            allocated_bytes: own + self.items.capacity() * std::mem::size_of::<Box<dyn Any>>(),
            used_bytes: own + self.items.len() * std::mem::size_of::<Box<dyn Any>>(),
        };
        usage.merge(self.constants);
        usage
    }
}

impl fmt::Debug for Stash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stash").field("entries", &self.items.len()).finish()
    }
}

// ── Interpreter state ───────────────────────────────────────────────

/// Everything one evaluation touches. Borrowed values come from the caller's
/// parameters or the stash; intermediate results are owned by the stack.
pub struct State<'a> {
    pub params: &'a [&'a dyn Value],
    pub stash: &'a Stash,
    pub factory: &'a dyn ValueBuilderFactory,
    pub stack: Vec<ValueRef<'a>>,
    pub program_counter: usize,
}

impl<'a> State<'a> {
    pub fn new(params: &'a [&'a dyn Value], stash: &'a Stash, factory: &'a dyn ValueBuilderFactory) -> Self {
        State { params, stash, factory, stack: Vec::new(), program_counter: 0 }
    }

    pub fn stash<T: Any>(&self, handle: u64) -> &'a T {
        let stash: &'a Stash = self.stash;
        stash.get(handle)
    }

    pub fn pop(&mut self) -> ValueRef<'a> {
        self.stack.pop().unwrap_or_else(|| panic!("stack underflow at instruction {}", self.program_counter))
    }

    /// Operand `depth` positions below the top.
    pub fn peek(&self, depth: usize) -> &(dyn Value + 'a) {
        let len = self.stack.len();
        assert!(depth < len, "stack underflow at instruction {}", self.program_counter);
        &*self.stack[len - 1 - depth]
    }

    pub fn push(&mut self, value: ValueRef<'a>) {
        self.stack.push(value);
    }

    pub fn push_owned(&mut self, value: Box<dyn Value + 'a>) {
        self.stack.push(ValueRef::Owned(value));
    }

    /// Replace the top `n` operands with `value`.
    pub fn replace(&mut self, n: usize, value: ValueRef<'a>) {
        let len = self.stack.len();
        assert!(n <= len, "stack underflow at instruction {}", self.program_counter);
        self.stack.truncate(len - n);
        self.stack.push(value);
    }
}

// ── Compiled functions ──────────────────────────────────────────────

/// A graph compiled to a program, ready to evaluate many times, also from
/// several threads at once.
pub struct InterpretedFunction {
    graph: Graph,
    program: Vec<Instruction>,
    stash: Stash,
    factory: Arc<dyn ValueBuilderFactory>,
}

impl InterpretedFunction {
    pub fn new(graph: Graph, factory: Arc<dyn ValueBuilderFactory>) -> Self {
        let mut stash = Stash::new();
        let program = compile::compile_program(&graph, &mut stash, &factory);
        debug!(instructions = program.len(), stash = stash.len(), backend = factory.name(), "compiled program");
        InterpretedFunction { graph, program, stash, factory }
    }

    /// Build, optionally optimize, and compile `function` for the given parameter types.
    pub fn compile(
        function: &Function,
        param_types: &[ValueType],
        constants: &dyn ConstantResolver,
        config: &EngineConfig,
    ) -> Self {
        let mut graph = Graph::build(function, param_types, constants);
        if graph.has_errors() {
            for error in graph.errors() {
                warn!(op = error.op, "{}", error.message);
            }
        }
        if config.optimize {
            optimize(&mut graph);
        }
        InterpretedFunction::new(graph, config.factory())
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn num_params(&self) -> usize {
        self.graph.param_types().len()
    }

    /// Evaluate with parameters whose types match the compiled ones.
    pub fn eval<'a>(&'a self, params: &'a [&'a dyn Value]) -> Result<ValueRef<'a>, EvalError> {
        let expected = self.graph.param_types();
        if params.len() != expected.len() {
            return Err(EvalError::ParamCount { expected: expected.len(), got: params.len() });
        }
        for (index, (param, ty)) in params.iter().zip(expected).enumerate() {
            if param.value_type() != ty {
                return Err(EvalError::ParamType {
                    index,
                    expected: ty.to_spec(),
                    got: param.value_type().to_spec(),
                });
            }
        }
        Ok(self.run(params))
    }

    /// Evaluate without checking parameters. Used for nested functions whose
    /// arguments are produced by the enclosing kernel.
    pub(crate) fn run<'a>(&'a self, params: &'a [&'a dyn Value]) -> ValueRef<'a> {
        let mut state = State::new(params, &self.stash, self.factory.as_ref());
        while let Some(instruction) = self.program.get(state.program_counter) {
            state.program_counter += 1;
            (instruction.function)(&mut state, instruction.param);
        }
        let result = state.pop();
        assert!(state.stack.is_empty(), "{} values left on the stack", state.stack.len());
        result
    }

    /// One line per instruction.
    pub fn dump_program(&self) -> String {
        let mut out = String::new();
        for (pc, instruction) in self.program.iter().enumerate() {
            out.push_str(&format!("{:>4}  {}\n", pc, instruction.name));
        }
        out
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let mut usage = MemoryUsage {
            allocated_bytes: self.program.capacity() * std::mem::size_of::<Instruction>(),
            used_bytes: self.program.len() * std::mem::size_of::<Instruction>(),
        };
        usage.merge(self.stash.memory_usage());
        usage
    }
}

impl fmt::Debug for InterpretedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterpretedFunction")
            .field("result_type", &self.graph.result_type().to_spec())
            .field("program", &self.program)
            .field("backend", &self.factory.name())
            .finish()
    }
}

/// Compile, evaluate once and convert the result, keeping nothing.
pub fn eval_once(
    function: &Function,
    params: &[&dyn Value],
    constants: &dyn ConstantResolver,
    config: &EngineConfig,
) -> Result<TensorSpec, EvalError> {
    if params.len() != function.num_params() {
        return Err(EvalError::ParamCount { expected: function.num_params(), got: params.len() });
    }
    let types: Vec<ValueType> = params.iter().map(|p| p.value_type().clone()).collect();
    let compiled = InterpretedFunction::compile(function, &types, constants, config);
    let result = compiled.eval(params)?;
    Ok(spec_from_value(&*result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Aggr, BinaryOp, Node, UnaryOp};
    use crate::graph::NoConstants;
    use crate::value::{FastValueBuilderFactory, value_from_spec};

    fn value(text: &str) -> Box<dyn Value> {
        value_from_spec(&TensorSpec::from_expr(text).unwrap(), &FastValueBuilderFactory)
    }

    fn compile(root: Node, types: &[&str]) -> InterpretedFunction {
        let names: Vec<&str> = types.iter().map(|_| "p").collect();
        let types: Vec<ValueType> = types.iter().map(|t| ValueType::from_spec(t)).collect();
        InterpretedFunction::compile(&Function::new(&names, root), &types, &NoConstants, &EngineConfig::default())
    }

    #[test]
    fn evaluates_scalar_expression() {
        let root = Node::binary(BinaryOp::Add, Node::Symbol(0), Node::unary(UnaryOp::Neg, Node::Symbol(1)));
        let f = compile(root, &["double", "double"]);
        let (a, b) = (value("double:5"), value("double:2"));
        let params = [a.as_ref(), b.as_ref()];
        assert_eq!(f.eval(&params).unwrap().as_double(), 3.0);
    }

    #[test]
    fn if_only_runs_taken_branch() {
        let root = Node::if_then_else(
            Node::Symbol(0),
            Node::reduce(Node::Symbol(1), Aggr::Sum, &[]),
            Node::reduce(Node::Symbol(1), Aggr::Max, &[]),
        );
        let f = compile(root, &["double", "tensor(x[3])"]);
        let x = value("tensor(x[3]):[1,2,3]");
        let (yes, no) = (value("double:1"), value("double:0"));
        assert_eq!(f.eval(&[yes.as_ref(), x.as_ref()]).unwrap().as_double(), 6.0);
        assert_eq!(f.eval(&[no.as_ref(), x.as_ref()]).unwrap().as_double(), 3.0);
        assert!(f.dump_program().contains("jump_if_false"));
    }

    #[test]
    fn rejects_wrong_parameters() {
        let f = compile(Node::map(Node::Symbol(0), UnaryOp::Exp), &["tensor(x[2])"]);
        let wrong = value("tensor(x[3]):[1,2,3]");
        assert_eq!(f.eval(&[]).unwrap_err(), EvalError::ParamCount { expected: 1, got: 0 });
        assert!(matches!(f.eval(&[wrong.as_ref()]), Err(EvalError::ParamType { index: 0, .. })));
    }

    #[test]
    fn type_error_evaluates_to_error_sentinel() {
        let root = Node::join(Node::Symbol(0), Node::Symbol(1), BinaryOp::Add);
        let f = compile(root, &["tensor(x[2])", "tensor(x[3])"]);
        let (a, b) = (value("tensor(x[2]):[1,2]"), value("tensor(x[3]):[1,2,3]"));
        let params: [&dyn Value; 2] = [a.as_ref(), b.as_ref()];
        let result = f.eval(&params).unwrap();
        assert!(result.value_type().is_error());
        assert!(result.as_double().is_nan());
    }

    #[test]
    fn eval_once_returns_spec() {
        let root = Node::join(Node::Symbol(0), Node::Number(2.0), BinaryOp::Mul);
        let x = value("tensor(x[2]):[1,2]");
        let out = eval_once(&Function::new(&["x"], root), &[x.as_ref()], &NoConstants, &EngineConfig::default()).unwrap();
        assert_eq!(out.to_string(), "tensor(x[2]):{{x:0}:2,{x:1}:4}");
    }

    #[test]
    fn memory_usage_counts_constants() {
        let root = Node::join(Node::Symbol(0), Node::Number(2.0), BinaryOp::Mul);
        let f = compile(root, &["tensor(x[2])"]);
        let usage = f.memory_usage();
        assert!(usage.used_bytes > 0);
        assert!(usage.allocated_bytes >= usage.used_bytes);
    }
}
