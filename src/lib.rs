//! Tensor expression engine: shape inference, rewrite passes and a stack
//! interpreter for ranking expressions over sparse, dense and mixed tensors.
//!
//! ```text
//! Function ──Graph::build──▶ Graph ──optimize──▶ Graph ──compile──▶ InterpretedFunction ──eval──▶ Value
//! ```

pub mod ast;
pub mod config;
pub mod diagnostic;
pub mod dump;
pub mod graph;
pub mod interpreter;
pub mod lexer;
pub mod lookup_table;
pub mod nested_loop;
pub mod optimize;
pub mod parser;
pub mod sparse;
pub mod types;
pub mod value;
pub mod vm;

pub use ast::{Aggr, BinaryOp, Function, Node, PeekLabel, UnaryOp};
pub use config::{Backend, ConfigError, EngineConfig};
pub use graph::{ConstantResolver, Graph, NoConstants, TypeError};
pub use types::{CellType, Dimension, ValueType};
pub use value::{TensorSpec, Value, ValueBuilderFactory, ValueRef, spec_from_value, value_from_spec};
pub use vm::{EvalError, InterpretedFunction, eval_once};
