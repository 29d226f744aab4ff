//! Node-to-instruction compilation.

use std::sync::Arc;

use super::ops::{self, dense, generic, nested};
use super::{Instruction, OpFn, Stash};
use crate::graph::{Graph, NodeId, NodeKind, TensorFunction};
use crate::value::ValueBuilderFactory;
use crate::with_cell_type;

pub struct CompileContext<'g> {
    pub graph: &'g Graph,
    pub stash: &'g mut Stash,
    pub factory: &'g Arc<dyn ValueBuilderFactory>,
}

pub(crate) fn compile_program(graph: &Graph, stash: &mut Stash, factory: &Arc<dyn ValueBuilderFactory>) -> Vec<Instruction> {
    let mut ctx = CompileContext { graph, stash, factory };
    let mut program = Vec::new();
    compile_node(&mut ctx, graph.root(), &mut program);
    program
}

fn compile_node(ctx: &mut CompileContext<'_>, id: NodeId, program: &mut Vec<Instruction>) {
    let graph = ctx.graph;
    let node = graph.node(id);
    if let NodeKind::If { cond, true_child, false_child } = node.kind {
        compile_node(ctx, cond, program);
        let skip_true = program.len();
        program.push(Instruction::new("jump_if_false", ops::op_jump_if_false, 0));
        compile_node(ctx, true_child, program);
        let skip_false = program.len();
        program.push(Instruction::new("jump", ops::op_jump, 0));
        program[skip_true].param = program.len() as u64;
        compile_node(ctx, false_child, program);
        program[skip_false].param = program.len() as u64;
        return;
    }
    for child in node.kind.children() {
        compile_node(ctx, child, program);
    }
    program.push(node.compile_self(ctx));
}

// Kernel instantiated for the runtime cell types of its operands and result.
macro_rules! select2 {
    ($a:expr, $b:expr, $($f:ident)::+) => {
        with_cell_type!($a, A => with_cell_type!($b, B => $($f)::+::<A, B> as OpFn))
    };
}

macro_rules! select3 {
    ($a:expr, $b:expr, $c:expr, $($f:ident)::+) => {
        with_cell_type!($a, A => with_cell_type!($b, B => with_cell_type!($c, C => $($f)::+::<A, B, C> as OpFn)))
    };
}

impl TensorFunction {
    /// The instruction for this node alone; children are compiled before it.
    pub fn compile_self(&self, ctx: &mut CompileContext<'_>) -> Instruction {
        let graph = ctx.graph;
        let ty = &self.result_type;
        let out = ty.cell_type();
        let cell_type = |id: NodeId| graph.result_type_of(id).cell_type();
        let name = self.kind.name();
        match &self.kind {
            NodeKind::Const(value) => {
                Instruction::new(name, ops::op_load_const, ctx.stash.create_value(value.clone()))
            }
            NodeKind::Inject(param) => Instruction::new(name, ops::op_load_param, *param as u64),
            NodeKind::Reduce { child, aggr, .. } => {
                let params = generic::ReduceParams::new(graph.result_type_of(*child), ty, *aggr);
                let function = select2!(cell_type(*child), out, generic::op_reduce);
                Instruction::new(name, function, ctx.stash.create(params))
            }
            NodeKind::Map { child, function, inplace } => {
                let params = generic::MapParams { result_type: ty.clone(), function: function.clone() };
                let op = if *inplace {
                    with_cell_type!(out, T => dense::op_map_inplace::<T> as OpFn)
                } else {
                    select2!(cell_type(*child), out, generic::op_map)
                };
                Instruction::new(if *inplace { "map_inplace" } else { name }, op, ctx.stash.create(params))
            }
            NodeKind::MapSubspaces { child, inner } => {
                let params = nested::MapSubspacesParams::new(graph.result_type_of(*child), ty, inner, ctx.factory);
                let function = with_cell_type!(out, T => nested::op_map_subspaces::<T> as OpFn);
                Instruction::new(name, function, ctx.stash.create(params))
            }
            NodeKind::Join { lhs, rhs, function } => {
                let params = generic::JoinParams::new(graph.result_type_of(*lhs), graph.result_type_of(*rhs), ty, function.clone());
                let op = select3!(cell_type(*lhs), cell_type(*rhs), out, generic::op_join);
                Instruction::new(name, op, ctx.stash.create(params))
            }
            NodeKind::Merge { lhs: _, rhs: _, function } => {
                let params = generic::MergeParams { result_type: ty.clone(), function: function.clone() };
                let op = with_cell_type!(out, T => generic::op_merge::<T> as OpFn);
                Instruction::new(name, op, ctx.stash.create(params))
            }
            NodeKind::Concat { lhs, rhs, dim } => {
                let params = generic::ConcatParams::new(graph.result_type_of(*lhs), graph.result_type_of(*rhs), ty, dim);
                let op = with_cell_type!(out, T => generic::op_concat::<T> as OpFn);
                Instruction::new(name, op, ctx.stash.create(params))
            }
            NodeKind::Rename { child, from, to } => {
                let params = generic::RenameParams::new(graph.result_type_of(*child), ty, from, to);
                let op = with_cell_type!(out, T => generic::op_rename::<T> as OpFn);
                Instruction::new(name, op, ctx.stash.create(params))
            }
            NodeKind::CellCast { child, .. } => {
                let op = select2!(cell_type(*child), out, generic::op_cell_cast);
                Instruction::new(name, op, ctx.stash.create(ty.clone()))
            }
            NodeKind::Create { cells } => {
                let params = generic::CreateParams::new(ty, cells.iter().map(|(address, _)| address));
                let op = with_cell_type!(out, T => generic::op_create::<T> as OpFn);
                Instruction::new(name, op, ctx.stash.create(params))
            }
            NodeKind::Lambda { bindings, inner, .. } => {
                let params = nested::LambdaParams::new(ty, bindings, inner, ctx.factory);
                let op = with_cell_type!(out, T => nested::op_lambda::<T> as OpFn);
                Instruction::new(name, op, ctx.stash.create(params))
            }
            NodeKind::Peek { child, spec } => {
                let params = generic::PeekParams::new(graph.result_type_of(*child), ty, spec);
                let op = with_cell_type!(out, T => generic::op_peek::<T> as OpFn);
                Instruction::new(name, op, ctx.stash.create(params))
            }
            NodeKind::If { .. } => unreachable!("if nodes compile to jumps"),
            NodeKind::Relabel { .. } => Instruction::new(name, dense::op_relabel, ctx.stash.create(ty.clone())),
            NodeKind::DenseDotProduct { lhs, rhs } => {
                let op = select2!(cell_type(*lhs), cell_type(*rhs), dense::op_dot_product);
                Instruction::new(name, op, 0)
            }
            NodeKind::DenseXWProduct { vector, matrix, vector_size, result_size, common_inner } => {
                let params = dense::XwParams {
                    result_type: ty.clone(),
                    vector_size: *vector_size,
                    result_size: *result_size,
                    common_inner: *common_inner,
                };
                let op = select3!(cell_type(*vector), cell_type(*matrix), out, dense::op_xw_product);
                Instruction::new(name, op, ctx.stash.create(params))
            }
            NodeKind::DenseMatMul { lhs, rhs, lhs_size, common_size, rhs_size, lhs_common_inner, rhs_common_inner } => {
                let params = dense::MatMulParams {
                    result_type: ty.clone(),
                    lhs_size: *lhs_size,
                    common_size: *common_size,
                    rhs_size: *rhs_size,
                    lhs_common_inner: *lhs_common_inner,
                    rhs_common_inner: *rhs_common_inner,
                };
                let op = select3!(cell_type(*lhs), cell_type(*rhs), out, dense::op_matmul);
                Instruction::new(name, op, ctx.stash.create(params))
            }
            NodeKind::MixedInnerProduct { mixed, vector } => {
                let params = dense::MixedInnerParams::new(graph.result_type_of(*mixed), graph.result_type_of(*vector), ty);
                let op = select3!(cell_type(*mixed), cell_type(*vector), out, dense::op_mixed_inner_product);
                Instruction::new(name, op, ctx.stash.create(params))
            }
            NodeKind::DenseSimpleJoin { lhs, rhs, function, primary_is_lhs, overlap, inplace } => {
                let secondary = if *primary_is_lhs { *rhs } else { *lhs };
                let params = dense::SimpleJoinParams {
                    result_type: ty.clone(),
                    function: function.clone(),
                    primary_is_lhs: *primary_is_lhs,
                    overlap: *overlap,
                    inplace: *inplace,
                    secondary_size: graph.result_type_of(secondary).dense_subspace_size(),
                };
                let op = select3!(cell_type(*lhs), cell_type(*rhs), out, dense::op_simple_join);
                Instruction::new(name, op, ctx.stash.create(params))
            }
            NodeKind::JoinWithNumber { lhs, rhs, function, number_is_lhs, inplace } => {
                let tensor = if *number_is_lhs { *rhs } else { *lhs };
                let params = dense::NumberJoinParams {
                    result_type: ty.clone(),
                    function: function.clone(),
                    number_is_lhs: *number_is_lhs,
                    inplace: *inplace,
                };
                let op = select2!(cell_type(tensor), out, dense::op_join_with_number);
                Instruction::new(name, op, ctx.stash.create(params))
            }
            NodeKind::DenseLambdaPeek { param, table } => {
                let params = dense::LambdaPeekParams { result_type: ty.clone(), param: *param, table: table.clone() };
                let source = graph.param_types()[*param].cell_type();
                let op = select2!(source, out, dense::op_lambda_peek);
                Instruction::new(name, op, ctx.stash.create(params))
            }
        }
    }
}
