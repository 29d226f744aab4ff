//! Generic kernels: any mix of mapped and indexed dimensions, any cell types.

use crate::ast::Aggr;
use crate::graph::{JoinFn, MapFn, PeekTarget};
use crate::interpreter::{index_from_number, label_from_number};
use crate::nested_loop::{row_major_strides, run_nested_loop, run_nested_loop2};
use crate::sparse::FastSparseMap;
use crate::types::ValueType;
use crate::value::{Cell, Label, TensorAddress, ValueBuilder, ValueRef};
use crate::vm::State;

use super::{Aggregator, DenseJoinPlan, SparseJoinPlan, stride_of};

fn indexed_sizes(ty: &ValueType) -> Vec<usize> {
    ty.indexed_dimensions().iter().map(|d| d.size as usize).collect()
}

// ---- Join ----

#[derive(Debug)]
pub(crate) struct JoinParams {
    result_type: ValueType,
    function: JoinFn,
    sparse: SparseJoinPlan,
    dense: DenseJoinPlan,
}

impl JoinParams {
    pub fn new(lhs: &ValueType, rhs: &ValueType, result: &ValueType, function: JoinFn) -> Self {
        JoinParams {
            result_type: result.clone(),
            function,
            sparse: SparseJoinPlan::new(lhs, rhs, result),
            dense: DenseJoinPlan::new(lhs, rhs, result),
        }
    }
}

pub(crate) fn op_join<L: Cell, R: Cell, O: Cell>(state: &mut State<'_>, param: u64) {
    let p: &JoinParams = state.stash(param);
    let rhs = state.pop();
    let lhs = state.pop();
    let (lc, rc) = (L::unwrap(lhs.cells()), R::unwrap(rhs.cells()));
    let dense = &p.dense;
    let mut builder = ValueBuilder::<O>::new(&p.result_type, lhs.index().size().max(rhs.index().size()));
    p.sparse.for_each_match(lhs.index(), rhs.index(), |i, j, labels| {
        let (out, _) = builder.add_subspace(labels);
        let mut o = 0;
        run_nested_loop2(
            (i * dense.lhs_size, j * dense.rhs_size),
            &dense.loop_cnt,
            &dense.lhs_stride,
            &dense.rhs_stride,
            |a, b| {
                out[o] = O::from_f64(p.function.apply(lc[a].to_f64(), rc[b].to_f64()));
                o += 1;
            },
        );
    });
    let value = builder.build(p.result_type.clone(), state.factory);
    state.push_owned(value);
}

// ---- Merge ----

#[derive(Debug)]
pub(crate) struct MergeParams {
    pub result_type: ValueType,
    pub function: JoinFn,
}

/// Subspaces present on both sides are combined cell by cell; the rest are copied.
pub(crate) fn op_merge<O: Cell>(state: &mut State<'_>, param: u64) {
    let p: &MergeParams = state.stash(param);
    let rhs = state.pop();
    let lhs = state.pop();
    let (li, ri) = (lhs.index(), rhs.index());
    let (lc, rc) = (lhs.cells(), rhs.cells());
    let size = p.result_type.dense_subspace_size();
    let mut builder = ValueBuilder::<O>::new(&p.result_type, li.size() + ri.size());
    for i in 0..li.size() {
        let labels = li.labels(i);
        let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
        let other = ri.lookup(&refs);
        let (out, _) = builder.add_subspace(labels);
        for (k, cell) in out.iter_mut().enumerate() {
            let a = lc.get(i * size + k);
            let v = match other {
                Some(j) => p.function.apply(a, rc.get(j * size + k)),
                None => a,
            };
            *cell = O::from_f64(v);
        }
    }
    for j in 0..ri.size() {
        let labels = ri.labels(j);
        let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
        if li.lookup(&refs).is_some() {
            continue;
        }
        let (out, _) = builder.add_subspace(labels);
        for (k, cell) in out.iter_mut().enumerate() {
            *cell = O::from_f64(rc.get(j * size + k));
        }
    }
    let value = builder.build(p.result_type.clone(), state.factory);
    state.push_owned(value);
}

// ---- Reduce ----

#[derive(Debug)]
pub(crate) struct ReduceParams {
    result_type: ValueType,
    aggr: Aggr,
    /// Input label positions of the mapped dimensions that survive.
    kept: Vec<usize>,
    loop_cnt: Vec<usize>,
    in_stride: Vec<usize>,
    out_stride: Vec<usize>,
    in_size: usize,
    out_size: usize,
}

impl ReduceParams {
    pub fn new(input: &ValueType, result: &ValueType, aggr: Aggr) -> Self {
        let mapped = input.mapped_dimensions();
        let kept = result
            .mapped_dimensions()
            .iter()
            .filter_map(|d| mapped.iter().position(|m| m.name == d.name))
            .collect();
        let loop_cnt = indexed_sizes(input);
        let in_stride = row_major_strides(&loop_cnt);
        let out_stride = input.indexed_dimensions().iter().map(|d| stride_of(result, &d.name)).collect();
        ReduceParams {
            result_type: result.clone(),
            aggr,
            kept,
            loop_cnt,
            in_stride,
            out_stride,
            in_size: input.dense_subspace_size(),
            out_size: result.dense_subspace_size(),
        }
    }
}

pub(crate) fn op_reduce<I: Cell, O: Cell>(state: &mut State<'_>, param: u64) {
    let p: &ReduceParams = state.stash(param);
    let input = state.pop();
    let cells = I::unwrap(input.cells());
    let index = input.index();
    let mut groups = FastSparseMap::with_capacity(p.kept.len(), index.size());
    let mut aggregators: Vec<Aggregator> = Vec::new();
    let mut key: Vec<&str> = Vec::with_capacity(p.kept.len());
    for s in 0..index.size() {
        let labels = index.labels(s);
        key.clear();
        key.extend(p.kept.iter().map(|&k| labels[k].as_str()));
        let group = groups.add_mapping(&key) as usize;
        let base = group * p.out_size;
        if base == aggregators.len() {
            aggregators.extend((0..p.out_size).map(|_| Aggregator::new(p.aggr)));
        }
        run_nested_loop2((s * p.in_size, base), &p.loop_cnt, &p.in_stride, &p.out_stride, |i, o| {
            aggregators[o].add(cells[i].to_f64());
        });
    }
    let mut builder = ValueBuilder::<O>::new(&p.result_type, groups.size());
    for group in 0..groups.size() {
        let (out, _) = builder.add_subspace(groups.labels(group as u32));
        let states = &aggregators[group * p.out_size..(group + 1) * p.out_size];
        for (cell, aggregator) in out.iter_mut().zip(states) {
            *cell = O::from_f64(aggregator.result());
        }
    }
    let value = builder.build(p.result_type.clone(), state.factory);
    state.push_owned(value);
}

// ---- Map ----

#[derive(Debug)]
pub(crate) struct MapParams {
    pub result_type: ValueType,
    pub function: MapFn,
}

pub(crate) fn op_map<I: Cell, O: Cell>(state: &mut State<'_>, param: u64) {
    let p: &MapParams = state.stash(param);
    let input = state.pop();
    let cells = I::unwrap(input.cells());
    let index = input.index();
    let size = p.result_type.dense_subspace_size();
    let mut builder = ValueBuilder::<O>::new(&p.result_type, index.size());
    for s in 0..index.size() {
        let (out, _) = builder.add_subspace(index.labels(s));
        for (cell, c) in out.iter_mut().zip(&cells[s * size..(s + 1) * size]) {
            *cell = O::from_f64(p.function.apply(c.to_f64()));
        }
    }
    let value = builder.build(p.result_type.clone(), state.factory);
    state.push_owned(value);
}

pub(crate) fn op_cell_cast<I: Cell, O: Cell>(state: &mut State<'_>, param: u64) {
    let ty: &ValueType = state.stash(param);
    let input = state.pop();
    let cells = I::unwrap(input.cells());
    let index = input.index();
    let size = ty.dense_subspace_size();
    let mut builder = ValueBuilder::<O>::new(ty, index.size());
    for s in 0..index.size() {
        let (out, _) = builder.add_subspace(index.labels(s));
        for (cell, c) in out.iter_mut().zip(&cells[s * size..(s + 1) * size]) {
            *cell = O::from_f64(c.to_f64());
        }
    }
    let value = builder.build(ty.clone(), state.factory);
    state.push_owned(value);
}

// ---- Concat ----

#[derive(Debug)]
pub(crate) struct ConcatParams {
    result_type: ValueType,
    sparse: SparseJoinPlan,
    out_stride: Vec<usize>,
    lhs_loop: Vec<usize>,
    lhs_stride: Vec<usize>,
    rhs_loop: Vec<usize>,
    rhs_stride: Vec<usize>,
    /// Where the rhs block starts along the concat dimension.
    rhs_offset: usize,
    lhs_size: usize,
    rhs_size: usize,
}

impl ConcatParams {
    pub fn new(lhs: &ValueType, rhs: &ValueType, result: &ValueType, dim: &str) -> Self {
        let extent = |ty: &ValueType| ty.dimension(dim).map_or(1, |d| d.size as usize);
        let dims = result.indexed_dimensions();
        let loop_of = |ty: &ValueType| -> Vec<usize> {
            dims.iter().map(|d| if d.name == dim { extent(ty) } else { d.size as usize }).collect()
        };
        ConcatParams {
            result_type: result.clone(),
            sparse: SparseJoinPlan::new(lhs, rhs, result),
            out_stride: dims.iter().map(|d| stride_of(result, &d.name)).collect(),
            lhs_loop: loop_of(lhs),
            lhs_stride: dims.iter().map(|d| stride_of(lhs, &d.name)).collect(),
            rhs_loop: loop_of(rhs),
            rhs_stride: dims.iter().map(|d| stride_of(rhs, &d.name)).collect(),
            rhs_offset: extent(lhs) * stride_of(result, dim),
            lhs_size: lhs.dense_subspace_size(),
            rhs_size: rhs.dense_subspace_size(),
        }
    }
}

pub(crate) fn op_concat<O: Cell>(state: &mut State<'_>, param: u64) {
    let p: &ConcatParams = state.stash(param);
    let rhs = state.pop();
    let lhs = state.pop();
    let (lc, rc) = (lhs.cells(), rhs.cells());
    let mut builder = ValueBuilder::<O>::new(&p.result_type, lhs.index().size().max(rhs.index().size()));
    p.sparse.for_each_match(lhs.index(), rhs.index(), |i, j, labels| {
        let (out, _) = builder.add_subspace(labels);
        run_nested_loop2((0, i * p.lhs_size), &p.lhs_loop, &p.out_stride, &p.lhs_stride, |o, a| {
            out[o] = O::from_f64(lc.get(a));
        });
        run_nested_loop2((p.rhs_offset, j * p.rhs_size), &p.rhs_loop, &p.out_stride, &p.rhs_stride, |o, b| {
            out[o] = O::from_f64(rc.get(b));
        });
    });
    let value = builder.build(p.result_type.clone(), state.factory);
    state.push_owned(value);
}

// ---- Rename ----

#[derive(Debug)]
pub(crate) struct RenameParams {
    result_type: ValueType,
    /// For each result label position, the input label position it comes from.
    label_order: Vec<usize>,
    loop_cnt: Vec<usize>,
    in_stride: Vec<usize>,
    out_stride: Vec<usize>,
    size: usize,
}

impl RenameParams {
    pub fn new(input: &ValueType, result: &ValueType, from: &[String], to: &[String]) -> Self {
        let renamed = |name: &str| -> String {
            match from.iter().position(|f| f == name) {
                Some(i) => to[i].clone(),
                None => name.to_string(),
            }
        };
        let input_mapped: Vec<String> = input.mapped_dimensions().iter().map(|d| renamed(&d.name)).collect();
        let label_order = result
            .mapped_dimensions()
            .iter()
            .map(|d| input_mapped.iter().position(|n| *n == d.name).unwrap_or_else(|| unreachable!("rename lost {}", d.name)))
            .collect();
        let loop_cnt = indexed_sizes(input);
        RenameParams {
            result_type: result.clone(),
            label_order,
            in_stride: row_major_strides(&loop_cnt),
            out_stride: input.indexed_dimensions().iter().map(|d| stride_of(result, &renamed(&d.name))).collect(),
            loop_cnt,
            size: input.dense_subspace_size(),
        }
    }
}

pub(crate) fn op_rename<T: Cell>(state: &mut State<'_>, param: u64) {
    let p: &RenameParams = state.stash(param);
    let input = state.pop();
    let cells = T::unwrap(input.cells());
    let index = input.index();
    let mut builder = ValueBuilder::<T>::new(&p.result_type, index.size());
    let mut labels: Vec<&str> = Vec::with_capacity(p.label_order.len());
    for s in 0..index.size() {
        let source = index.labels(s);
        labels.clear();
        labels.extend(p.label_order.iter().map(|&k| source[k].as_str()));
        let (out, _) = builder.add_subspace(&labels);
        run_nested_loop2((s * p.size, 0), &p.loop_cnt, &p.in_stride, &p.out_stride, |i, o| out[o] = cells[i]);
    }
    let value = builder.build(p.result_type.clone(), state.factory);
    state.push_owned(value);
}

// ---- Create ----

#[derive(Debug)]
pub(crate) struct CreateParams {
    result_type: ValueType,
    /// Labels and dense offset of each cell, in child order.
    cells: Vec<(Vec<String>, usize)>,
}

impl CreateParams {
    pub fn new<'t>(ty: &ValueType, addresses: impl Iterator<Item = &'t TensorAddress>) -> Self {
        let strides = row_major_strides(&indexed_sizes(ty));
        let cells = addresses
            .map(|address| {
                let labels = ty
                    .mapped_dimensions()
                    .iter()
                    .map(|d| match address.get(&d.name) {
                        Some(Label::Mapped(s)) => s.clone(),
                        Some(Label::Indexed(i)) => i.to_string(),
                        None => String::new(),
                    })
                    .collect();
                let offset = ty
                    .indexed_dimensions()
                    .iter()
                    .zip(&strides)
                    .map(|(d, stride)| match address.get(&d.name) {
                        Some(Label::Indexed(i)) => i * stride,
                        _ => 0,
                    })
                    .sum();
                (labels, offset)
            })
            .collect();
        CreateParams { result_type: ty.clone(), cells }
    }
}

/// Pops one scalar per cell; later duplicates of an address win.
pub(crate) fn op_create<O: Cell>(state: &mut State<'_>, param: u64) {
    let p: &CreateParams = state.stash(param);
    let n = p.cells.len();
    let mut builder = ValueBuilder::<O>::new(&p.result_type, n);
    for (k, (labels, offset)) in p.cells.iter().enumerate() {
        let v = state.peek(n - 1 - k).as_double();
        builder.add_subspace(labels).0[*offset] = O::from_f64(v);
    }
    let value = builder.build(p.result_type.clone(), state.factory);
    state.replace(n, ValueRef::Owned(value));
}

// ---- Peek ----

#[derive(Debug)]
enum PeekSource<T> {
    Fixed(T),
    /// Position among the expression operands.
    Expr(usize),
}

#[derive(Debug)]
enum PeekDim {
    Mapped { position: usize, label: PeekSource<String> },
    Indexed { stride: usize, size: u32, index: PeekSource<usize> },
}

#[derive(Debug)]
pub(crate) struct PeekParams {
    result_type: ValueType,
    dims: Vec<PeekDim>,
    num_exprs: usize,
    kept: Vec<usize>,
    loop_cnt: Vec<usize>,
    in_stride: Vec<usize>,
    in_size: usize,
}

impl PeekParams {
    pub fn new(input: &ValueType, result: &ValueType, spec: &[(String, PeekTarget)]) -> Self {
        let mapped = input.mapped_dimensions();
        let mut num_exprs = 0;
        let mut dims = Vec::with_capacity(spec.len());
        for (name, target) in spec {
            let mut next_expr = || {
                num_exprs += 1;
                num_exprs - 1
            };
            let Some(dim) = input.dimension(name) else { continue };
            if dim.is_mapped() {
                let label = match target {
                    PeekTarget::Label(Label::Mapped(s)) => PeekSource::Fixed(s.clone()),
                    PeekTarget::Label(Label::Indexed(i)) => PeekSource::Fixed(i.to_string()),
                    PeekTarget::Child(_) => PeekSource::Expr(next_expr()),
                };
                let position = mapped.iter().position(|d| d.name == *name).unwrap_or_default();
                dims.push(PeekDim::Mapped { position, label });
            } else {
                let index = match target {
                    PeekTarget::Label(Label::Indexed(i)) => PeekSource::Fixed(*i),
                    PeekTarget::Label(Label::Mapped(_)) => PeekSource::Fixed(usize::MAX),
                    PeekTarget::Child(_) => PeekSource::Expr(next_expr()),
                };
                dims.push(PeekDim::Indexed { stride: stride_of(input, name), size: dim.size, index });
            }
        }
        let kept = result
            .mapped_dimensions()
            .iter()
            .filter_map(|d| mapped.iter().position(|m| m.name == d.name))
            .collect();
        let remaining = result.indexed_dimensions();
        PeekParams {
            result_type: result.clone(),
            dims,
            num_exprs,
            kept,
            loop_cnt: remaining.iter().map(|d| d.size as usize).collect(),
            in_stride: remaining.iter().map(|d| stride_of(input, &d.name)).collect(),
            in_size: input.dense_subspace_size(),
        }
    }
}

/// Stack: the peeked value, then one scalar per computed label.
pub(crate) fn op_peek<O: Cell>(state: &mut State<'_>, param: u64) {
    let p: &PeekParams = state.stash(param);
    let m = p.num_exprs;
    let exprs: Vec<f64> = (0..m).map(|k| state.peek(m - 1 - k).as_double()).collect();
    let mut wanted: Vec<(usize, String)> = Vec::new();
    let mut dense_base = 0;
    let mut in_bounds = true;
    for dim in &p.dims {
        match dim {
            PeekDim::Mapped { position, label } => {
                let label = match label {
                    PeekSource::Fixed(s) => s.clone(),
                    PeekSource::Expr(k) => label_from_number(exprs[*k]),
                };
                wanted.push((*position, label));
            }
            PeekDim::Indexed { stride, size, index } => {
                let index = match index {
                    PeekSource::Fixed(i) => (*i < *size as usize).then_some(*i),
                    PeekSource::Expr(k) => index_from_number(exprs[*k], *size),
                };
                match index {
                    Some(i) => dense_base += i * stride,
                    None => in_bounds = false,
                }
            }
        }
    }
    let value = {
        let input = state.peek(m);
        let (cells, index) = (input.cells(), input.index());
        let mut builder = ValueBuilder::<O>::new(&p.result_type, 1);
        if in_bounds {
            let mut kept: Vec<&str> = Vec::with_capacity(p.kept.len());
            for s in 0..index.size() {
                let labels = index.labels(s);
                if !wanted.iter().all(|(pos, l)| labels[*pos] == *l) {
                    continue;
                }
                kept.clear();
                kept.extend(p.kept.iter().map(|&k| labels[k].as_str()));
                let (out, _) = builder.add_subspace(&kept);
                let mut o = 0;
                run_nested_loop(s * p.in_size + dense_base, &p.loop_cnt, &p.in_stride, |i| {
                    out[o] = O::from_f64(cells.get(i));
                    o += 1;
                });
            }
        }
        builder.build(p.result_type.clone(), state.factory)
    };
    state.replace(m + 1, ValueRef::Owned(value));
}
