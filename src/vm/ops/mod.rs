//! Instruction kernels and the plans they share.

use std::sync::Arc;

use crate::ast::Aggr;
use crate::sparse::FastSparseMap;
use crate::types::ValueType;
use crate::value::{Index, Value, ValueRef};

use super::State;

pub(crate) mod dense;
pub(crate) mod generic;
pub(crate) mod nested;

// ---- Control ----

pub(crate) fn op_load_const(state: &mut State<'_>, param: u64) {
    let value: &Arc<dyn Value> = state.stash(param);
    state.push(ValueRef::Borrowed(value.as_ref()));
}

pub(crate) fn op_load_param(state: &mut State<'_>, param: u64) {
    let value = state.params[param as usize];
    state.push(ValueRef::Borrowed(value));
}

pub(crate) fn op_jump(state: &mut State<'_>, param: u64) {
    state.program_counter = param as usize;
}

pub(crate) fn op_jump_if_false(state: &mut State<'_>, param: u64) {
    let cond = state.pop();
    if cond.as_double() == 0.0 {
        state.program_counter = param as usize;
    }
}

// ---- Dense layout ----

/// Row-major stride of `dim` within the dense subspace of `ty`, 0 when the
/// type lacks the dimension.
pub(crate) fn stride_of(ty: &ValueType, dim: &str) -> usize {
    let mut stride = 1;
    for d in ty.indexed_dimensions().iter().rev() {
        if d.name == dim {
            return stride;
        }
        stride *= d.size as usize;
    }
    0
}

/// Loop nest over the dense subspace of a join result, with the matching
/// offsets into each operand's dense subspace.
#[derive(Debug, Clone)]
pub(crate) struct DenseJoinPlan {
    pub loop_cnt: Vec<usize>,
    pub lhs_stride: Vec<usize>,
    pub rhs_stride: Vec<usize>,
    pub lhs_size: usize,
    pub rhs_size: usize,
}

impl DenseJoinPlan {
    pub fn new(lhs: &ValueType, rhs: &ValueType, result: &ValueType) -> Self {
        let mut plan = DenseJoinPlan {
            loop_cnt: Vec::new(),
            lhs_stride: Vec::new(),
            rhs_stride: Vec::new(),
            lhs_size: lhs.dense_subspace_size(),
            rhs_size: rhs.dense_subspace_size(),
        };
        for d in result.indexed_dimensions() {
            plan.loop_cnt.push(d.size as usize);
            plan.lhs_stride.push(stride_of(lhs, &d.name));
            plan.rhs_stride.push(stride_of(rhs, &d.name));
        }
        plan
    }
}

// ---- Sparse layout ----

#[derive(Debug, Clone, Copy)]
enum Source {
    Lhs(usize),
    Rhs(usize),
}

/// Pairs up operand subspaces that agree on their common mapped dimensions
/// and assembles the result labels in the result's mapped-dimension order.
#[derive(Debug, Clone)]
pub(crate) struct SparseJoinPlan {
    sources: Vec<Source>,
    common: Vec<(usize, usize)>,
}

impl SparseJoinPlan {
    pub fn new(lhs: &ValueType, rhs: &ValueType, result: &ValueType) -> Self {
        let position = |ty: &ValueType, name: &str| ty.mapped_dimensions().iter().position(|d| d.name == name);
        let mut sources = Vec::new();
        let mut common = Vec::new();
        for d in result.mapped_dimensions() {
            match (position(lhs, &d.name), position(rhs, &d.name)) {
                (Some(l), Some(r)) => {
                    common.push((l, r));
                    sources.push(Source::Lhs(l));
                }
                (Some(l), None) => sources.push(Source::Lhs(l)),
                (None, Some(r)) => sources.push(Source::Rhs(r)),
                (None, None) => unreachable!("result dimension {} in neither operand", d.name),
            }
        }
        SparseJoinPlan { sources, common }
    }

    fn fill<'i>(&self, l: &'i [String], r: &'i [String], labels: &mut Vec<&'i str>) {
        labels.clear();
        labels.extend(self.sources.iter().map(|s| match *s {
            Source::Lhs(p) => l[p].as_str(),
            Source::Rhs(p) => r[p].as_str(),
        }));
    }

    /// Calls `f(lhs_subspace, rhs_subspace, result_labels)` for every
    /// matching pair, in lhs order.
    pub fn for_each_match<F: FnMut(usize, usize, &[&str])>(&self, lhs: &dyn Index, rhs: &dyn Index, mut f: F) {
        let mut labels: Vec<&str> = Vec::with_capacity(self.sources.len());
        if self.common.is_empty() {
            for i in 0..lhs.size() {
                for j in 0..rhs.size() {
                    self.fill(lhs.labels(i), rhs.labels(j), &mut labels);
                    f(i, j, &labels);
                }
            }
            return;
        }
        // Group rhs subspaces by their common labels.
        let mut groups = FastSparseMap::with_capacity(self.common.len(), rhs.size());
        let mut members: Vec<Vec<usize>> = Vec::new();
        let mut key: Vec<&str> = Vec::with_capacity(self.common.len());
        for j in 0..rhs.size() {
            let r = rhs.labels(j);
            key.clear();
            key.extend(self.common.iter().map(|&(_, p)| r[p].as_str()));
            let group = groups.add_mapping(&key) as usize;
            if group == members.len() {
                members.push(Vec::new());
            }
            members[group].push(j);
        }
        for i in 0..lhs.size() {
            let l = lhs.labels(i);
            key.clear();
            key.extend(self.common.iter().map(|&(p, _)| l[p].as_str()));
            let group = groups.lookup(&key);
            if group == FastSparseMap::npos() {
                continue;
            }
            for &j in &members[group as usize] {
                self.fill(l, rhs.labels(j), &mut labels);
                f(i, j, &labels);
            }
        }
    }
}

// ---- Aggregation ----

/// Running state of one aggregated cell.
#[derive(Debug, Clone)]
pub(crate) enum Aggregator {
    Avg { sum: f64, count: usize },
    Count(usize),
    Prod { prod: f64, count: usize },
    Sum(f64),
    Max { max: f64, count: usize },
    Min { min: f64, count: usize },
    Median(Vec<f64>),
}

impl Aggregator {
    pub fn new(aggr: Aggr) -> Self {
        match aggr {
            Aggr::Avg => Aggregator::Avg { sum: 0.0, count: 0 },
            Aggr::Count => Aggregator::Count(0),
            Aggr::Prod => Aggregator::Prod { prod: 1.0, count: 0 },
            Aggr::Sum => Aggregator::Sum(0.0),
            Aggr::Max => Aggregator::Max { max: f64::NEG_INFINITY, count: 0 },
            Aggr::Min => Aggregator::Min { min: f64::INFINITY, count: 0 },
            Aggr::Median => Aggregator::Median(Vec::new()),
        }
    }

    #[inline]
    pub fn add(&mut self, v: f64) {
        match self {
            Aggregator::Avg { sum, count } => {
                *sum += v;
                *count += 1;
            }
            Aggregator::Count(count) => *count += 1,
            Aggregator::Prod { prod, count } => {
                *prod *= v;
                *count += 1;
            }
            Aggregator::Sum(sum) => *sum += v,
            Aggregator::Max { max, count } => {
                *max = crate::ast::nan_max(*max, v);
                *count += 1;
            }
            Aggregator::Min { min, count } => {
                *min = crate::ast::nan_min(*min, v);
                *count += 1;
            }
            Aggregator::Median(values) => values.push(v),
        }
    }

    /// The empty aggregate is 0.
    pub fn result(&self) -> f64 {
        match self {
            Aggregator::Avg { count: 0, .. } => 0.0,
            Aggregator::Avg { sum, count } => sum / *count as f64,
            Aggregator::Count(count) => *count as f64,
            Aggregator::Prod { count: 0, .. } | Aggregator::Max { count: 0, .. } | Aggregator::Min { count: 0, .. } => 0.0,
            Aggregator::Prod { prod, .. } => *prod,
            Aggregator::Sum(sum) => *sum,
            Aggregator::Max { max, .. } => *max,
            Aggregator::Min { min, .. } => *min,
            Aggregator::Median(values) => crate::ast::median(values),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{FastValueBuilderFactory, TensorSpec, value_from_spec};

    #[test]
    fn strides_follow_indexed_dimensions() {
        let ty = ValueType::from_spec("tensor(a[2],k{},b[3],c[4])");
        assert_eq!(stride_of(&ty, "a"), 12);
        assert_eq!(stride_of(&ty, "b"), 4);
        assert_eq!(stride_of(&ty, "c"), 1);
        assert_eq!(stride_of(&ty, "k"), 0);
        assert_eq!(stride_of(&ty, "z"), 0);
    }

    #[test]
    fn sparse_plan_matches_common_labels() {
        let a = value_from_spec(&TensorSpec::from_expr("tensor(k{},m{}):{{k:a,m:x}:1,{k:b,m:y}:2}").unwrap(), &FastValueBuilderFactory);
        let b = value_from_spec(&TensorSpec::from_expr("tensor(k{},n{}):{{k:b,n:q}:3,{k:a,n:r}:4,{k:a,n:s}:5}").unwrap(), &FastValueBuilderFactory);
        let result = ValueType::join(a.value_type(), b.value_type());
        let plan = SparseJoinPlan::new(a.value_type(), b.value_type(), &result);
        let mut seen = Vec::new();
        plan.for_each_match(a.index(), b.index(), |i, j, labels| seen.push((i, j, labels.join("/"))));
        assert_eq!(
            seen,
            vec![(0, 0, "a/x/r".to_string()), (0, 1, "a/x/s".to_string()), (1, 2, "b/y/q".to_string())]
        );
    }

    #[test]
    fn aggregators_match_list_aggregation() {
        let values = [3.0, -1.0, 4.0, 1.5];
        for aggr in [Aggr::Avg, Aggr::Count, Aggr::Prod, Aggr::Sum, Aggr::Max, Aggr::Median, Aggr::Min] {
            let mut state = Aggregator::new(aggr);
            values.iter().for_each(|v| state.add(*v));
            assert_eq!(state.result(), aggr.aggregate(&values), "{}", aggr.name());
            assert_eq!(Aggregator::new(aggr).result(), 0.0);
        }
    }

    #[test]
    fn max_and_min_keep_nan() {
        for values in [[f64::NAN].as_slice(), &[1.0, f64::NAN, 2.0], &[f64::NAN, f64::INFINITY]] {
            for aggr in [Aggr::Max, Aggr::Min] {
                let mut state = Aggregator::new(aggr);
                values.iter().for_each(|v| state.add(*v));
                assert!(state.result().is_nan(), "{} {values:?}", aggr.name());
                assert!(aggr.aggregate(values).is_nan(), "{} {values:?}", aggr.name());
            }
        }
        let mut state = Aggregator::new(Aggr::Max);
        [f64::NEG_INFINITY, -1.0].iter().for_each(|v| state.add(*v));
        assert_eq!(state.result(), -1.0);
    }
}
