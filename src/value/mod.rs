//! Runtime values: typed cells plus an index over their dense subspaces.

use std::fmt;
use std::ops::Deref;

use crate::sparse::FastSparseMap;
use crate::types::ValueType;

pub mod cells;
pub mod spec;

pub use cells::{BFloat16, Cell, CellVec, CellsMut, TypedCells};
pub use spec::{Label, TensorAddress, TensorSpec, spec_from_value, value_from_spec};

// ---- Accounting ----

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MemoryUsage {
    pub allocated_bytes: usize,
    pub used_bytes: usize,
}

impl MemoryUsage {
    pub fn merge(&mut self, other: MemoryUsage) {
        self.allocated_bytes += other.allocated_bytes;
        self.used_bytes += other.used_bytes;
    }

    pub fn of_cells(cells: &CellVec) -> MemoryUsage {
        MemoryUsage {
            allocated_bytes: cells.capacity_bytes(),
            used_bytes: cells.len() * cells.cell_type().size_of(),
        }
    }
}

// ---- Core traits ----

/// Maps subspace ordinals to mapped-dimension label tuples and back.
/// Labels are listed in the order of the value type's mapped dimensions.
pub trait Index: Send + Sync {
    fn size(&self) -> usize;
    fn labels(&self, subspace: usize) -> &[String];
    fn lookup(&self, labels: &[&str]) -> Option<usize>;
}

pub trait Value: fmt::Debug + Send + Sync {
    fn value_type(&self) -> &ValueType;
    fn cells(&self) -> TypedCells<'_>;
    fn index(&self) -> &dyn Index;

    /// Scalar view: the sum of all cells, NaN for the error sentinel.
    fn as_double(&self) -> f64 {
        if self.value_type().is_error() {
            return f64::NAN;
        }
        let cells = self.cells();
        (0..cells.len()).map(|i| cells.get(i)).sum()
    }

    /// Mutable cells for values that own their buffer.
    fn cells_mut(&mut self) -> Option<CellsMut<'_>> {
        None
    }

    fn memory_usage(&self) -> MemoryUsage;
}

impl Index for FastSparseMap {
    fn size(&self) -> usize {
        FastSparseMap::size(self)
    }

    fn labels(&self, subspace: usize) -> &[String] {
        FastSparseMap::labels(self, subspace as u32)
    }

    fn lookup(&self, labels: &[&str]) -> Option<usize> {
        match FastSparseMap::lookup(self, labels) {
            n if n == FastSparseMap::npos() => None,
            n => Some(n as usize),
        }
    }
}

/// Index of a value with no mapped dimensions: exactly one subspace.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrivialIndex;

impl Index for TrivialIndex {
    fn size(&self) -> usize {
        1
    }

    fn labels(&self, _subspace: usize) -> &[String] {
        &[]
    }

    fn lookup(&self, labels: &[&str]) -> Option<usize> {
        labels.is_empty().then_some(0)
    }
}

// ---- Scalars ----

#[derive(Debug, Clone)]
pub struct DoubleValue {
    value: f64,
    ty: ValueType,
}

impl DoubleValue {
    pub fn new(value: f64) -> Self {
        DoubleValue { value, ty: ValueType::double_type() }
    }
}

impl Value for DoubleValue {
    fn value_type(&self) -> &ValueType {
        &self.ty
    }

    fn cells(&self) -> TypedCells<'_> {
        TypedCells::Double(std::slice::from_ref(&self.value))
    }

    fn index(&self) -> &dyn Index {
        &TrivialIndex
    }

    fn as_double(&self) -> f64 {
        self.value
    }

    fn cells_mut(&mut self) -> Option<CellsMut<'_>> {
        Some(CellsMut::Double(std::slice::from_mut(&mut self.value)))
    }

    fn memory_usage(&self) -> MemoryUsage {
        let size = std::mem::size_of::<Self>();
        MemoryUsage { allocated_bytes: size, used_bytes: size }
    }
}

static ERROR_CELL: [f64; 1] = [f64::NAN];

/// The scalar-error sentinel produced by expressions that fail type checking.
#[derive(Debug, Clone)]
pub struct ErrorValue {
    ty: ValueType,
}

impl ErrorValue {
    pub fn new() -> Self {
        ErrorValue { ty: ValueType::error_type() }
    }
}

impl Default for ErrorValue {
    fn default() -> Self {
        Self::new()
    }
}

impl Value for ErrorValue {
    fn value_type(&self) -> &ValueType {
        &self.ty
    }

    fn cells(&self) -> TypedCells<'_> {
        TypedCells::Double(&ERROR_CELL)
    }

    fn index(&self) -> &dyn Index {
        &TrivialIndex
    }

    fn memory_usage(&self) -> MemoryUsage {
        let size = std::mem::size_of::<Self>();
        MemoryUsage { allocated_bytes: size, used_bytes: size }
    }
}

// ---- Backends ----

/// Value backed by a hashed sparse map.
#[derive(Debug, Clone)]
pub struct FastValue {
    ty: ValueType,
    index: FastSparseMap,
    cells: CellVec,
}

impl FastValue {
    pub fn new(ty: ValueType, index: FastSparseMap, cells: CellVec) -> Self {
        debug_assert_eq!(index.num_dims(), ty.count_mapped_dimensions());
        debug_assert_eq!(cells.len(), index.size() * ty.dense_subspace_size());
        FastValue { ty, index, cells }
    }
}

impl Value for FastValue {
    fn value_type(&self) -> &ValueType {
        &self.ty
    }

    fn cells(&self) -> TypedCells<'_> {
        self.cells.as_cells()
    }

    fn index(&self) -> &dyn Index {
        &self.index
    }

    fn cells_mut(&mut self) -> Option<CellsMut<'_>> {
        Some(self.cells.as_cells_mut())
    }

    fn memory_usage(&self) -> MemoryUsage {
        let mut usage = MemoryUsage::of_cells(&self.cells);
        usage.merge(self.index.memory_usage());
        usage
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimpleIndex {
    addresses: Vec<Box<[String]>>,
}

impl Index for SimpleIndex {
    fn size(&self) -> usize {
        self.addresses.len()
    }

    fn labels(&self, subspace: usize) -> &[String] {
        &self.addresses[subspace]
    }

    fn lookup(&self, labels: &[&str]) -> Option<usize> {
        self.addresses.iter().position(|addr| {
            addr.len() == labels.len() && addr.iter().zip(labels).all(|(a, b)| a == b)
        })
    }
}

/// Reference backend: linear address list, no hashing.
#[derive(Debug, Clone)]
pub struct SimpleValue {
    ty: ValueType,
    index: SimpleIndex,
    cells: CellVec,
}

impl Value for SimpleValue {
    fn value_type(&self) -> &ValueType {
        &self.ty
    }

    fn cells(&self) -> TypedCells<'_> {
        self.cells.as_cells()
    }

    fn index(&self) -> &dyn Index {
        &self.index
    }

    fn cells_mut(&mut self) -> Option<CellsMut<'_>> {
        Some(self.cells.as_cells_mut())
    }

    fn memory_usage(&self) -> MemoryUsage {
        let mut usage = MemoryUsage::of_cells(&self.cells);
        let labels: usize = self.index.addresses.iter().flat_map(|a| a.iter()).map(|l| l.capacity()).sum();
        usage.merge(MemoryUsage { allocated_bytes: labels, used_bytes: labels });
        usage
    }
}

// ---- Views ----

/// Same cells and index as the inner value under a different type.
/// Only valid when the new type lays out cells identically.
#[derive(Debug)]
pub struct Relabeled<'a> {
    ty: ValueType,
    inner: ValueRef<'a>,
}

impl<'a> Relabeled<'a> {
    pub fn new(ty: ValueType, inner: ValueRef<'a>) -> Self {
        debug_assert_eq!(ty.dense_subspace_size(), inner.value_type().dense_subspace_size());
        Relabeled { ty, inner }
    }
}

impl Value for Relabeled<'_> {
    fn value_type(&self) -> &ValueType {
        &self.ty
    }

    fn cells(&self) -> TypedCells<'_> {
        self.inner.cells()
    }

    fn index(&self) -> &dyn Index {
        self.inner.index()
    }

    fn cells_mut(&mut self) -> Option<CellsMut<'_>> {
        self.inner.as_mut().and_then(|v| v.cells_mut())
    }

    fn memory_usage(&self) -> MemoryUsage {
        self.inner.memory_usage()
    }
}

/// A dense block borrowed from another value, typed as that value's dense subspace.
#[derive(Debug)]
pub struct DenseView<'a> {
    ty: ValueType,
    cells: TypedCells<'a>,
}

impl<'a> DenseView<'a> {
    pub fn new(ty: ValueType, cells: TypedCells<'a>) -> Self {
        debug_assert!(ty.count_mapped_dimensions() == 0);
        DenseView { ty, cells }
    }
}

impl Value for DenseView<'_> {
    fn value_type(&self) -> &ValueType {
        &self.ty
    }

    fn cells(&self) -> TypedCells<'_> {
        self.cells
    }

    fn index(&self) -> &dyn Index {
        &TrivialIndex
    }

    fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage::default()
    }
}

/// A value on the interpreter stack: either borrowed from a parameter or
/// constant, or owned as an intermediate result.
pub enum ValueRef<'a> {
    Borrowed(&'a dyn Value),
    Owned(Box<dyn Value + 'a>),
}

impl<'a> ValueRef<'a> {
    pub fn as_mut(&mut self) -> Option<&mut (dyn Value + 'a)> {
        match self {
            ValueRef::Borrowed(_) => None,
            ValueRef::Owned(v) => Some(v.as_mut()),
        }
    }
}

impl<'a> Deref for ValueRef<'a> {
    type Target = dyn Value + 'a;

    fn deref(&self) -> &Self::Target {
        match self {
            ValueRef::Borrowed(v) => *v,
            ValueRef::Owned(v) => v.as_ref(),
        }
    }
}

impl fmt::Debug for ValueRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueRef::Borrowed(v) => f.debug_tuple("Borrowed").field(v).finish(),
            ValueRef::Owned(v) => f.debug_tuple("Owned").field(v).finish(),
        }
    }
}

// ---- Builders ----

/// Chooses the concrete backend for intermediate and result values.
pub trait ValueBuilderFactory: Send + Sync {
    fn name(&self) -> &'static str;

    /// `index` holds one tuple per subspace, `cells` the subspaces back to back.
    fn create_value(&self, ty: ValueType, index: FastSparseMap, cells: CellVec) -> Box<dyn Value>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FastValueBuilderFactory;

impl ValueBuilderFactory for FastValueBuilderFactory {
    fn name(&self) -> &'static str {
        "fast"
    }

    fn create_value(&self, ty: ValueType, index: FastSparseMap, cells: CellVec) -> Box<dyn Value> {
        if let Some(scalar) = scalar_result(&ty, &cells) {
            return scalar;
        }
        Box::new(FastValue::new(ty, index, cells))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleValueBuilderFactory;

impl ValueBuilderFactory for SimpleValueBuilderFactory {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn create_value(&self, ty: ValueType, index: FastSparseMap, cells: CellVec) -> Box<dyn Value> {
        if let Some(scalar) = scalar_result(&ty, &cells) {
            return scalar;
        }
        let addresses = (0..index.size()).map(|i| index.labels(i as u32).to_vec().into_boxed_slice()).collect();
        Box::new(SimpleValue { ty, index: SimpleIndex { addresses }, cells })
    }
}

fn scalar_result(ty: &ValueType, cells: &CellVec) -> Option<Box<dyn Value>> {
    if ty.is_error() {
        return Some(Box::new(ErrorValue::new()));
    }
    if ty.is_double() {
        let v = if cells.is_empty() { 0.0 } else { cells.as_cells().get(0) };
        return Some(Box::new(DoubleValue::new(v)));
    }
    None
}

/// Accumulates subspaces for one result value.
pub struct ValueBuilder<T: Cell> {
    index: FastSparseMap,
    cells: Vec<T>,
    subspace_size: usize,
}

impl<T: Cell> ValueBuilder<T> {
    pub fn new(ty: &ValueType, expected_subspaces: usize) -> Self {
        let subspace_size = ty.dense_subspace_size();
        ValueBuilder {
            index: FastSparseMap::with_capacity(ty.count_mapped_dimensions(), expected_subspaces),
            cells: Vec::with_capacity(expected_subspaces * subspace_size),
            subspace_size,
        }
    }

    /// Cells of the subspace with the given labels, created zero-filled on
    /// first use. The flag tells whether it was just created.
    pub fn add_subspace<L: AsRef<str>>(&mut self, labels: &[L]) -> (&mut [T], bool) {
        let ordinal = self.index.add_mapping(labels) as usize;
        let start = ordinal * self.subspace_size;
        let is_new = start == self.cells.len();
        if is_new {
            self.cells.resize(start + self.subspace_size, T::default());
        }
        (&mut self.cells[start..start + self.subspace_size], is_new)
    }

    /// Values without mapped dimensions always get their single subspace.
    pub fn build(mut self, ty: ValueType, factory: &dyn ValueBuilderFactory) -> Box<dyn Value> {
        if self.index.num_dims() == 0 && self.index.is_empty() {
            let empty: [&str; 0] = [];
            self.add_subspace(&empty);
        }
        factory.create_value(ty, self.index, T::wrap_vec(self.cells))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(spec: &str) -> ValueType {
        ValueType::from_spec(spec)
    }

    #[test]
    fn builder_fills_dense_subspace() {
        let t = ty("tensor(x[3])");
        let builder = ValueBuilder::<f64>::new(&t, 1);
        let value = builder.build(t.clone(), &FastValueBuilderFactory);
        assert_eq!(value.index().size(), 1);
        assert_eq!(value.cells().to_f64_vec(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn builder_reuses_subspaces() {
        let t = ty("tensor<float>(k{},x[2])");
        let mut builder = ValueBuilder::<f32>::new(&t, 2);
        let (cells, is_new) = builder.add_subspace(&["a"]);
        assert!(is_new);
        cells[1] = 2.0;
        let (cells, is_new) = builder.add_subspace(&["a"]);
        assert!(!is_new);
        cells[0] = 1.0;
        builder.add_subspace(&["b"]).0[0] = 5.0;
        let value = builder.build(t, &SimpleValueBuilderFactory);
        assert_eq!(value.index().size(), 2);
        assert_eq!(value.index().lookup(&["b"]), Some(1));
        assert_eq!(value.cells().to_f64_vec(), vec![1.0, 2.0, 5.0, 0.0]);
        assert_eq!(value.as_double(), 8.0);
    }

    #[test]
    fn scalar_results_become_doubles() {
        let v = FastValueBuilderFactory.create_value(ValueType::double_type(), FastSparseMap::new(0), CellVec::Double(vec![4.5]));
        assert_eq!(v.as_double(), 4.5);
        assert!(v.value_type().is_double());
    }

    #[test]
    fn error_value_is_nan() {
        let v = ErrorValue::new();
        assert!(v.as_double().is_nan());
        assert!(v.value_type().is_error());
    }

    #[test]
    fn relabel_shares_cells_and_can_mutate_owned() {
        let t = ty("tensor(x[2])");
        let mut builder = ValueBuilder::<f64>::new(&t, 1);
        builder.add_subspace::<&str>(&[]).0.copy_from_slice(&[1.0, 2.0]);
        let inner = builder.build(t, &FastValueBuilderFactory);
        let mut relabeled = Relabeled::new(ty("tensor(x[2],y[1])"), ValueRef::Owned(inner));
        assert_eq!(relabeled.cells().to_f64_vec(), vec![1.0, 2.0]);
        if let Some(CellsMut::Double(cells)) = relabeled.cells_mut() {
            cells[0] = 9.0;
        }
        assert_eq!(relabeled.cells().get(0), 9.0);

        let borrowed = DoubleValue::new(1.0);
        let mut view = Relabeled::new(ValueType::double_type(), ValueRef::Borrowed(&borrowed));
        assert!(view.cells_mut().is_none());
    }

    #[test]
    fn memory_usage_counts_cells() {
        let v = FastValue::new(ty("tensor(x[4])"), {
            let mut m = FastSparseMap::new(0);
            m.add_mapping::<&str>(&[]);
            m
        }, CellVec::Double(vec![0.0; 4]));
        let usage = v.memory_usage();
        assert!(usage.used_bytes >= 32);
        assert!(usage.allocated_bytes >= usage.used_bytes);
    }
}
