//! Backend-neutral tensor representation: a type and a sorted address → cell map.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Cell, Value, ValueBuilder, ValueBuilderFactory};
use crate::nested_loop::row_major_strides;
use crate::types::ValueType;
use crate::with_cell_type;

/// One coordinate of a cell address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Label {
    Indexed(usize),
    Mapped(String),
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Indexed(i) => write!(f, "{i}"),
            Label::Mapped(s) => f.write_str(s),
        }
    }
}

pub type TensorAddress = BTreeMap<String, Label>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CellEntry {
    address: TensorAddress,
    value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RawSpec {
    #[serde(rename = "type")]
    value_type: ValueType,
    cells: Vec<CellEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "RawSpec", from = "RawSpec")]
pub struct TensorSpec {
    value_type: ValueType,
    cells: BTreeMap<TensorAddress, f64>,
}

impl From<TensorSpec> for RawSpec {
    fn from(spec: TensorSpec) -> Self {
        let cells = spec.cells.into_iter().map(|(address, value)| CellEntry { address, value }).collect();
        RawSpec { value_type: spec.value_type, cells }
    }
}

impl From<RawSpec> for TensorSpec {
    fn from(raw: RawSpec) -> Self {
        let mut spec = TensorSpec::new(raw.value_type);
        for entry in raw.cells {
            spec.add(entry.address, entry.value);
        }
        spec
    }
}

impl TensorSpec {
    pub fn new(value_type: ValueType) -> Self {
        TensorSpec { value_type, cells: BTreeMap::new() }
    }

    pub fn from_double(v: f64) -> Self {
        let mut spec = TensorSpec::new(ValueType::double_type());
        spec.add(TensorAddress::new(), v);
        spec
    }

    pub fn error() -> Self {
        TensorSpec::new(ValueType::error_type())
    }

    /// Parse tensor literal text, e.g. `tensor(x{}):{{x:a}:1}` or `tensor(x[2]):[1,2]`.
    pub fn from_expr(text: &str) -> Result<Self, crate::parser::ParseError> {
        crate::parser::parse_tensor_spec(text)
    }

    pub fn value_type(&self) -> &ValueType {
        &self.value_type
    }

    pub fn cells(&self) -> &BTreeMap<TensorAddress, f64> {
        &self.cells
    }

    /// Set one cell, replacing any previous value at that address.
    pub fn add(&mut self, address: TensorAddress, value: f64) -> &mut Self {
        self.cells.insert(address, value);
        self
    }

    /// Shorthand for building addresses in tests and literals.
    pub fn add_cell(&mut self, labels: &[(&str, Label)], value: f64) -> &mut Self {
        let address = labels.iter().map(|(d, l)| (d.to_string(), l.clone())).collect();
        self.add(address, value)
    }

    /// Scalar view: the sum of all cells, NaN for the error type.
    pub fn as_double(&self) -> f64 {
        if self.value_type.is_error() {
            return f64::NAN;
        }
        self.cells.values().sum()
    }

    /// Canonical form: dense blocks filled with zeros, cells cast to the cell type,
    /// addresses outside the type dropped.
    pub fn normalize(&self) -> TensorSpec {
        let ty = &self.value_type;
        if ty.is_error() {
            return TensorSpec::error();
        }
        let ct = ty.cell_type();
        let cast = |v: f64| with_cell_type!(ct, T => T::from_f64(v).to_f64());
        let mut out = TensorSpec::new(ty.clone());
        let mut sparse_parts: Vec<TensorAddress> = Vec::new();
        for (address, &value) in &self.cells {
            if !self.address_fits(address) {
                continue;
            }
            let sparse: TensorAddress = address
                .iter()
                .filter(|(_, l)| matches!(l, Label::Mapped(_)))
                .map(|(d, l)| (d.clone(), l.clone()))
                .collect();
            if !sparse_parts.contains(&sparse) {
                sparse_parts.push(sparse);
            }
            *out.cells.entry(address.clone()).or_insert(0.0) = cast(value);
        }
        if ty.count_mapped_dimensions() == 0 && sparse_parts.is_empty() {
            sparse_parts.push(TensorAddress::new());
        }
        let indexed: Vec<(String, usize)> =
            ty.indexed_dimensions().iter().map(|d| (d.name.clone(), d.size as usize)).collect();
        for sparse in sparse_parts {
            for_each_dense_address(&indexed, |dense| {
                let mut address = sparse.clone();
                address.extend(dense.iter().map(|(d, i)| (d.clone(), Label::Indexed(*i))));
                out.cells.entry(address).or_insert(0.0);
            });
        }
        out
    }

    fn address_fits(&self, address: &TensorAddress) -> bool {
        let dims = self.value_type.dimensions();
        address.len() == dims.len()
            && dims.iter().all(|d| match address.get(&d.name) {
                Some(Label::Mapped(_)) => d.is_mapped(),
                Some(Label::Indexed(i)) => d.is_indexed() && (*i as u64) < d.size as u64,
                None => false,
            })
    }

    /// Equal types and, after normalizing both sides, equal cells within a relative tolerance.
    pub fn approx_eq(&self, other: &TensorSpec, tolerance: f64) -> bool {
        if self.value_type != other.value_type {
            return false;
        }
        let a = self.normalize();
        let b = other.normalize();
        a.cells.len() == b.cells.len()
            && a.cells.iter().zip(b.cells.iter()).all(|((ka, va), (kb, vb))| ka == kb && approx(*va, *vb, tolerance))
    }
}

pub(crate) fn approx(a: f64, b: f64, tolerance: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return a.is_nan() && b.is_nan();
    }
    if a == b {
        return true;
    }
    (a - b).abs() <= tolerance * a.abs().max(b.abs()).max(1.0)
}

/// Every address of the given indexed dimensions, row-major.
pub(crate) fn for_each_dense_address<F: FnMut(&[(String, usize)])>(dims: &[(String, usize)], mut f: F) {
    if dims.iter().any(|(_, size)| *size == 0) {
        return;
    }
    let mut current: Vec<(String, usize)> = dims.iter().map(|(d, _)| (d.clone(), 0)).collect();
    loop {
        f(&current);
        let mut level = dims.len();
        loop {
            if level == 0 {
                return;
            }
            level -= 1;
            current[level].1 += 1;
            if current[level].1 < dims[level].1 {
                break;
            }
            current[level].1 = 0;
        }
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{{", self.value_type)?;
        for (i, (address, value)) in self.cells.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str("{")?;
            for (j, (dim, label)) in address.iter().enumerate() {
                if j > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{dim}:{label}")?;
            }
            write!(f, "}}:{value}")?;
        }
        f.write_str("}")
    }
}

// ---- Conversion to and from runtime values ----

/// Build a runtime value through the given backend. Cells whose address does
/// not fit the type are skipped.
pub fn value_from_spec(spec: &TensorSpec, factory: &dyn ValueBuilderFactory) -> Box<dyn Value> {
    let ty = spec.value_type.clone();
    if ty.is_error() || ty.is_double() {
        let cells = super::CellVec::Double(vec![spec.as_double()]);
        return factory.create_value(ty, crate::sparse::FastSparseMap::new(0), cells);
    }
    let mapped: Vec<String> = ty.mapped_dimensions().iter().map(|d| d.name.clone()).collect();
    let indexed: Vec<(String, usize)> =
        ty.indexed_dimensions().iter().map(|d| (d.name.clone(), d.size as usize)).collect();
    let sizes: Vec<usize> = indexed.iter().map(|(_, s)| *s).collect();
    let strides = row_major_strides(&sizes);
    with_cell_type!(ty.cell_type(), T => {
        let mut builder = ValueBuilder::<T>::new(&ty, spec.cells.len());
        for (address, &value) in &spec.cells {
            if !spec.address_fits(address) {
                continue;
            }
            let labels: Vec<&str> = mapped
                .iter()
                .map(|d| match &address[d] {
                    Label::Mapped(s) => s.as_str(),
                    Label::Indexed(_) => unreachable!("address_fits checked label kinds"),
                })
                .collect();
            let offset: usize = indexed
                .iter()
                .zip(&strides)
                .map(|((d, _), stride)| match &address[d] {
                    Label::Indexed(i) => i * stride,
                    Label::Mapped(_) => unreachable!("address_fits checked label kinds"),
                })
                .sum();
            let (cells, _) = builder.add_subspace(&labels);
            cells[offset] = T::from_f64(value);
        }
        builder.build(ty.clone(), factory)
    })
}

/// Read any value back into its canonical spec form.
pub fn spec_from_value(value: &dyn Value) -> TensorSpec {
    let ty = value.value_type().clone();
    if ty.is_error() {
        return TensorSpec::error();
    }
    if ty.is_double() {
        return TensorSpec::from_double(value.as_double());
    }
    let mapped: Vec<String> = ty.mapped_dimensions().iter().map(|d| d.name.clone()).collect();
    let indexed: Vec<(String, usize)> =
        ty.indexed_dimensions().iter().map(|d| (d.name.clone(), d.size as usize)).collect();
    let subspace_size = ty.dense_subspace_size();
    let cells = value.cells();
    let index = value.index();
    let mut spec = TensorSpec::new(ty.clone());
    for subspace in 0..index.size() {
        let labels = index.labels(subspace);
        let mut offset = subspace * subspace_size;
        for_each_dense_address(&indexed, |dense| {
            let mut address: TensorAddress =
                mapped.iter().zip(labels).map(|(d, l)| (d.clone(), Label::Mapped(l.clone()))).collect();
            address.extend(dense.iter().map(|(d, i)| (d.clone(), Label::Indexed(*i))));
            spec.cells.insert(address, cells.get(offset));
            offset += 1;
        });
    }
    spec
}
