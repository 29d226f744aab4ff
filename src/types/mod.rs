//! Value types: ordered dimension sets plus a cell type.
//!
//! Every derived type is computed by a total function. Conflicts produce the
//! sticky error type, and any operation with an error operand yields it again.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod cell_type;
pub use cell_type::CellType;

const MAPPED_SIZE: u32 = u32::MAX;

/// Largest size an indexed dimension can have; `u32::MAX` marks a mapped one.
pub const MAX_INDEXED_SIZE: u32 = MAPPED_SIZE - 1;

/// One named axis of a value type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dimension {
    pub name: String,
    pub size: u32,
}

impl Dimension {
    pub fn mapped(name: impl Into<String>) -> Self {
        Dimension { name: name.into(), size: MAPPED_SIZE }
    }

    pub fn indexed(name: impl Into<String>, size: u32) -> Self {
        assert!(size <= MAX_INDEXED_SIZE, "indexed size {size} collides with the mapped marker");
        Dimension { name: name.into(), size }
    }

    pub fn is_mapped(&self) -> bool {
        self.size == MAPPED_SIZE
    }

    pub fn is_indexed(&self) -> bool {
        !self.is_mapped()
    }

    /// Indexed with size 1.
    pub fn is_trivial(&self) -> bool {
        self.is_indexed() && self.size == 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValueType {
    cell_type: CellType,
    dims: Vec<Dimension>,
    error: bool,
}

impl ValueType {
    pub fn error_type() -> Self {
        ValueType { cell_type: CellType::Double, dims: Vec::new(), error: true }
    }

    pub fn double_type() -> Self {
        ValueType { cell_type: CellType::Double, dims: Vec::new(), error: false }
    }

    /// Build a type from unordered dimensions. Duplicate names and empty
    /// indexed dimensions give the error type; no dimensions gives `double`.
    pub fn make_type(cell_type: CellType, mut dims: Vec<Dimension>) -> Self {
        dims.sort_by(|a, b| a.name.cmp(&b.name));
        if dims.windows(2).any(|w| w[0].name == w[1].name) || dims.iter().any(|d| d.size == 0) {
            return ValueType::error_type();
        }
        if dims.is_empty() {
            return ValueType::double_type();
        }
        ValueType { cell_type, dims, error: false }
    }

    /// Parse a type spec such as `tensor<float>(x{},y[3])`; malformed specs give the error type.
    pub fn from_spec(spec: &str) -> Self {
        crate::parser::parse_value_type(spec).unwrap_or_else(|_| ValueType::error_type())
    }

    pub fn to_spec(&self) -> String {
        if self.error {
            return "error".to_string();
        }
        if self.dims.is_empty() {
            return "double".to_string();
        }
        let mut out = String::from("tensor");
        if self.cell_type != CellType::Double {
            out.push('<');
            out.push_str(self.cell_type.name());
            out.push('>');
        }
        out.push('(');
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&d.name);
            if d.is_mapped() {
                out.push_str("{}");
            } else {
                out.push_str(&format!("[{}]", d.size));
            }
        }
        out.push(')');
        out
    }

    // ---- Queries ----

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn is_double(&self) -> bool {
        !self.error && self.dims.is_empty()
    }

    pub fn has_dimensions(&self) -> bool {
        !self.dims.is_empty()
    }

    pub fn cell_type(&self) -> CellType {
        self.cell_type
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn dimension_index(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|d| d.name == name)
    }

    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dims.iter().find(|d| d.name == name)
    }

    pub fn mapped_dimensions(&self) -> Vec<&Dimension> {
        self.dims.iter().filter(|d| d.is_mapped()).collect()
    }

    pub fn indexed_dimensions(&self) -> Vec<&Dimension> {
        self.dims.iter().filter(|d| d.is_indexed()).collect()
    }

    pub fn count_mapped_dimensions(&self) -> usize {
        self.dims.iter().filter(|d| d.is_mapped()).count()
    }

    pub fn count_indexed_dimensions(&self) -> usize {
        self.dims.iter().filter(|d| d.is_indexed()).count()
    }

    /// All dimensions indexed (and at least one of them).
    pub fn is_dense(&self) -> bool {
        !self.dims.is_empty() && self.dims.iter().all(Dimension::is_indexed)
    }

    pub fn is_mixed(&self) -> bool {
        self.count_mapped_dimensions() > 0 && self.count_indexed_dimensions() > 0
    }

    /// Number of cells in one subspace.
    pub fn dense_subspace_size(&self) -> usize {
        self.dims.iter().filter(|d| d.is_indexed()).map(|d| d.size as usize).product()
    }

    /// The type of one dense subspace: the indexed dimensions only.
    pub fn dense_subspace_type(&self) -> ValueType {
        if self.error {
            return ValueType::error_type();
        }
        let dims: Vec<Dimension> = self.dims.iter().filter(|d| d.is_indexed()).cloned().collect();
        ValueType::make_type(self.cell_type, dims)
    }

    pub fn same_dimensions(&self, other: &ValueType) -> bool {
        self.dims == other.dims
    }

    // ---- Shape inference ----

    /// Remove the named dimensions; an empty list removes all of them.
    pub fn reduce(&self, dims: &[String]) -> ValueType {
        if self.error {
            return ValueType::error_type();
        }
        if dims.iter().any(|name| self.dimension_index(name).is_none()) {
            return ValueType::error_type();
        }
        let kept: Vec<Dimension> = if dims.is_empty() {
            Vec::new()
        } else {
            self.dims.iter().filter(|d| !dims.contains(&d.name)).cloned().collect()
        };
        ValueType::make_type(self.cell_type.reduce(), kept)
    }

    /// Bijective dimension renaming.
    pub fn rename(&self, from: &[String], to: &[String]) -> ValueType {
        if self.error || from.is_empty() || from.len() != to.len() {
            return ValueType::error_type();
        }
        if from.iter().enumerate().any(|(i, f)| from[..i].contains(f)) {
            return ValueType::error_type();
        }
        if from.iter().any(|name| self.dimension_index(name).is_none()) {
            return ValueType::error_type();
        }
        let dims: Vec<Dimension> = self
            .dims
            .iter()
            .map(|d| match from.iter().position(|f| *f == d.name) {
                Some(i) => Dimension { name: to[i].clone(), size: d.size },
                None => d.clone(),
            })
            .collect();
        ValueType::make_type(self.cell_type, dims)
    }

    pub fn map(&self) -> ValueType {
        if self.error {
            return ValueType::error_type();
        }
        if self.dims.is_empty() {
            return ValueType::double_type();
        }
        ValueType { cell_type: self.cell_type.map(), dims: self.dims.clone(), error: false }
    }

    pub fn join(a: &ValueType, b: &ValueType) -> ValueType {
        if a.error || b.error {
            return ValueType::error_type();
        }
        let cell_type = match (a.is_double(), b.is_double()) {
            (true, false) => b.cell_type.decay(),
            (false, true) => a.cell_type.decay(),
            _ => CellType::join(a.cell_type, b.cell_type),
        };
        match union_dimensions(&a.dims, &b.dims) {
            Some(dims) => ValueType::make_type(cell_type, dims),
            None => ValueType::error_type(),
        }
    }

    pub fn merge(a: &ValueType, b: &ValueType) -> ValueType {
        if a.error || b.error || a.dims != b.dims {
            return ValueType::error_type();
        }
        ValueType::make_type(CellType::merge(a.cell_type, b.cell_type), a.dims.clone())
    }

    pub fn concat(a: &ValueType, b: &ValueType, dim: &str) -> ValueType {
        if a.error || b.error {
            return ValueType::error_type();
        }
        let size_of = |t: &ValueType| match t.dimension(dim) {
            Some(d) if d.is_mapped() => None,
            Some(d) => Some(d.size),
            None => Some(1),
        };
        let (Some(a_size), Some(b_size)) = (size_of(a), size_of(b)) else {
            return ValueType::error_type();
        };
        let Some(size) = a_size.checked_add(b_size).filter(|s| *s <= MAX_INDEXED_SIZE) else {
            return ValueType::error_type();
        };
        let strip = |t: &ValueType| -> Vec<Dimension> {
            t.dims.iter().filter(|d| d.name != dim).cloned().collect()
        };
        let cell_type = match (a.is_double(), b.is_double()) {
            (true, false) => b.cell_type,
            (false, true) => a.cell_type,
            _ => CellType::concat(a.cell_type, b.cell_type),
        };
        match union_dimensions(&strip(a), &strip(b)) {
            Some(mut dims) => {
                dims.push(Dimension::indexed(dim, size));
                ValueType::make_type(cell_type, dims)
            }
            None => ValueType::error_type(),
        }
    }

    /// Remove the peeked dimensions.
    pub fn peek(&self, dims: &[String]) -> ValueType {
        if self.error || dims.is_empty() {
            return ValueType::error_type();
        }
        if dims.iter().any(|name| self.dimension_index(name).is_none()) {
            return ValueType::error_type();
        }
        let kept: Vec<Dimension> = self.dims.iter().filter(|d| !dims.contains(&d.name)).cloned().collect();
        ValueType::make_type(self.cell_type, kept)
    }

    pub fn cell_cast(&self, cell_type: CellType) -> ValueType {
        if self.error {
            return ValueType::error_type();
        }
        if self.dims.is_empty() {
            return if cell_type == CellType::Double { ValueType::double_type() } else { ValueType::error_type() };
        }
        ValueType { cell_type, dims: self.dims.clone(), error: false }
    }

    /// Common type of two alternatives (both branches of an `if`).
    pub fn either(a: &ValueType, b: &ValueType) -> ValueType {
        if a.error || b.error || a != b {
            return ValueType::error_type();
        }
        a.clone()
    }

    /// Result of mapping each dense subspace of `outer` to a value of type `inner`.
    pub fn map_subspaces(outer: &ValueType, inner: &ValueType) -> ValueType {
        if outer.error || inner.error || inner.count_mapped_dimensions() > 0 {
            return ValueType::error_type();
        }
        let mut dims: Vec<Dimension> = outer.dims.iter().filter(|d| d.is_mapped()).cloned().collect();
        dims.extend(inner.dims.iter().cloned());
        ValueType::make_type(inner.cell_type, dims)
    }
}

/// Sorted union of two sorted dimension lists; `None` on a kind or size conflict.
fn union_dimensions(a: &[Dimension], b: &[Dimension]) -> Option<Vec<Dimension>> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].name.cmp(&b[j].name) {
            std::cmp::Ordering::Less => {
                out.push(a[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j].clone());
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                if a[i].size != b[j].size {
                    return None;
                }
                out.push(a[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out.sort_by(|x, y| x.name.cmp(&y.name));
    Some(out)
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_spec())
    }
}

impl Serialize for ValueType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_spec())
    }
}

impl<'de> Deserialize<'de> for ValueType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let spec = String::deserialize(deserializer)?;
        crate::parser::parse_value_type(&spec).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(spec: &str) -> ValueType {
        ValueType::from_spec(spec)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn spec_roundtrip() {
        for spec in ["double", "error", "tensor(x[3])", "tensor<float>(x{},y[2])", "tensor<int8>(a{},b{})"] {
            assert_eq!(t(spec).to_spec(), spec);
        }
    }

    #[test]
    fn dimensions_are_sorted() {
        assert_eq!(t("tensor(y[2],x{})").to_spec(), "tensor(x{},y[2])");
    }

    #[test]
    fn duplicate_dimension_is_error() {
        assert!(t("tensor(x[2],x[3])").is_error());
        assert!(ValueType::make_type(CellType::Double, vec![Dimension::mapped("a"), Dimension::mapped("a")]).is_error());
    }

    #[test]
    fn join_unions_dimensions() {
        let res = ValueType::join(&t("tensor(x{},y[3])"), &t("tensor<float>(y[3],z[2])"));
        assert_eq!(res.to_spec(), "tensor(x{},y[3],z[2])");
        let res = ValueType::join(&t("tensor<float>(x[2])"), &t("tensor<float>(y[2])"));
        assert_eq!(res.cell_type(), CellType::Float);
    }

    #[test]
    fn scalars_do_not_widen_cell_type() {
        assert_eq!(ValueType::join(&t("tensor<float>(x[2])"), &t("double")).to_spec(), "tensor<float>(x[2])");
        assert_eq!(ValueType::join(&t("double"), &t("tensor<int8>(x[2])")).to_spec(), "tensor<float>(x[2])");
        assert_eq!(ValueType::join(&t("double"), &t("double")), ValueType::double_type());
        assert_eq!(ValueType::concat(&t("tensor<int8>(x[2])"), &t("double"), "x").to_spec(), "tensor<int8>(x[3])");
    }

    #[test]
    fn join_conflicts_are_errors() {
        assert!(ValueType::join(&t("tensor(x[2])"), &t("tensor(x[3])")).is_error());
        assert!(ValueType::join(&t("tensor(x[2])"), &t("tensor(x{})")).is_error());
    }

    #[test]
    fn error_is_sticky() {
        let err = ValueType::error_type();
        assert!(ValueType::join(&err, &t("double")).is_error());
        assert!(err.reduce(&[]).is_error());
        assert!(err.map().is_error());
        assert!(err.rename(&names(&["x"]), &names(&["y"])).is_error());
        assert!(ValueType::concat(&t("double"), &err, "x").is_error());
    }

    #[test]
    fn reduce_strips_dimensions() {
        let ty = t("tensor<float>(x{},y[3])");
        assert_eq!(ty.reduce(&names(&["y"])).to_spec(), "tensor<float>(x{})");
        assert_eq!(ty.reduce(&[]), ValueType::double_type());
        assert!(ty.reduce(&names(&["z"])).is_error());
    }

    #[test]
    fn rename_is_checked() {
        let ty = t("tensor(x{},y[3])");
        assert_eq!(ty.rename(&names(&["x"]), &names(&["z"])).to_spec(), "tensor(y[3],z{})");
        assert_eq!(ty.rename(&names(&["x", "y"]), &names(&["y", "x"])).to_spec(), "tensor(x[3],y{})");
        assert!(ty.rename(&names(&["x"]), &names(&["y"])).is_error());
        assert!(ty.rename(&names(&["x", "y"]), &names(&["z", "z"])).is_error());
        assert!(ty.rename(&names(&["q"]), &names(&["z"])).is_error());
    }

    #[test]
    fn concat_adds_sizes() {
        assert_eq!(ValueType::concat(&t("tensor(x[2])"), &t("tensor(x[3])"), "x").to_spec(), "tensor(x[5])");
        assert_eq!(ValueType::concat(&t("double"), &t("double"), "x").to_spec(), "tensor(x[2])");
        assert_eq!(ValueType::concat(&t("tensor(a{},x[2])"), &t("tensor(y[2])"), "x").to_spec(), "tensor(a{},x[3],y[2])");
        assert!(ValueType::concat(&t("tensor(x{})"), &t("double"), "x").is_error());
    }

    #[test]
    fn concat_size_stays_below_mapped_marker() {
        let big = t("tensor(x[4294967290])");
        assert!(ValueType::concat(&big, &t("tensor(x[5])"), "x").is_error());
        assert!(ValueType::concat(&big, &big, "x").is_error());
        let largest = ValueType::concat(&big, &t("tensor(x[4])"), "x");
        assert_eq!(largest.to_spec(), "tensor(x[4294967294])");
        assert!(largest.dimensions()[0].is_indexed());
    }

    #[test]
    fn subspace_queries() {
        let ty = t("tensor(a{},b[2],c[3])");
        assert!(ty.is_mixed());
        assert_eq!(ty.dense_subspace_size(), 6);
        assert_eq!(ty.dense_subspace_type().to_spec(), "tensor(b[2],c[3])");
        assert_eq!(t("tensor(a{})").dense_subspace_size(), 1);
    }

    #[test]
    fn map_subspaces_type() {
        let outer = t("tensor(a{},x[3])");
        assert_eq!(ValueType::map_subspaces(&outer, &t("tensor<float>(y[2])")).to_spec(), "tensor<float>(a{},y[2])");
        assert!(ValueType::map_subspaces(&outer, &t("tensor(a[2])")).is_error());
    }

    #[test]
    fn serde_as_spec_string() {
        let ty = t("tensor<float>(x{},y[2])");
        let json = serde_json::to_string(&ty).unwrap();
        assert_eq!(json, "\"tensor<float>(x{},y[2])\"");
        let back: ValueType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ty);
    }
}
