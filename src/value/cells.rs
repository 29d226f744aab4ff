//! Typed cell buffers and the cell-type dispatch macro.

use crate::types::CellType;

/// Brain-float: the upper 16 bits of an IEEE-754 single.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BFloat16(pub u16);

impl BFloat16 {
    pub fn from_f32(v: f32) -> Self {
        BFloat16((v.to_bits() >> 16) as u16)
    }

    pub fn to_f32(self) -> f32 {
        f32::from_bits((self.0 as u32) << 16)
    }
}

/// Borrowed cells tagged with their cell type.
#[derive(Debug, Clone, Copy)]
pub enum TypedCells<'a> {
    Double(&'a [f64]),
    Float(&'a [f32]),
    BFloat16(&'a [BFloat16]),
    Int8(&'a [i8]),
}

/// Mutable cells, only handed out for buffers a value owns.
#[derive(Debug)]
pub enum CellsMut<'a> {
    Double(&'a mut [f64]),
    Float(&'a mut [f32]),
    BFloat16(&'a mut [BFloat16]),
    Int8(&'a mut [i8]),
}

/// Owned cell storage.
#[derive(Debug, Clone, PartialEq)]
pub enum CellVec {
    Double(Vec<f64>),
    Float(Vec<f32>),
    BFloat16(Vec<BFloat16>),
    Int8(Vec<i8>),
}

/// A storable cell. All arithmetic happens in `f64`; `from_f64` is the cast on store.
pub trait Cell: Copy + Default + Send + Sync + std::fmt::Debug + 'static {
    const CELL_TYPE: CellType;

    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
    fn wrap(cells: &[Self]) -> TypedCells<'_>;
    fn wrap_vec(cells: Vec<Self>) -> CellVec;

    /// Panics on a cell-type mismatch; a mismatch means a kernel was selected for the wrong types.
    fn unwrap(cells: TypedCells<'_>) -> &[Self];
    fn unwrap_mut(cells: CellsMut<'_>) -> &mut [Self];
}

macro_rules! impl_cell {
    ($t:ty, $variant:ident, |$a:ident| $to:expr, |$b:ident| $from:expr) => {
        impl Cell for $t {
            const CELL_TYPE: CellType = CellType::$variant;

            #[inline]
            fn to_f64(self) -> f64 {
                let $a = self;
                $to
            }

            #[inline]
            fn from_f64(v: f64) -> Self {
                let $b = v;
                $from
            }

            fn wrap(cells: &[Self]) -> TypedCells<'_> {
                TypedCells::$variant(cells)
            }

            fn wrap_vec(cells: Vec<Self>) -> CellVec {
                CellVec::$variant(cells)
            }

            fn unwrap(cells: TypedCells<'_>) -> &[Self] {
                match cells {
                    TypedCells::$variant(c) => c,
                    other => panic!("expected {} cells, got {}", CellType::$variant, other.cell_type()),
                }
            }

            fn unwrap_mut(cells: CellsMut<'_>) -> &mut [Self] {
                match cells {
                    CellsMut::$variant(c) => c,
                    other => panic!("expected mutable {} cells, got {}", CellType::$variant, other.cell_type()),
                }
            }
        }
    };
}

impl_cell!(f64, Double, |a| a, |b| b);
impl_cell!(f32, Float, |a| a as f64, |b| b as f32);
impl_cell!(BFloat16, BFloat16, |a| a.to_f32() as f64, |b| BFloat16::from_f32(b as f32));
// `as` saturates and maps NaN to 0.
impl_cell!(i8, Int8, |a| a as f64, |b| b as i8);

/// Dispatch on a runtime cell type, binding a type alias for the matching `Cell`.
///
/// ```ignore
/// with_cell_type!(ct, T => kernel::<T> as OpFn)
/// ```
#[macro_export]
macro_rules! with_cell_type {
    ($ct:expr, $T:ident => $body:expr) => {
        match $ct {
            $crate::types::CellType::Double => {
                type $T = f64;
                $body
            }
            $crate::types::CellType::Float => {
                type $T = f32;
                $body
            }
            $crate::types::CellType::BFloat16 => {
                type $T = $crate::value::cells::BFloat16;
                $body
            }
            $crate::types::CellType::Int8 => {
                type $T = i8;
                $body
            }
        }
    };
}

impl<'a> TypedCells<'a> {
    pub fn cell_type(&self) -> CellType {
        match self {
            TypedCells::Double(_) => CellType::Double,
            TypedCells::Float(_) => CellType::Float,
            TypedCells::BFloat16(_) => CellType::BFloat16,
            TypedCells::Int8(_) => CellType::Int8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TypedCells::Double(c) => c.len(),
            TypedCells::Float(c) => c.len(),
            TypedCells::BFloat16(c) => c.len(),
            TypedCells::Int8(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read one cell widened to `f64`.
    pub fn get(&self, idx: usize) -> f64 {
        match self {
            TypedCells::Double(c) => c[idx],
            TypedCells::Float(c) => c[idx].to_f64(),
            TypedCells::BFloat16(c) => c[idx].to_f64(),
            TypedCells::Int8(c) => c[idx].to_f64(),
        }
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }

    /// Sub-range of the cells, same cell type.
    pub fn slice(&self, start: usize, len: usize) -> TypedCells<'a> {
        match *self {
            TypedCells::Double(c) => TypedCells::Double(&c[start..start + len]),
            TypedCells::Float(c) => TypedCells::Float(&c[start..start + len]),
            TypedCells::BFloat16(c) => TypedCells::BFloat16(&c[start..start + len]),
            TypedCells::Int8(c) => TypedCells::Int8(&c[start..start + len]),
        }
    }

    pub fn to_vec(&self) -> CellVec {
        match self {
            TypedCells::Double(c) => CellVec::Double(c.to_vec()),
            TypedCells::Float(c) => CellVec::Float(c.to_vec()),
            TypedCells::BFloat16(c) => CellVec::BFloat16(c.to_vec()),
            TypedCells::Int8(c) => CellVec::Int8(c.to_vec()),
        }
    }
}

impl CellsMut<'_> {
    pub fn cell_type(&self) -> CellType {
        match self {
            CellsMut::Double(_) => CellType::Double,
            CellsMut::Float(_) => CellType::Float,
            CellsMut::BFloat16(_) => CellType::BFloat16,
            CellsMut::Int8(_) => CellType::Int8,
        }
    }
}

impl CellVec {
    pub fn zeroed(cell_type: CellType, len: usize) -> CellVec {
        with_cell_type!(cell_type, T => T::wrap_vec(vec![T::default(); len]))
    }

    /// Cast a sequence of `f64` into storage of the given cell type.
    pub fn from_f64s(cell_type: CellType, values: impl IntoIterator<Item = f64>) -> CellVec {
        with_cell_type!(cell_type, T => T::wrap_vec(values.into_iter().map(T::from_f64).collect()))
    }

    pub fn cell_type(&self) -> CellType {
        self.as_cells().cell_type()
    }

    pub fn len(&self) -> usize {
        self.as_cells().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_cells(&self) -> TypedCells<'_> {
        match self {
            CellVec::Double(c) => TypedCells::Double(c),
            CellVec::Float(c) => TypedCells::Float(c),
            CellVec::BFloat16(c) => TypedCells::BFloat16(c),
            CellVec::Int8(c) => TypedCells::Int8(c),
        }
    }

    pub fn as_cells_mut(&mut self) -> CellsMut<'_> {
        match self {
            CellVec::Double(c) => CellsMut::Double(c),
            CellVec::Float(c) => CellsMut::Float(c),
            CellVec::BFloat16(c) => CellsMut::BFloat16(c),
            CellVec::Int8(c) => CellsMut::Int8(c),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        let cap = match self {
            CellVec::Double(c) => c.capacity(),
            CellVec::Float(c) => c.capacity(),
            CellVec::BFloat16(c) => c.capacity(),
            CellVec::Int8(c) => c.capacity(),
        };
        cap * self.cell_type().size_of()
    }
}
