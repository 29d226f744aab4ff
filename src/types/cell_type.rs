use serde::{Deserialize, Serialize};

/// Numeric storage type of tensor cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Double,
    Float,
    BFloat16,
    Int8,
}

impl CellType {
    pub const ALL: [CellType; 4] = [CellType::Double, CellType::Float, CellType::BFloat16, CellType::Int8];

    pub fn name(self) -> &'static str {
        match self {
            CellType::Double => "double",
            CellType::Float => "float",
            CellType::BFloat16 => "bfloat16",
            CellType::Int8 => "int8",
        }
    }

    pub fn from_name(name: &str) -> Option<CellType> {
        match name {
            "double" => Some(CellType::Double),
            "float" => Some(CellType::Float),
            "bfloat16" => Some(CellType::BFloat16),
            "int8" => Some(CellType::Int8),
            _ => None,
        }
    }

    /// Bytes per stored cell.
    pub fn size_of(self) -> usize {
        match self {
            CellType::Double => 8,
            CellType::Float => 4,
            CellType::BFloat16 => 2,
            CellType::Int8 => 1,
        }
    }

    /// Common type able to represent both inputs without widening past float.
    pub fn unify(a: CellType, b: CellType) -> CellType {
        if a == b {
            a
        } else if a == CellType::Double || b == CellType::Double {
            CellType::Double
        } else {
            CellType::Float
        }
    }

    /// Arithmetic results never stay in the small storage types.
    pub fn decay(self) -> CellType {
        match self {
            CellType::Double => CellType::Double,
            _ => CellType::Float,
        }
    }

    pub fn join(a: CellType, b: CellType) -> CellType {
        CellType::unify(a, b).decay()
    }

    pub fn merge(a: CellType, b: CellType) -> CellType {
        CellType::unify(a, b)
    }

    pub fn concat(a: CellType, b: CellType) -> CellType {
        CellType::unify(a, b)
    }

    pub fn map(self) -> CellType {
        self.decay()
    }

    pub fn reduce(self) -> CellType {
        self.decay()
    }
}

impl std::fmt::Display for CellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
