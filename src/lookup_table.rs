//! Process-wide cache of precomputed index tables.
//!
//! A table maps every cell of a dense type (row-major) to the value of an
//! index function evaluated with that cell's dimension indices as arguments.
//! Entries are keyed on the function's identity plus the type and are shared
//! by every handle created for the same key. The entry is dropped when the
//! last handle goes away.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use tracing::trace;

use crate::ast::Function;
use crate::interpreter::eval_scalar;
use crate::types::ValueType;
use crate::value::spec::for_each_dense_address;

/// Table value for an index outside the peeked tensor.
pub const NO_INDEX: u32 = u32::MAX;

#[derive(Clone, PartialEq, Eq, Hash)]
struct Key {
    fun: usize,
    ty: ValueType,
}

struct Entry {
    table: Arc<[u32]>,
    refs: usize,
    // Keeps the function alive so its address is not reused while cached.
    _fun: Arc<Function>,
}

static CACHE: LazyLock<Mutex<HashMap<Key, Entry>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

fn key_of(fun: &Arc<Function>, ty: &ValueType) -> Key {
    Key { fun: Arc::as_ptr(fun) as usize, ty: ty.clone() }
}

fn compute(fun: &Function, ty: &ValueType) -> Vec<u32> {
    let dims: Vec<(String, usize)> = ty.dimensions().iter().map(|d| (d.name.clone(), d.size as usize)).collect();
    let mut table = Vec::with_capacity(ty.dense_subspace_size());
    let mut args = vec![0.0; dims.len()];
    for_each_dense_address(&dims, |address| {
        for (arg, (_, i)) in args.iter_mut().zip(address) {
            *arg = *i as f64;
        }
        let v = eval_scalar(&fun.root, &args);
        table.push(if v >= 0.0 && v < NO_INDEX as f64 { v as u32 } else { NO_INDEX });
    });
    table
}

/// Handle on a cached table.
pub struct IndexLookupTable {
    key: Key,
    table: Arc<[u32]>,
}

impl IndexLookupTable {
    /// Find or build the table of `fun` over `ty`. The lock is held while the
    /// table is built, so concurrent requests for one key build it once.
    pub fn create(fun: &Arc<Function>, ty: &ValueType) -> IndexLookupTable {
        let key = key_of(fun, ty);
        let mut cache = CACHE.lock();
        if let Some(entry) = cache.get_mut(&key) {
            entry.refs += 1;
            trace!(ty = %ty, refs = entry.refs, "lookup table hit");
            return IndexLookupTable { key, table: entry.table.clone() };
        }
        let table: Arc<[u32]> = compute(fun, ty).into();
        trace!(ty = %ty, cells = table.len(), "lookup table miss");
        cache.insert(key.clone(), Entry { table: table.clone(), refs: 1, _fun: fun.clone() });
        IndexLookupTable { key, table }
    }

    pub fn table(&self) -> &[u32] {
        &self.table
    }

    /// Handles currently held for `(fun, ty)`; 0 when not cached.
    pub fn ref_count(fun: &Arc<Function>, ty: &ValueType) -> usize {
        CACHE.lock().get(&key_of(fun, ty)).map_or(0, |e| e.refs)
    }

    pub fn is_cached(fun: &Arc<Function>, ty: &ValueType) -> bool {
        Self::ref_count(fun, ty) > 0
    }

    pub fn num_cached() -> usize {
        CACHE.lock().len()
    }
}

impl Clone for IndexLookupTable {
    fn clone(&self) -> Self {
        let mut cache = CACHE.lock();
        if let Some(entry) = cache.get_mut(&self.key) {
            entry.refs += 1;
        }
        IndexLookupTable { key: self.key.clone(), table: self.table.clone() }
    }
}

impl Drop for IndexLookupTable {
    fn drop(&mut self) {
        let mut cache = CACHE.lock();
        let evict = match cache.get_mut(&self.key) {
            Some(entry) => {
                entry.refs -= 1;
                entry.refs == 0
            }
            None => false,
        };
        if evict {
            cache.remove(&self.key);
            trace!(ty = %self.key.ty, "lookup table evicted");
        }
    }
}

impl fmt::Debug for IndexLookupTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexLookupTable").field("type", &self.key.ty.to_spec()).field("size", &self.table.len()).finish()
    }
}
