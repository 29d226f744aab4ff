//! Hashed label-tuple to subspace-ordinal map.
//!
//! Ordinals are handed out in first-seen order starting at 0 and are never
//! reused; there is no removal.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use indexmap::{Equivalent, IndexSet};

/// Content hash of a label tuple. Stable for a given tuple, independent of
/// whether the labels are owned or borrowed.
pub fn hash_labels<L: AsRef<str>>(labels: &[L]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for label in labels {
        hasher.write(label.as_ref().as_bytes());
        hasher.write_u8(0xff);
    }
    hasher.finish()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LabelKey {
    labels: Box<[String]>,
    hash: u64,
}

impl Hash for LabelKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

struct LabelQuery<'q, L> {
    labels: &'q [L],
    hash: u64,
}

impl<L> Hash for LabelQuery<'_, L> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl<L: AsRef<str>> Equivalent<LabelKey> for LabelQuery<'_, L> {
    fn equivalent(&self, key: &LabelKey) -> bool {
        self.hash == key.hash
            && self.labels.len() == key.labels.len()
            && self.labels.iter().zip(key.labels.iter()).all(|(a, b)| a.as_ref() == b)
    }
}

#[derive(Debug, Clone)]
pub struct FastSparseMap {
    num_dims: usize,
    entries: IndexSet<LabelKey>,
}

impl FastSparseMap {
    pub fn new(num_dims: usize) -> Self {
        Self::with_capacity(num_dims, 0)
    }

    pub fn with_capacity(num_dims: usize, expected_subspaces: usize) -> Self {
        FastSparseMap { num_dims, entries: IndexSet::with_capacity(expected_subspaces) }
    }

    /// Sentinel returned by `lookup` on a miss.
    pub const fn npos() -> u32 {
        u32::MAX
    }

    pub fn num_dims(&self) -> usize {
        self.num_dims
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert-or-find. Accepts `&[String]`, `&[&str]` and `&[&String]` alike.
    pub fn add_mapping<L: AsRef<str>>(&mut self, labels: &[L]) -> u32 {
        let hash = hash_labels(labels);
        self.add_mapping_hashed(labels, hash)
    }

    /// Insert-or-find with a precomputed content hash.
    pub fn add_mapping_hashed<L: AsRef<str>>(&mut self, labels: &[L], hash: u64) -> u32 {
        assert_eq!(labels.len(), self.num_dims, "label tuple arity does not match sparse map");
        let query = LabelQuery { labels, hash };
        if let Some(idx) = self.entries.get_index_of(&query) {
            return idx as u32;
        }
        let key = LabelKey {
            labels: labels.iter().map(|l| l.as_ref().to_string()).collect(),
            hash,
        };
        let (idx, _) = self.entries.insert_full(key);
        idx as u32
    }

    pub fn lookup<L: AsRef<str>>(&self, labels: &[L]) -> u32 {
        self.lookup_hashed(labels, hash_labels(labels))
    }

    pub fn lookup_hashed<L: AsRef<str>>(&self, labels: &[L], hash: u64) -> u32 {
        if labels.len() != self.num_dims {
            return Self::npos();
        }
        let query = LabelQuery { labels, hash };
        match self.entries.get_index_of(&query) {
            Some(idx) => idx as u32,
            None => Self::npos(),
        }
    }

    pub fn labels(&self, ordinal: u32) -> &[String] {
        &self.entries[ordinal as usize].labels
    }

    /// Visit every stored tuple as `(flat_offset_tag, ordinal, content_hash)`.
    /// The tag is the position of the tuple's first label in a flattened label array.
    pub fn each_map_entry<F: FnMut(usize, u32, u64)>(&self, mut f: F) {
        for (ordinal, key) in self.entries.iter().enumerate() {
            f(ordinal * self.num_dims, ordinal as u32, key.hash);
        }
    }

    /// Bytes held by the table and its label strings.
    pub fn memory_usage(&self) -> crate::value::MemoryUsage {
        let labels: usize = self
            .entries
            .iter()
            .map(|k| k.labels.iter().map(|l| l.capacity() + std::mem::size_of::<String>()).sum::<usize>())
            .sum();
        let key_size = std::mem::size_of::<LabelKey>();
        crate::value::MemoryUsage {
            allocated_bytes: self.entries.capacity() * key_size + labels,
            used_bytes: self.entries.len() * key_size + labels,
        }
    }
}
