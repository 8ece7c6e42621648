//! Dense integer codes for raw user and item identifiers
//!
//! Codes are assigned in order of first appearance, so `0..len()` is a
//! bijection onto the distinct identifiers seen. Mappings are rebuilt for
//! every analysis run and never persisted.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct IndexMapping {
    codes: HashMap<i64, usize>,
    /// code -> raw id
    inverse: Vec<i64>,
}

impl IndexMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a mapping from an ordered sequence of raw ids
    pub fn from_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        let mut mapping = Self::new();
        for id in ids {
            mapping.encode(id);
        }
        mapping
    }

    /// Code of `id`, assigning the next free code on first sight
    pub fn encode(&mut self, id: i64) -> usize {
        if let Some(&code) = self.codes.get(&id) {
            return code;
        }
        let code = self.inverse.len();
        self.codes.insert(id, code);
        self.inverse.push(id);
        code
    }

    pub fn code(&self, id: i64) -> Option<usize> {
        self.codes.get(&id).copied()
    }

    pub fn decode(&self, code: usize) -> Option<i64> {
        self.inverse.get(code).copied()
    }

    /// Raw ids indexed by code
    pub fn inverse(&self) -> &[i64] {
        &self.inverse
    }

    pub fn len(&self) -> usize {
        self.inverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inverse.is_empty()
    }
}
