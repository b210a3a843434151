use std::collections::{BTreeMap, BTreeSet};

use crate::primitives::bytes::StaticBuffer;

/// One `(column, value)` pair of a row.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entry {
    /// Column name; unique within a row.
    pub column: StaticBuffer,
    /// Column value.
    pub value: StaticBuffer,
}

impl Entry {
    /// Creates an entry.
    pub fn new(column: StaticBuffer, value: StaticBuffer) -> Self {
        Self { column, value }
    }

    /// Entry with an empty value.
    pub fn column_only(column: StaticBuffer) -> Self {
        Self {
            column,
            value: StaticBuffer::empty(),
        }
    }
}

/// Column-ordered entries of one row.
pub type EntryList = Vec<Entry>;

/// Consolidated pending changes to one row.
///
/// Additions and deletions never overlap: staging an addition cancels a
/// pending deletion of the same column and vice versa, so the last staged
/// operation on a column wins regardless of the order a backend applies the
/// two halves in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KcvMutation {
    additions: BTreeMap<StaticBuffer, StaticBuffer>,
    deletions: BTreeSet<StaticBuffer>,
}

impl KcvMutation {
    /// Empty mutation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a mutation from raw halves; deletions are applied first.
    pub fn from_parts(additions: &[Entry], deletions: &[StaticBuffer]) -> Self {
        let mut mutation = Self::new();
        for column in deletions {
            mutation.delete(column.clone());
        }
        for entry in additions {
            mutation.add(entry.clone());
        }
        mutation
    }

    /// Stages an addition, overriding earlier staged operations on the column.
    pub fn add(&mut self, entry: Entry) {
        self.deletions.remove(&entry.column);
        self.additions.insert(entry.column, entry.value);
    }

    /// Stages a deletion, overriding earlier staged operations on the column.
    pub fn delete(&mut self, column: StaticBuffer) {
        self.additions.remove(&column);
        self.deletions.insert(column);
    }

    /// Applies `other` on top of `self`.
    pub fn merge(&mut self, other: KcvMutation) {
        for column in other.deletions {
            self.delete(column);
        }
        for (column, value) in other.additions {
            self.add(Entry::new(column, value));
        }
    }

    /// Returns the staged value for `column`: `Some(Some(v))` when added,
    /// `Some(None)` when deleted, `None` when untouched.
    pub fn lookup(&self, column: &[u8]) -> Option<Option<&StaticBuffer>> {
        if let Some(value) = self.additions.get(column) {
            return Some(Some(value));
        }
        if self.deletions.contains(column) {
            return Some(None);
        }
        None
    }

    /// Additions in column order.
    pub fn additions(&self) -> Vec<Entry> {
        self.additions
            .iter()
            .map(|(c, v)| Entry::new(c.clone(), v.clone()))
            .collect()
    }

    /// Deleted columns in order.
    pub fn deletions(&self) -> Vec<StaticBuffer> {
        self.deletions.iter().cloned().collect()
    }

    /// Iterates additions without cloning.
    pub fn iter_additions(&self) -> impl Iterator<Item = (&StaticBuffer, &StaticBuffer)> {
        self.additions.iter()
    }

    /// Iterates deletions without cloning.
    pub fn iter_deletions(&self) -> impl Iterator<Item = &StaticBuffer> {
        self.deletions.iter()
    }

    /// Returns true when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.deletions.is_empty()
    }

    /// Total staged operations.
    pub fn len(&self) -> usize {
        self.additions.len() + self.deletions.len()
    }
}
