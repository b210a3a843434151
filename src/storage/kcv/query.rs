use std::num::NonZeroUsize;

use crate::primitives::bytes::StaticBuffer;
use crate::types::{KcvError, Result};

use super::entry::Entry;

/// Half-open column range `[start, end)` over one row, with an optional limit.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SliceQuery {
    start: StaticBuffer,
    end: StaticBuffer,
    limit: Option<NonZeroUsize>,
}

impl SliceQuery {
    /// Creates an unlimited slice; fails when `start > end`.
    pub fn new(start: StaticBuffer, end: StaticBuffer) -> Result<Self> {
        if start > end {
            return Err(KcvError::invalid(format!(
                "slice start {start:?} sorts after end {end:?}"
            )));
        }
        Ok(Self {
            start,
            end,
            limit: None,
        })
    }

    /// Slice covering every column shorter than 128 bytes, the same bounds the
    /// index removal scan uses for "the whole row".
    pub fn full_row() -> Self {
        Self {
            start: StaticBuffer::zero(1),
            end: StaticBuffer::one(128),
            limit: None,
        }
    }

    /// Slice covering every column that starts with `prefix`.
    pub fn prefix(prefix: StaticBuffer) -> Self {
        let end = prefix
            .next_prefix()
            .unwrap_or_else(|| StaticBuffer::one(prefix.len() + 128));
        Self {
            start: prefix,
            end,
            limit: None,
        }
    }

    /// Returns a copy capped at `limit` entries; a limit of 0 is invalid.
    pub fn with_limit(mut self, limit: usize) -> Result<Self> {
        let limit = NonZeroUsize::new(limit)
            .ok_or_else(|| KcvError::invalid("slice query limit must be positive"))?;
        self.limit = Some(limit);
        Ok(self)
    }

    /// Inclusive lower bound.
    pub fn start(&self) -> &StaticBuffer {
        &self.start
    }

    /// Exclusive upper bound.
    pub fn end(&self) -> &StaticBuffer {
        &self.end
    }

    /// Maximum number of entries, if capped.
    pub fn limit(&self) -> Option<usize> {
        self.limit.map(NonZeroUsize::get)
    }

    /// Returns true when a limit is set.
    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    /// Returns true when `column` falls in `[start, end)`.
    pub fn contains(&self, column: &[u8]) -> bool {
        self.start.as_slice() <= column && column < self.end.as_slice()
    }

    /// Filters column-ordered `entries` down to this slice, honouring the limit.
    pub fn apply<I>(&self, entries: I) -> Vec<Entry>
    where
        I: IntoIterator<Item = Entry>,
    {
        let cap = self.limit().unwrap_or(usize::MAX);
        entries
            .into_iter()
            .skip_while(|e| e.column < self.start)
            .take_while(|e| e.column < self.end)
            .take(cap)
            .collect()
    }
}

/// Slice query bound to one row key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeySliceQuery {
    /// Row key.
    pub key: StaticBuffer,
    /// Column slice.
    pub slice: SliceQuery,
}

impl KeySliceQuery {
    /// Pairs a key with a slice.
    pub fn new(key: StaticBuffer, slice: SliceQuery) -> Self {
        Self { key, slice }
    }
}

/// Half-open key range `[start, end)`; `end == None` means unbounded.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyRange {
    start: StaticBuffer,
    end: Option<StaticBuffer>,
}

impl KeyRange {
    /// Creates a bounded range; fails when `start > end`.
    pub fn new(start: StaticBuffer, end: StaticBuffer) -> Result<Self> {
        if start > end {
            return Err(KcvError::invalid(format!(
                "key range start {start:?} sorts after end {end:?}"
            )));
        }
        Ok(Self {
            start,
            end: Some(end),
        })
    }

    /// Range starting at `start` with no upper bound.
    pub fn from(start: StaticBuffer) -> Self {
        Self { start, end: None }
    }

    /// The whole key space.
    pub fn full() -> Self {
        Self::from(StaticBuffer::empty())
    }

    /// Inclusive lower bound.
    pub fn start(&self) -> &StaticBuffer {
        &self.start
    }

    /// Exclusive upper bound, if any.
    pub fn end(&self) -> Option<&StaticBuffer> {
        self.end.as_ref()
    }

    /// Returns true when `key` lies in the range.
    pub fn contains(&self, key: &[u8]) -> bool {
        if key < self.start.as_slice() {
            return false;
        }
        match &self.end {
            Some(end) => key < end.as_slice(),
            None => true,
        }
    }

    /// Returns true when the range cannot contain any key.
    pub fn is_empty(&self) -> bool {
        matches!(&self.end, Some(end) if *end <= self.start)
    }
}
