#![forbid(unsafe_code)]
//! Partitioned unique-ID block allocation.
//!
//! Each `(partition, namespace)` pair owns one watermark cell in the ID
//! store. Blocks are claimed by advancing that watermark with a conditional
//! write, so allocators in different processes never hand out overlapping
//! ranges.

mod authority;
mod pool;

use std::fmt;
use std::ops::Range;

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::types::{NamespaceId, PartitionId};

pub use authority::IdAuthority;
pub use pool::IdPool;

/// Sizing policy consulted for every block request.
pub trait IdBlockSizer: Send + Sync {
    /// Number of IDs in each block of `namespace`.
    fn block_size(&self, namespace: NamespaceId) -> u64;

    /// No ID of `namespace` may reach this value.
    fn id_upper_bound(&self, namespace: NamespaceId) -> u64;
}

/// One block size and upper bound for every namespace, with optional
/// per-namespace overrides.
#[derive(Clone, Debug)]
pub struct SimpleBlockSizer {
    block_size: u64,
    upper_bound: u64,
    overrides: FxHashMap<NamespaceId, (u64, u64)>,
}

impl SimpleBlockSizer {
    /// Sizer applying `block_size` and `upper_bound` to every namespace.
    pub fn new(block_size: u64, upper_bound: u64) -> Self {
        Self {
            block_size,
            upper_bound,
            overrides: FxHashMap::default(),
        }
    }

    /// Overrides size and bound for one namespace.
    pub fn with_namespace(mut self, namespace: NamespaceId, block_size: u64, upper_bound: u64) -> Self {
        self.overrides.insert(namespace, (block_size, upper_bound));
        self
    }
}

impl IdBlockSizer for SimpleBlockSizer {
    fn block_size(&self, namespace: NamespaceId) -> u64 {
        self.overrides
            .get(&namespace)
            .map_or(self.block_size, |(size, _)| *size)
    }

    fn id_upper_bound(&self, namespace: NamespaceId) -> u64 {
        self.overrides
            .get(&namespace)
            .map_or(self.upper_bound, |(_, bound)| *bound)
    }
}

/// A contiguous `[start, end)` range of IDs owned by one allocator.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdBlock {
    /// Partition the block belongs to.
    pub partition: PartitionId,
    /// Namespace the block belongs to.
    pub namespace: NamespaceId,
    /// First ID of the block.
    pub start: u64,
    /// One past the last ID of the block.
    pub end: u64,
}

impl IdBlock {
    /// Number of IDs in the block.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Returns true for a zero-length block.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns true when `id` belongs to the block.
    pub fn contains(&self, id: u64) -> bool {
        (self.start..self.end).contains(&id)
    }

    /// The IDs of the block.
    pub fn ids(&self) -> Range<u64> {
        self.start..self.end
    }

    /// Returns true when the two blocks share at least one ID.
    pub fn overlaps(&self, other: &IdBlock) -> bool {
        self.partition == other.partition
            && self.namespace == other.namespace
            && self.start < other.end
            && other.start < self.end
    }
}

impl fmt::Debug for IdBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IdBlock(p{}/n{} [{}, {}))",
            self.partition, self.namespace, self.start, self.end
        )
    }
}

/// Tunables of an [`IdAuthority`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct IdAuthorityOptions {
    /// Store holding the watermark cells
    pub store_name: String,
    /// First wait after a conflict or transient error, in milliseconds
    pub initial_backoff_ms: u64,
    /// Cap on the wait between attempts, in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for IdAuthorityOptions {
    fn default() -> Self {
        Self {
            store_name: "system_ids".to_string(),
            initial_backoff_ms: 5,
            max_backoff_ms: 500,
        }
    }
}

impl IdAuthorityOptions {
    /// Sets the watermark store name.
    pub fn store_name(mut self, name: impl Into<String>) -> Self {
        self.store_name = name.into();
        self
    }

    /// Sets the first backoff wait.
    pub fn initial_backoff_ms(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    /// Sets the backoff cap.
    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }
}
