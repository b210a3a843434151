//! Storage substrate of a graph database on top of pluggable key-column-value
//! stores.
//!
//! The crate stacks four layers:
//!
//! - [`storage`]: the KCV store contract, the in-memory and embedded
//!   adapters, a read-through cache and the transactional write buffer.
//! - [`ids`]: the ID block authority handing out disjoint id ranges through
//!   compare-and-swap on a shared watermark.
//! - [`index`]: composite index key layout and mixed-index query translation.
//! - [`scan`]: partitioned full-keyspace scans and the index maintenance jobs
//!   built on them.

#![warn(missing_docs)]

pub mod ids;
pub mod index;
pub mod primitives;
pub mod scan;
pub mod storage;
pub mod types;

pub use types::{ElementId, IndexId, KcvError, NamespaceId, PartitionId, Result};
