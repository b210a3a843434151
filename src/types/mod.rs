#![forbid(unsafe_code)]

//! Shared identifiers, the crate error type, and checksum helpers.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod checksum;

pub use checksum::record_crc32;

/// Partition an ID block is issued for.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

/// Namespace an ID block is issued for (vertex ids, relation ids, schema ids, ...).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceId(pub u32);

/// Schema identifier of a graph index.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexId(pub u64);

/// Identifier of a graph element (vertex, edge or property) as stored in index columns.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub u64);

macro_rules! display_inner {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

display_inner!(PartitionId, NamespaceId, IndexId, ElementId);

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        PartitionId(value)
    }
}

impl From<u32> for NamespaceId {
    fn from(value: u32) -> Self {
        NamespaceId(value)
    }
}

impl From<u64> for IndexId {
    fn from(value: u64) -> Self {
        IndexId(value)
    }
}

impl From<u64> for ElementId {
    fn from(value: u64) -> Self {
        ElementId(value)
    }
}

/// Errors surfaced by the storage substrate.
#[derive(thiserror::Error, Debug)]
pub enum KcvError {
    /// Underlying file or device error.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persisted bytes could not be decoded.
    #[error("corruption: {0}")]
    Corruption(String),
    /// Caller supplied malformed parameters.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A value failed codec verification or coercion.
    #[error("invalid value: {0}")]
    InvalidValue(String),
    /// The requested item does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// The backend or component does not support the requested operation.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),
    /// A transient backend condition; the operation may succeed if retried.
    #[error("temporary backend failure: {0}")]
    Temporary(String),
    /// Flushing a transaction into a store failed.
    #[error("persistence failure in store `{store}`: {source}")]
    Persistence {
        /// Name of the store whose flush failed.
        store: String,
        /// Backend error that caused the failure.
        #[source]
        source: Box<KcvError>,
    },
    /// No ID block could be secured before the timeout expired.
    #[error("could not secure an id block for partition {partition} namespace {namespace} within {waited_ms} ms")]
    UniqueIdConflict {
        /// Partition the block was requested for.
        partition: PartitionId,
        /// Namespace the block was requested for.
        namespace: NamespaceId,
        /// Milliseconds spent before giving up.
        waited_ms: u64,
    },
    /// The next block would exceed the namespace upper bound.
    #[error("id pool exhausted for partition {partition} namespace {namespace} (upper bound {upper_bound})")]
    IdPoolExhausted {
        /// Partition the block was requested for.
        partition: PartitionId,
        /// Namespace the block was requested for.
        namespace: NamespaceId,
        /// Configured upper bound of the namespace.
        upper_bound: u64,
    },
    /// A required precondition on schema or job state does not hold.
    #[error("precondition failed: {0}")]
    Precondition(String),
    /// The component was already closed.
    #[error("{0} is closed")]
    Closed(&'static str),
    /// A scan job finished with per-key failures.
    #[error("scan job `{job}` failed: {failures} failed keys, {successes} processed keys")]
    ScanFailed {
        /// Job name.
        job: String,
        /// Number of keys whose processing failed.
        failures: u64,
        /// Number of keys processed successfully.
        successes: u64,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, KcvError>;

impl KcvError {
    /// Returns true when the error describes a transient condition worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            KcvError::Temporary(_) => true,
            KcvError::Persistence { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        KcvError::Corruption(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        KcvError::InvalidArgument(msg.into())
    }

    pub(crate) fn invalid_value(msg: impl Into<String>) -> Self {
        KcvError::InvalidValue(msg.into())
    }

    pub(crate) fn persistence(store: impl Into<String>, source: KcvError) -> Self {
        KcvError::Persistence {
            store: store.into(),
            source: Box::new(source),
        }
    }
}
