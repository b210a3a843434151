use std::fmt;
use std::ops::Range;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::primitives::bytes::StaticBuffer;
use crate::storage::kcv::SliceQuery;
use crate::types::{ElementId, IndexId, KcvError, Result};

use super::KeyInformation;

/// Lifecycle status of an index, owned by the external schema manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaStatus {
    /// Defined but not yet known to every instance.
    Installed,
    /// Known everywhere; not yet used for reads.
    Registered,
    /// Maintained and used for reads.
    Enabled,
    /// No longer maintained; safe to remove.
    Disabled,
}

impl fmt::Display for SchemaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchemaStatus::Installed => "installed",
            SchemaStatus::Registered => "registered",
            SchemaStatus::Enabled => "enabled",
            SchemaStatus::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

/// Kind of index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    /// Graph-wide index stored in the KCV substrate; row key derived from values.
    Composite,
    /// Graph-wide index maintained by an external index backend.
    Mixed {
        /// Name of the index inside the external backend.
        backing_index: String,
    },
    /// Per-vertex index over the relations of one type.
    RelationType {
        /// First column of the indexed relations in a vertex row.
        column_start: Vec<u8>,
        /// Column bound (exclusive) of the indexed relations.
        column_end: Vec<u8>,
    },
}

impl IndexType {
    /// Short name for logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            IndexType::Composite => "composite",
            IndexType::Mixed { .. } => "mixed",
            IndexType::RelationType { .. } => "relation_type",
        }
    }
}

/// One indexed key of an index, in index order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexField {
    /// Attribute key name.
    pub key: String,
    /// Metadata of the key.
    pub info: KeyInformation,
}

/// Everything the storage substrate needs to know about one index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Index name.
    pub name: String,
    /// Numeric id embedded in composite row keys.
    pub id: IndexId,
    /// Kind of index.
    pub index_type: IndexType,
    /// Current lifecycle status.
    pub status: SchemaStatus,
    /// Indexed keys, in index order.
    pub fields: Vec<IndexField>,
    /// At most one element per value combination.
    pub unique: bool,
}

impl IndexDescriptor {
    /// Composite index descriptor in `Installed` status.
    pub fn composite(name: impl Into<String>, id: IndexId, fields: Vec<IndexField>) -> Self {
        Self {
            name: name.into(),
            id,
            index_type: IndexType::Composite,
            status: SchemaStatus::Installed,
            fields,
            unique: false,
        }
    }

    /// Sets the status.
    pub fn with_status(mut self, status: SchemaStatus) -> Self {
        self.status = status;
        self
    }

    /// Marks the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Returns true for composite indexes.
    pub fn is_composite(&self) -> bool {
        matches!(self.index_type, IndexType::Composite)
    }

    /// Returns true for externally maintained indexes.
    pub fn is_mixed(&self) -> bool {
        matches!(self.index_type, IndexType::Mixed { .. })
    }

    /// Column range of a relation-type index inside a vertex row.
    pub fn relation_slice(&self) -> Option<Result<SliceQuery>> {
        match &self.index_type {
            IndexType::RelationType {
                column_start,
                column_end,
            } => Some(SliceQuery::new(
                StaticBuffer::copy_from_slice(column_start),
                StaticBuffer::copy_from_slice(column_end),
            )),
            _ => None,
        }
    }
}

/// Read-only view of the external schema manager.
pub trait SchemaInspector: Send + Sync {
    /// Descriptor of index `name`.
    fn index(&self, name: &str) -> Result<IndexDescriptor>;

    /// Storage field name of `key` inside the external index `backing_index`.
    fn storage_field(&self, backing_index: &str, key: &str) -> Option<String>;

    /// Returns true for vertex ids reserved for internal, invisible vertices.
    fn is_reserved_vertex(&self, id: ElementId) -> bool {
        let _ = id;
        false
    }
}

/// Schema held in memory; stands in for the schema manager in tests and
/// embedded deployments.
#[derive(Default)]
pub struct StaticSchema {
    indexes: RwLock<FxHashMap<String, IndexDescriptor>>,
    fields: RwLock<FxHashMap<(String, String), String>>,
    reserved_vertices: Option<Range<u64>>,
}

impl StaticSchema {
    /// Empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares vertex ids in `range` invisible.
    pub fn with_reserved_vertices(mut self, range: Range<u64>) -> Self {
        self.reserved_vertices = Some(range);
        self
    }

    /// Adds or replaces an index.
    pub fn define(&self, descriptor: IndexDescriptor) {
        self.indexes
            .write()
            .insert(descriptor.name.clone(), descriptor);
    }

    /// Maps `key` to `field` inside `backing_index`.
    pub fn map_field(&self, backing_index: &str, key: &str, field: &str) {
        self.fields.write().insert(
            (backing_index.to_string(), key.to_string()),
            field.to_string(),
        );
    }

    /// Moves an index to `status`.
    pub fn set_status(&self, name: &str, status: SchemaStatus) -> Result<()> {
        let mut indexes = self.indexes.write();
        let descriptor = indexes
            .get_mut(name)
            .ok_or_else(|| KcvError::NotFound(format!("index `{name}`")))?;
        descriptor.status = status;
        Ok(())
    }
}

impl SchemaInspector for StaticSchema {
    fn index(&self, name: &str) -> Result<IndexDescriptor> {
        self.indexes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| KcvError::NotFound(format!("index `{name}`")))
    }

    fn storage_field(&self, backing_index: &str, key: &str) -> Option<String> {
        self.fields
            .read()
            .get(&(backing_index.to_string(), key.to_string()))
            .cloned()
    }

    fn is_reserved_vertex(&self, id: ElementId) -> bool {
        self.reserved_vertices
            .as_ref()
            .is_some_and(|range| range.contains(&id.0))
    }
}
