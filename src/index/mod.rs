#![forbid(unsafe_code)]
//! Index metadata, composite index serialization and mixed-index queries.

mod key_info;
mod query;
mod schema;
mod serializer;

use serde::Deserialize;

pub use key_info::{
    Cardinality, IndexKeys, IndexRetriever, KeyInformation, KeyInformationRegistry,
    KeyInformationRegistryBuilder, Parameter, Retriever, StoreKeys, StoreRetriever,
};
pub use query::{
    substitute_keys, ElementCategory, IndexProvider, IndexQuery, IndexQueryBuilder, RawQuery,
    RawResult, EDGE_PREFIX, PROPERTY_PREFIX, VERTEX_PREFIX,
};
pub use schema::{
    IndexDescriptor, IndexField, IndexType, SchemaInspector, SchemaStatus, StaticSchema,
};
pub use serializer::{get_index_id_from_key, IndexEntry, IndexSerializer};

/// Default store holding composite index rows.
pub const GRAPH_INDEX_STORE: &str = "graphindex";
/// Default store holding vertex rows and their relations.
pub const EDGE_STORE: &str = "edgestore";

/// Index-layer settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct IndexOptions {
    /// Field name substituted for key references that do not resolve
    pub unknown_key_name: String,
    /// Store holding composite index rows
    pub index_store: String,
    /// Store holding vertex rows
    pub edge_store: String,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            unknown_key_name: "__unknown_key__".to_string(),
            index_store: GRAPH_INDEX_STORE.to_string(),
            edge_store: EDGE_STORE.to_string(),
        }
    }
}

impl IndexOptions {
    /// Sets the fallback field name for unresolved keys.
    pub fn unknown_key_name(mut self, name: impl Into<String>) -> Self {
        self.unknown_key_name = name.into();
        self
    }

    /// Sets the composite index store.
    pub fn index_store(mut self, name: impl Into<String>) -> Self {
        self.index_store = name.into();
        self
    }

    /// Sets the vertex row store.
    pub fn edge_store(mut self, name: impl Into<String>) -> Self {
        self.edge_store = name.into();
        self
    }
}
