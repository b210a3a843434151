use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::primitives::codec::DataType;

/// How many values one element may hold for a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// At most one value.
    Single,
    /// Any number of values, duplicates allowed.
    List,
    /// Any number of distinct values.
    Set,
}

/// Opaque indexing option forwarded to an index backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Option name.
    pub key: String,
    /// Option value.
    pub value: serde_json::Value,
}

impl Parameter {
    /// Creates a parameter.
    pub fn new(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Static metadata of one indexed attribute key in one store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyInformation {
    data_type: DataType,
    cardinality: Cardinality,
    parameters: Vec<Parameter>,
}

impl KeyInformation {
    /// Metadata with no indexing parameters.
    pub fn new(data_type: DataType, cardinality: Cardinality) -> Self {
        Self {
            data_type,
            cardinality,
            parameters: Vec::new(),
        }
    }

    /// Adds an indexing parameter.
    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Declared value type.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Declared cardinality.
    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    /// Indexing parameters.
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Looks up a parameter by name.
    pub fn parameter(&self, key: &str) -> Option<&serde_json::Value> {
        self.parameters
            .iter()
            .find(|p| p.key == key)
            .map(|p| &p.value)
    }
}

/// Key metadata of one store.
pub trait StoreRetriever: Send + Sync {
    /// Metadata of `key`, if indexed in this store.
    fn get(&self, key: &str) -> Option<Arc<KeyInformation>>;
}

/// Key metadata of one index, per store.
pub trait IndexRetriever: Send + Sync {
    /// Metadata of `key` in `store`.
    fn get(&self, store: &str, key: &str) -> Option<Arc<KeyInformation>> {
        self.store(store).and_then(|s| s.get(key))
    }

    /// Retriever scoped to `store`.
    fn store(&self, store: &str) -> Option<Arc<dyn StoreRetriever>>;
}

/// Entry point resolving an index name to its key metadata.
pub trait Retriever: Send + Sync {
    /// Retriever of `index`.
    fn index(&self, index: &str) -> Option<Arc<dyn IndexRetriever>>;
}

/// Keys registered for one store.
#[derive(Default)]
pub struct StoreKeys {
    keys: FxHashMap<String, Arc<KeyInformation>>,
}

impl StoreRetriever for StoreKeys {
    fn get(&self, key: &str) -> Option<Arc<KeyInformation>> {
        self.keys.get(key).cloned()
    }
}

/// Stores registered for one index.
#[derive(Default)]
pub struct IndexKeys {
    stores: FxHashMap<String, Arc<StoreKeys>>,
}

impl IndexRetriever for IndexKeys {
    fn store(&self, store: &str) -> Option<Arc<dyn StoreRetriever>> {
        self.stores
            .get(store)
            .map(|s| Arc::clone(s) as Arc<dyn StoreRetriever>)
    }
}

/// Immutable registry built once from schema definitions.
#[derive(Default)]
pub struct KeyInformationRegistry {
    indexes: FxHashMap<String, Arc<IndexKeys>>,
}

impl KeyInformationRegistry {
    /// Starts an empty registry.
    pub fn builder() -> KeyInformationRegistryBuilder {
        KeyInformationRegistryBuilder::default()
    }
}

impl Retriever for KeyInformationRegistry {
    fn index(&self, index: &str) -> Option<Arc<dyn IndexRetriever>> {
        self.indexes
            .get(index)
            .map(|i| Arc::clone(i) as Arc<dyn IndexRetriever>)
    }
}

/// Collects key metadata before freezing it into a [`KeyInformationRegistry`].
#[derive(Default)]
pub struct KeyInformationRegistryBuilder {
    entries: FxHashMap<String, FxHashMap<String, FxHashMap<String, Arc<KeyInformation>>>>,
}

impl KeyInformationRegistryBuilder {
    /// Registers `info` for `key` of `store` in `index`.
    pub fn key(
        mut self,
        index: impl Into<String>,
        store: impl Into<String>,
        key: impl Into<String>,
        info: KeyInformation,
    ) -> Self {
        self.entries
            .entry(index.into())
            .or_default()
            .entry(store.into())
            .or_default()
            .insert(key.into(), Arc::new(info));
        self
    }

    /// Freezes the registry.
    pub fn build(self) -> KeyInformationRegistry {
        let indexes = self
            .entries
            .into_iter()
            .map(|(index, stores)| {
                let stores = stores
                    .into_iter()
                    .map(|(store, keys)| (store, Arc::new(StoreKeys { keys })))
                    .collect();
                (index, Arc::new(IndexKeys { stores }))
            })
            .collect();
        KeyInformationRegistry { indexes }
    }
}
