//! Backend adapters and the configuration-driven selector.

mod embedded;
mod memory;

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::info;

use crate::storage::kcv::StoreManager;
use crate::storage::options::{BackendKind, StorageOptions};
use crate::types::{KcvError, Result};

pub use embedded::{EmbeddedOptions, EmbeddedStore, EmbeddedStoreManager, ReplayStats};
pub use memory::{InMemoryStore, InMemoryStoreManager};

/// Builds an external adapter (column-store driver) from storage options.
pub type BackendFactory =
    Arc<dyn Fn(&StorageOptions) -> Result<Arc<dyn StoreManager>> + Send + Sync>;

/// Named factories for adapters living outside this crate.
#[derive(Default)]
pub struct BackendRegistry {
    factories: RwLock<FxHashMap<String, BackendFactory>>,
}

impl BackendRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, factory: BackendFactory) {
        self.factories.write().insert(name.into(), factory);
    }

    /// Returns true when `name` has a factory.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    fn get(&self, name: &str) -> Option<BackendFactory> {
        self.factories.read().get(name).cloned()
    }
}

/// Opens the built-in adapter selected by `options`.
pub fn open_manager(options: &StorageOptions) -> Result<Arc<dyn StoreManager>> {
    open_manager_with(options, &BackendRegistry::new())
}

/// Opens the adapter selected by `options`, resolving external adapters
/// through `registry`.
pub fn open_manager_with(
    options: &StorageOptions,
    registry: &BackendRegistry,
) -> Result<Arc<dyn StoreManager>> {
    options.validate()?;
    let manager: Arc<dyn StoreManager> = match &options.backend {
        BackendKind::InMemory => Arc::new(InMemoryStoreManager::new()),
        BackendKind::Embedded => {
            let dir = options
                .path
                .clone()
                .ok_or_else(|| KcvError::invalid("embedded backend requires a path"))?;
            let embedded = EmbeddedOptions::new(dir).sync_writes(options.sync_writes);
            Arc::new(EmbeddedStoreManager::open(&embedded)?)
        }
        BackendKind::External(name) => {
            let factory = registry
                .get(name)
                .ok_or_else(|| KcvError::NotFound(format!("backend adapter `{name}`")))?;
            factory(options)?
        }
    };
    info!(backend = manager.name(), features = ?manager.features(), "kcv.backend.open");
    Ok(manager)
}
