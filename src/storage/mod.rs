//! Key-column-value storage substrate.
//!
//! Backend adapters implement the [`kcv`] contract; the write buffer and
//! cache in [`tx`] and [`cache`] sit on top and never see which adapter is
//! underneath.

/// Backend adapters and the configuration-driven selector.
pub mod backend;

/// Read-through slice cache.
pub mod cache;

/// The store contract, slice queries and key selectors.
pub mod kcv;

/// Transaction write buffer.
pub mod tx;

mod options;

use std::sync::Arc;

use tracing::info;

pub use backend::{open_manager, open_manager_with, BackendRegistry};
pub use cache::{KcvsCache, NO_ADDITIONS, NO_DELETIONS};
pub use options::{BackendKind, StorageOptions};
pub use tx::{BackendTransaction, CachedStores, StoreResolver, TxState};

use crate::types::Result;
use kcv::{StoreFeatures, StoreManager};

/// An opened backend plus the shared per-store caches transactions read through.
pub struct Backend {
    manager: Arc<dyn StoreManager>,
    stores: Arc<CachedStores>,
    options: StorageOptions,
}

impl Backend {
    /// Opens the built-in adapter selected by `options`.
    pub fn open(options: StorageOptions) -> Result<Self> {
        Self::open_with(options, &BackendRegistry::new())
    }

    /// Opens the adapter selected by `options`, resolving external adapters
    /// through `registry`.
    pub fn open_with(options: StorageOptions, registry: &BackendRegistry) -> Result<Self> {
        let manager = open_manager_with(&options, registry)?;
        Ok(Self::from_manager(manager, options))
    }

    /// Wraps an already opened manager.
    pub fn from_manager(manager: Arc<dyn StoreManager>, options: StorageOptions) -> Self {
        let stores = Arc::new(CachedStores::new(
            Arc::clone(&manager),
            options.cache_capacity,
        ));
        Self {
            manager,
            stores,
            options,
        }
    }

    /// Underlying store manager.
    pub fn manager(&self) -> &Arc<dyn StoreManager> {
        &self.manager
    }

    /// Backend capabilities.
    pub fn features(&self) -> StoreFeatures {
        self.manager.features()
    }

    /// Options the backend was opened with.
    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Cache-fronted handle of store `name`.
    pub fn store(&self, name: &str) -> Result<Arc<KcvsCache>> {
        self.stores.store(name)
    }

    /// Starts a write-buffered transaction.
    pub fn begin(&self) -> BackendTransaction {
        let resolver: Arc<dyn StoreResolver> = Arc::clone(&self.stores) as Arc<dyn StoreResolver>;
        BackendTransaction::new(
            Arc::clone(&self.manager),
            resolver,
            self.options.buffer_size,
        )
    }

    /// Drops all data in every store.
    pub fn clear_storage(&self) -> Result<()> {
        self.stores.clear();
        self.manager.clear_storage()
    }

    /// Closes the underlying manager.
    pub fn close(&self) -> Result<()> {
        info!(backend = self.manager.name(), "kcv.backend.close");
        self.manager.close()
    }
}
