use std::path::PathBuf;

use serde::Deserialize;

use crate::types::{KcvError, Result};

/// Backend adapter chosen at startup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Process-local maps; nothing survives a restart.
    #[default]
    InMemory,
    /// Checksummed append-only log under [`StorageOptions::path`].
    Embedded,
    /// Adapter registered under this name in a [`super::BackendRegistry`].
    External(String),
}

/// Configuration for opening the storage substrate.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Backend adapter to open
    pub backend: BackendKind,
    /// Data directory; required by the embedded adapter
    pub path: Option<PathBuf>,
    /// Whether the embedded adapter fsyncs every log record
    pub sync_writes: bool,
    /// Number of row slices kept by each store cache (0 disables caching)
    pub cache_capacity: usize,
    /// Maximum rows flushed per backend call on commit
    pub buffer_size: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            backend: BackendKind::InMemory,
            path: None,
            sync_writes: true,
            cache_capacity: 4096,
            buffer_size: 1024,
        }
    }
}

impl StorageOptions {
    /// In-memory defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Embedded adapter rooted at `path`.
    pub fn embedded(path: impl Into<PathBuf>) -> Self {
        Self::default()
            .backend(BackendKind::Embedded)
            .path(path)
    }

    /// Parses options from a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let options: StorageOptions = toml::from_str(src)
            .map_err(|err| KcvError::invalid(format!("storage options: {err}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(KcvError::invalid("buffer_size must be positive"));
        }
        if self.backend == BackendKind::Embedded && self.path.is_none() {
            return Err(KcvError::invalid("embedded backend requires a path"));
        }
        Ok(())
    }

    /// Selects the backend adapter.
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the data directory.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Enables or disables fsync per log record.
    pub fn sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }

    /// Sets the per-store cache capacity.
    pub fn cache_capacity(mut self, rows: usize) -> Self {
        self.cache_capacity = rows;
        self
    }

    /// Sets how many rows a commit flushes per backend call.
    pub fn buffer_size(mut self, rows: usize) -> Self {
        self.buffer_size = rows;
        self
    }
}
