use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::primitives::bytes::StaticBuffer;
use crate::storage::kcv::{KeyColumnValueStore, SliceQuery, StoreManager};
use crate::types::{KcvError, NamespaceId, PartitionId, Result};

use super::{IdAuthorityOptions, IdBlock, IdBlockSizer};

fn watermark_column() -> StaticBuffer {
    StaticBuffer::from_static(&[0x00])
}

fn watermark_key(partition: PartitionId, namespace: NamespaceId) -> StaticBuffer {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&partition.0.to_be_bytes());
    key[4..].copy_from_slice(&namespace.0.to_be_bytes());
    StaticBuffer::copy_from_slice(&key)
}

fn watermark_slice() -> SliceQuery {
    SliceQuery::prefix(watermark_column())
}

/// Hands out non-overlapping ID blocks backed by conditional writes.
///
/// Opened with the graph and closed with it; several authorities over the
/// same store coordinate only through the watermark cells.
pub struct IdAuthority {
    store: Arc<dyn KeyColumnValueStore>,
    sizer: Arc<dyn IdBlockSizer>,
    options: IdAuthorityOptions,
    closed: AtomicBool,
}

impl IdAuthority {
    /// Opens the authority on `manager`, failing when the backend cannot do
    /// conditional writes.
    pub fn open(
        manager: &dyn StoreManager,
        sizer: Arc<dyn IdBlockSizer>,
        options: IdAuthorityOptions,
    ) -> Result<Self> {
        if !manager.features().conditional_writes {
            return Err(KcvError::UnsupportedFeature("conditional writes"));
        }
        let store = manager.open_store(&options.store_name)?;
        info!(backend = manager.name(), store = %options.store_name, "ids.authority.open");
        Ok(Self {
            store,
            sizer,
            options,
            closed: AtomicBool::new(false),
        })
    }

    /// Stops serving blocks; later requests fail with [`KcvError::Closed`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(store = %self.options.store_name, "ids.authority.close");
        }
    }

    /// Returns true once [`IdAuthority::close`] ran.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Block size configured for `namespace`.
    pub fn block_size(&self, namespace: NamespaceId) -> u64 {
        self.sizer.block_size(namespace)
    }

    /// Upper bound configured for `namespace`.
    pub fn id_upper_bound(&self, namespace: NamespaceId) -> u64 {
        self.sizer.id_upper_bound(namespace)
    }

    /// Next unclaimed ID of the pair; 0 when nothing was claimed yet.
    pub fn current_watermark(&self, partition: PartitionId, namespace: NamespaceId) -> Result<u64> {
        self.ensure_open()?;
        let key = watermark_key(partition, namespace);
        Ok(self.read_watermark(&key)?.1)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(KcvError::Closed("id authority"));
        }
        Ok(())
    }

    fn read_watermark(&self, key: &StaticBuffer) -> Result<(Option<StaticBuffer>, u64)> {
        let entries = self.store.get_slice(key, &watermark_slice())?;
        let cell = entries
            .into_iter()
            .find(|e| e.column.as_slice() == [0x00])
            .map(|e| e.value);
        let watermark = match &cell {
            Some(value) => value.as_u64().map_err(|_| {
                KcvError::corruption(format!("id watermark {key:?} holds {value:?}"))
            })?,
            None => 0,
        };
        Ok((cell, watermark))
    }

    /// Claims the next block of `namespace` in `partition`.
    ///
    /// Conflicting claims and transient backend errors are retried with
    /// jittered exponential backoff until `timeout` elapses, then fail with
    /// [`KcvError::UniqueIdConflict`]. A block that would pass the namespace
    /// upper bound fails at once with [`KcvError::IdPoolExhausted`].
    pub fn get_id_block(
        &self,
        partition: PartitionId,
        namespace: NamespaceId,
        timeout: Duration,
    ) -> Result<IdBlock> {
        self.ensure_open()?;
        let block_size = self.sizer.block_size(namespace);
        if block_size == 0 {
            return Err(KcvError::invalid(format!(
                "block size of namespace {namespace} must be positive"
            )));
        }
        let upper_bound = self.sizer.id_upper_bound(namespace);
        let key = watermark_key(partition, namespace);
        let started = Instant::now();
        let mut backoff = Duration::from_millis(self.options.initial_backoff_ms.max(1));
        let max_backoff = Duration::from_millis(self.options.max_backoff_ms.max(1));
        let mut attempts = 0u32;
        loop {
            self.ensure_open()?;
            attempts += 1;
            match self.try_claim(&key, partition, namespace, block_size, upper_bound) {
                Ok(Some(block)) => {
                    debug!(
                        partition = partition.0,
                        namespace = namespace.0,
                        start = block.start,
                        end = block.end,
                        attempts,
                        "ids.block.acquired"
                    );
                    return Ok(block);
                }
                Ok(None) => {
                    debug!(partition = partition.0, namespace = namespace.0, attempts, "ids.block.conflict");
                }
                Err(err) if err.is_retryable() => {
                    warn!(partition = partition.0, namespace = namespace.0, attempts, error = %err, "ids.block.retry");
                }
                Err(err) => return Err(err),
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                warn!(
                    partition = partition.0,
                    namespace = namespace.0,
                    attempts,
                    waited_ms = elapsed.as_millis() as u64,
                    "ids.block.timeout"
                );
                return Err(KcvError::UniqueIdConflict {
                    partition,
                    namespace,
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
            let wait = (backoff + Duration::from_millis(jitter_ms)).min(timeout - elapsed);
            thread::sleep(wait);
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    fn try_claim(
        &self,
        key: &StaticBuffer,
        partition: PartitionId,
        namespace: NamespaceId,
        block_size: u64,
        upper_bound: u64,
    ) -> Result<Option<IdBlock>> {
        let (current, start) = self.read_watermark(key)?;
        let end = match start.checked_add(block_size) {
            Some(end) if end <= upper_bound => end,
            _ => {
                warn!(partition = partition.0, namespace = namespace.0, start, upper_bound, "ids.block.exhausted");
                return Err(KcvError::IdPoolExhausted {
                    partition,
                    namespace,
                    upper_bound,
                });
            }
        };
        let claimed = self.store.compare_and_swap(
            key,
            &watermark_column(),
            current.as_ref(),
            &StaticBuffer::from_u64(end),
        )?;
        Ok(claimed.then_some(IdBlock {
            partition,
            namespace,
            start,
            end,
        }))
    }
}

impl Drop for IdAuthority {
    fn drop(&mut self) {
        self.close();
    }
}
