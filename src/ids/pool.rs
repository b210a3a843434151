use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::types::{KcvError, NamespaceId, PartitionId, Result};

use super::{IdAuthority, IdBlock};

struct PoolState {
    block: Option<IdBlock>,
    next: u64,
    closed: bool,
}

/// Hands out single IDs of one `(partition, namespace)` pair, claiming a
/// fresh block from the authority whenever the current one runs out.
pub struct IdPool {
    authority: Arc<IdAuthority>,
    partition: PartitionId,
    namespace: NamespaceId,
    renew_timeout: Duration,
    state: Mutex<PoolState>,
}

impl IdPool {
    /// Creates an empty pool; the first call to [`IdPool::next_id`] claims a block.
    pub fn new(
        authority: Arc<IdAuthority>,
        partition: PartitionId,
        namespace: NamespaceId,
        renew_timeout: Duration,
    ) -> Self {
        Self {
            authority,
            partition,
            namespace,
            renew_timeout,
            state: Mutex::new(PoolState {
                block: None,
                next: 0,
                closed: false,
            }),
        }
    }

    /// Next unused ID.
    pub fn next_id(&self) -> Result<u64> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(KcvError::Closed("id pool"));
        }
        let exhausted = state.block.map_or(true, |b| state.next >= b.end);
        if exhausted {
            let block =
                self.authority
                    .get_id_block(self.partition, self.namespace, self.renew_timeout)?;
            trace!(
                partition = self.partition.0,
                namespace = self.namespace.0,
                start = block.start,
                end = block.end,
                "ids.pool.renew"
            );
            state.next = block.start;
            state.block = Some(block);
        }
        let id = state.next;
        state.next += 1;
        Ok(id)
    }

    /// Block currently being drained, if any.
    pub fn current_block(&self) -> Option<IdBlock> {
        self.state.lock().block
    }

    /// Stops handing out IDs; the unused rest of the current block is lost.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.block = None;
    }
}
