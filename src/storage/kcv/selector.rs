use std::fmt;
use std::sync::Arc;

use crate::primitives::bytes::StaticBuffer;
use crate::types::{KcvError, Result};

/// Shared key-acceptance predicate.
pub type KeyFilter = Arc<dyn Fn(&StaticBuffer) -> bool + Send + Sync>;

/// Key predicate plus a cap on how many keys a scan may accept.
///
/// The accepted count only grows, so once [`KeySelector::reached_limit`]
/// reports true it stays true.
pub struct KeySelector {
    filter: KeyFilter,
    limit: usize,
    accepted: usize,
}

impl KeySelector {
    /// Creates a selector; `limit` must be positive.
    pub fn new(filter: KeyFilter, limit: usize) -> Result<Self> {
        if limit == 0 {
            return Err(KcvError::invalid(
                "key selector limit must be positive, given 0",
            ));
        }
        Ok(Self {
            filter,
            limit,
            accepted: 0,
        })
    }

    /// Selector accepting every key.
    pub fn of(limit: usize) -> Result<Self> {
        Self::new(Arc::new(|_: &StaticBuffer| true), limit)
    }

    /// Evaluates `key` and counts it when accepted. Once the limit has been
    /// reached no further key is evaluated or accepted.
    pub fn include(&mut self, key: &StaticBuffer) -> bool {
        if self.reached_limit() {
            return false;
        }
        if (self.filter)(key) {
            self.accepted += 1;
            true
        } else {
            false
        }
    }

    /// Returns true once `accepted >= limit`.
    pub fn reached_limit(&self) -> bool {
        self.accepted >= self.limit
    }

    /// Keys accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    /// Configured limit.
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl fmt::Debug for KeySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySelector")
            .field("limit", &self.limit)
            .field("accepted", &self.accepted)
            .finish()
    }
}
