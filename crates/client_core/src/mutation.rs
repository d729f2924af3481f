use std::sync::Arc;

use tracing::debug;

use crate::cache::{CacheEntry, CacheEvent, CacheKey, CacheStore, DispatchOutcome};

/// Snapshot-before, apply-optimistic, then commit or roll back.
///
/// Captured entries are restored verbatim on rollback; there is no other undo
/// path for optimistic writes.
pub struct OptimisticMutation {
    cache: Arc<CacheStore>,
    snapshots: Vec<(CacheKey, Option<CacheEntry>)>,
    settled: bool,
}

impl OptimisticMutation {
    pub fn begin(cache: Arc<CacheStore>, keys: impl IntoIterator<Item = CacheKey>) -> Self {
        let snapshots = keys
            .into_iter()
            .map(|key| {
                let entry = cache.get(&key);
                (key, entry)
            })
            .collect();
        Self {
            cache,
            snapshots,
            settled: false,
        }
    }

    pub fn apply(&self, event: CacheEvent) -> DispatchOutcome {
        self.cache.dispatch(event)
    }

    pub fn commit(mut self) {
        self.settled = true;
    }

    pub fn rollback(mut self) {
        self.settled = true;
        for (key, entry) in self.snapshots.drain(..).rev() {
            debug!(?key, "sync: rolling back optimistic write");
            self.cache.restore(key, entry);
        }
    }
}

impl Drop for OptimisticMutation {
    fn drop(&mut self) {
        if !self.settled && !self.snapshots.is_empty() {
            debug!(
                keys = self.snapshots.len(),
                "sync: optimistic write dropped without settling, keeping applied state"
            );
        }
    }
}

#[cfg(test)]
#[path = "tests/mutation_tests.rs"]
mod tests;
