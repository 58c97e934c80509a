//! Per-user serialization of mutating operations.
//!
//! Every mutating operation holds its user's lock across the whole
//! validate → submit → record → mirror sequence, so two requests for the same
//! user never interleave their read-modify-write of the position mirror.
//! Different users proceed in parallel.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

#[derive(Debug, Default)]
pub struct UserLocks {
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `user_id`.
    pub async fn lock(&self, user_id: i64) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the shard guard is released before awaiting.
        let mutex = self
            .locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        trace!(user_id = user_id, "Acquiring user lock");
        mutex.lock_owned().await
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
