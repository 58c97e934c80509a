//! In-process store backed by `parking_lot` locks.

use super::{
    page_bounds, PositionFilter, PositionStore, StoreError, TransactionFilter, TransactionLedger,
    UserDirectory,
};
use crate::amount::Amount;
use crate::model::{Position, PositionStatus, TransactionRecord, TransactionStatus, UserAccount};
use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Default)]
pub struct MemoryStore {
    positions: RwLock<BTreeMap<i64, Position>>,
    transactions: RwLock<BTreeMap<i64, TransactionRecord>>,
    users: RwLock<BTreeMap<i64, UserAccount>>,
    next_position_id: AtomicI64,
    next_transaction_id: AtomicI64,
    next_user_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account; an address already present is returned as is.
    pub fn insert_user(&self, address: Address, active: bool) -> UserAccount {
        let mut users = self.users.write();
        if let Some(existing) = users.values().find(|u| u.address == address) {
            return existing.clone();
        }
        let id = self.next_user_id.fetch_add(1, Ordering::SeqCst) + 1;
        let account = UserAccount { id, address, active };
        users.insert(id, account.clone());
        account
    }

    pub fn set_user_active(&self, id: i64, active: bool) -> Result<(), StoreError> {
        let mut users = self.users.write();
        let user = users
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))?;
        user.active = active;
        Ok(())
    }
}

/// Newest first, id as tie-breaker.
fn newest_first<T>(items: &mut [T], key: impl Fn(&T) -> (chrono::DateTime<Utc>, i64)) {
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}

fn paginate<T>(items: Vec<T>, offset: i64, limit: i64) -> Vec<T> {
    let (offset, limit) = page_bounds(offset, limit);
    items.into_iter().skip(offset).take(limit).collect()
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn create(&self, mut position: Position) -> Result<Position, StoreError> {
        let mut positions = self.positions.write();
        if position.is_active()
            && positions
                .values()
                .any(|p| p.user_id == position.user_id && p.is_active())
        {
            return Err(StoreError::Conflict(format!(
                "user {} already has an active position",
                position.user_id
            )));
        }
        let now = Utc::now();
        position.id = self.next_position_id.fetch_add(1, Ordering::SeqCst) + 1;
        position.version = 0;
        position.created_at = now;
        position.updated_at = now;
        positions.insert(position.id, position.clone());
        Ok(position)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Position>, StoreError> {
        Ok(self.positions.read().get(&id).cloned())
    }

    async fn find_by_user_id(&self, user_id: i64) -> Result<Vec<Position>, StoreError> {
        let mut found: Vec<Position> = self
            .positions
            .read()
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        newest_first(&mut found, |p| (p.created_at, p.id));
        Ok(found)
    }

    async fn find_active_by_user_id(&self, user_id: i64) -> Result<Option<Position>, StoreError> {
        Ok(self
            .positions
            .read()
            .values()
            .find(|p| p.user_id == user_id && p.is_active())
            .cloned())
    }

    async fn update(&self, position: &Position) -> Result<Position, StoreError> {
        let mut positions = self.positions.write();
        let stored = positions
            .get_mut(&position.id)
            .ok_or_else(|| StoreError::NotFound(format!("position {}", position.id)))?;
        if stored.version != position.version {
            return Err(StoreError::VersionConflict { id: position.id });
        }
        if stored.status.is_terminal() && stored.status != position.status {
            return Err(StoreError::Conflict(format!(
                "position {} is {} and cannot change status",
                position.id, stored.status
            )));
        }
        let mut next = position.clone();
        next.user_id = stored.user_id;
        next.created_at = stored.created_at;
        next.version = stored.version + 1;
        next.updated_at = Utc::now();
        *stored = next.clone();
        Ok(next)
    }

    async fn update_status(&self, id: i64, status: PositionStatus) -> Result<Position, StoreError> {
        let mut positions = self.positions.write();
        let stored = positions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("position {id}")))?;
        if !stored.is_active() {
            return Err(StoreError::Conflict(format!(
                "position {id} is {} and cannot change status",
                stored.status
            )));
        }
        stored.status = status;
        stored.version += 1;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn find_at_risk(&self, threshold: Amount) -> Result<Vec<Position>, StoreError> {
        let mut found: Vec<Position> = self
            .positions
            .read()
            .values()
            .filter(|p| p.is_active() && !p.borrowed_amount.is_zero())
            .filter(|p| p.health_factor.is_some_and(|hf| hf <= threshold))
            .cloned()
            .collect();
        found.sort_by_key(|p| (p.health_factor, p.id));
        Ok(found)
    }

    async fn list(
        &self,
        filter: &PositionFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Position>, StoreError> {
        let mut found: Vec<Position> = self
            .positions
            .read()
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        newest_first(&mut found, |p| (p.created_at, p.id));
        Ok(paginate(found, offset, limit))
    }

    async fn count(&self, filter: &PositionFilter) -> Result<i64, StoreError> {
        Ok(self.positions.read().values().filter(|p| filter.matches(p)).count() as i64)
    }
}

#[async_trait]
impl TransactionLedger for MemoryStore {
    async fn create(&self, mut record: TransactionRecord) -> Result<TransactionRecord, StoreError> {
        let mut transactions = self.transactions.write();
        if transactions
            .values()
            .any(|t| t.hash == record.hash && t.user_id == record.user_id)
        {
            return Err(StoreError::Conflict(format!(
                "transaction {} already recorded for user {}",
                record.hash, record.user_id
            )));
        }
        let now = Utc::now();
        record.id = self.next_transaction_id.fetch_add(1, Ordering::SeqCst) + 1;
        record.created_at = now;
        record.updated_at = now;
        transactions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<TransactionRecord>, StoreError> {
        Ok(self.transactions.read().get(&id).cloned())
    }

    async fn find_by_hash(&self, hash: B256) -> Result<Vec<TransactionRecord>, StoreError> {
        Ok(self
            .transactions
            .read()
            .values()
            .filter(|t| t.hash == hash)
            .cloned()
            .collect())
    }

    async fn find_by_user_id(&self, user_id: i64) -> Result<Vec<TransactionRecord>, StoreError> {
        let mut found: Vec<TransactionRecord> = self
            .transactions
            .read()
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        newest_first(&mut found, |t| (t.created_at, t.id));
        Ok(found)
    }

    async fn update(&self, record: &TransactionRecord) -> Result<TransactionRecord, StoreError> {
        let mut transactions = self.transactions.write();
        let stored = transactions
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {}", record.id)))?;
        let mut next = record.clone();
        next.created_at = stored.created_at;
        next.updated_at = Utc::now();
        *stored = next.clone();
        Ok(next)
    }

    async fn find_pending(&self, limit: i64) -> Result<Vec<TransactionRecord>, StoreError> {
        let mut found: Vec<TransactionRecord> = self
            .transactions
            .read()
            .values()
            .filter(|t| t.status == TransactionStatus::Pending)
            .cloned()
            .collect();
        found.sort_by_key(|t| (t.created_at, t.id));
        Ok(paginate(found, 0, limit))
    }

    async fn list(
        &self,
        filter: &TransactionFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let mut found: Vec<TransactionRecord> = self
            .transactions
            .read()
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        newest_first(&mut found, |t| (t.created_at, t.id));
        Ok(paginate(found, offset, limit))
    }

    async fn count(&self, filter: &TransactionFilter) -> Result<i64, StoreError> {
        Ok(self
            .transactions
            .read()
            .values()
            .filter(|t| filter.matches(t))
            .count() as i64)
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn find_by_address(&self, address: Address) -> Result<Option<UserAccount>, StoreError> {
        Ok(self
            .users
            .read()
            .values()
            .find(|u| u.address == address)
            .cloned())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<UserAccount>, StoreError> {
        Ok(self.users.read().get(&id).cloned())
    }
}
