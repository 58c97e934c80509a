//! Persistence contracts for the local mirror.
//!
//! - [`PositionStore`]: positions, with version-conditional updates
//! - [`TransactionLedger`]: submitted transaction records
//! - [`UserDirectory`]: account lookup
//!
//! Lists are ordered newest first. [`MemoryStore`] implements all three for
//! tests and single-process deployments; the PostgreSQL implementation lives
//! in the `lendsync-store` crate.

mod memory;

pub use memory::MemoryStore;

use crate::amount::Amount;
use crate::model::{
    Position, PositionStatus, TransactionKind, TransactionRecord, TransactionStatus, UserAccount,
};
use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    /// Uniqueness rule violated (second active position, duplicate `(hash, user)`)
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("position {id} was modified concurrently")]
    VersionConflict { id: i64 },

    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Equality filters for position queries; `None` matches anything.
#[derive(Debug, Clone, Default)]
pub struct PositionFilter {
    pub user_id: Option<i64>,
    pub status: Option<PositionStatus>,
    pub collateral_token: Option<Address>,
    pub borrowed_token: Option<Address>,
}

impl PositionFilter {
    pub fn matches(&self, position: &Position) -> bool {
        self.user_id.map_or(true, |v| position.user_id == v)
            && self.status.map_or(true, |v| position.status == v)
            && self.collateral_token.map_or(true, |v| position.collateral_token == v)
            && self.borrowed_token.map_or(true, |v| position.borrowed_token == v)
    }
}

/// Filters for transaction queries. `kinds` is an IN list; an empty list
/// matches every kind.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub user_id: Option<i64>,
    pub kinds: Vec<TransactionKind>,
    pub status: Option<TransactionStatus>,
    pub hash: Option<B256>,
    pub token_address: Option<Address>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl TransactionFilter {
    pub fn for_user(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            ..Default::default()
        }
    }

    pub fn with_kinds(mut self, kinds: &[TransactionKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn with_status(mut self, status: TransactionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, record: &TransactionRecord) -> bool {
        self.user_id.map_or(true, |v| record.user_id == v)
            && (self.kinds.is_empty() || self.kinds.contains(&record.kind))
            && self.status.map_or(true, |v| record.status == v)
            && self.hash.map_or(true, |v| record.hash == v)
            && self.token_address.map_or(true, |v| record.token_address == v)
            && self.created_after.map_or(true, |v| record.created_at >= v)
            && self.created_before.map_or(true, |v| record.created_at < v)
    }
}

#[async_trait]
pub trait PositionStore: Send + Sync + Debug {
    /// Insert a new position. A second Active position for the same user is
    /// rejected with [`StoreError::Conflict`].
    async fn create(&self, position: Position) -> Result<Position, StoreError>;

    async fn find_by_id(&self, id: i64) -> Result<Option<Position>, StoreError>;

    /// All positions of a user, newest first.
    async fn find_by_user_id(&self, user_id: i64) -> Result<Vec<Position>, StoreError>;

    async fn find_active_by_user_id(&self, user_id: i64) -> Result<Option<Position>, StoreError>;

    /// Write `position` if the stored version still equals `position.version`.
    /// Returns the stored row with the bumped version.
    async fn update(&self, position: &Position) -> Result<Position, StoreError>;

    /// Move an Active position to a terminal status.
    async fn update_status(&self, id: i64, status: PositionStatus) -> Result<Position, StoreError>;

    /// Active positions with debt whose mirrored health factor is at or below
    /// `threshold`, compared numerically.
    async fn find_at_risk(&self, threshold: Amount) -> Result<Vec<Position>, StoreError>;

    async fn list(
        &self,
        filter: &PositionFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Position>, StoreError>;

    async fn count(&self, filter: &PositionFilter) -> Result<i64, StoreError>;
}

#[async_trait]
pub trait TransactionLedger: Send + Sync + Debug {
    /// Insert a record; a duplicate `(hash, user_id)` is a [`StoreError::Conflict`].
    async fn create(&self, record: TransactionRecord) -> Result<TransactionRecord, StoreError>;

    async fn find_by_id(&self, id: i64) -> Result<Option<TransactionRecord>, StoreError>;

    /// Every row sharing `hash` (two for a liquidation).
    async fn find_by_hash(&self, hash: B256) -> Result<Vec<TransactionRecord>, StoreError>;

    async fn find_by_user_id(&self, user_id: i64) -> Result<Vec<TransactionRecord>, StoreError>;

    async fn update(&self, record: &TransactionRecord) -> Result<TransactionRecord, StoreError>;

    /// Pending rows, oldest first.
    async fn find_pending(&self, limit: i64) -> Result<Vec<TransactionRecord>, StoreError>;

    async fn list(
        &self,
        filter: &TransactionFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, StoreError>;

    async fn count(&self, filter: &TransactionFilter) -> Result<i64, StoreError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync + Debug {
    async fn find_by_address(&self, address: Address) -> Result<Option<UserAccount>, StoreError>;

    async fn find_by_id(&self, id: i64) -> Result<Option<UserAccount>, StoreError>;
}

/// Store handles passed to every operation group.
#[derive(Debug, Clone)]
pub struct Stores {
    pub positions: Arc<dyn PositionStore>,
    pub transactions: Arc<dyn TransactionLedger>,
    pub users: Arc<dyn UserDirectory>,
}

impl Stores {
    /// All three handles backed by one shared value.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: PositionStore + TransactionLedger + UserDirectory + 'static,
    {
        Self {
            positions: store.clone(),
            transactions: store.clone(),
            users: store,
        }
    }
}

/// Clamp caller-supplied pagination to sane bounds.
pub fn page_bounds(offset: i64, limit: i64) -> (usize, usize) {
    let offset = offset.max(0) as usize;
    let limit = limit.clamp(0, 1_000) as usize;
    (offset, limit)
}
