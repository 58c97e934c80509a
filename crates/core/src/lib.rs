//! Reconciliation engine for the lending contracts.
//!
//! This crate keeps a local mirror of ledger state in step with the
//! contracts it drives:
//! - Arbitrary-precision [`Amount`] parsing and arithmetic
//! - Lending, borrowing, collateral and liquidation operation groups
//! - Per-user serialization and version-checked position updates
//! - Risk checks over values read fresh from the ledger
//! - Confirmation reconciler for receipts and failed bookkeeping
//!
//! The ledger is authoritative. Local rows are written only after a
//! submission is accepted.

mod amount;
mod backfill;
pub mod config;
mod error;
mod locks;
mod model;
mod ops;
mod reconciler;
mod risk;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use amount::{Amount, AmountError, WAD};
pub use backfill::{BackfillEntry, BackfillQueue, Submission};
pub use config::{ConfigError, EngineConfig, StoreBackend};
pub use error::{ErrorCategory, MirrorStage, OperationError};
pub use locks::UserLocks;
pub use model::{
    Position, PositionStatus, TransactionKind, TransactionRecord, TransactionStatus, UserAccount,
};
pub use ops::{
    BorrowingOperations, CollateralInfo, CollateralOperations, Engine, EngineContext,
    LendingOperations, LiquidationOperations,
};
pub use reconciler::{ConfirmationReconciler, ReconcileReport};
pub use risk::RiskEngine;
pub use store::{
    MemoryStore, PositionFilter, PositionStore, StoreError, Stores, TransactionFilter,
    TransactionLedger, UserDirectory,
};
