//! Gateway traits for the three lending contracts.
//!
//! Each contract gets its own trait so the reconciliation engine never sees
//! ABI details:
//!
//! - [`LendingPoolGateway`]: supply-side deposits and withdrawals
//! - [`BorrowingGateway`]: borrow, repay, debt and rate reads
//! - [`CollateralGateway`]: collateral custody, ratios and liquidation
//! - [`ReceiptSource`]: receipt lookup for submitted transactions
//!
//! Submissions return as soon as the node accepts the transaction. Inclusion
//! is tracked separately through [`ReceiptSource`].

use alloy::primitives::{Address, B256, U256};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// A transaction accepted by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubmittedTx {
    /// Transaction hash
    pub hash: B256,
}

impl SubmittedTx {
    pub fn new(hash: B256) -> Self {
        Self { hash }
    }
}

/// Outcome of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub hash: B256,
    /// `false` when the transaction reverted
    pub success: bool,
    pub block_number: Option<u64>,
    pub gas_used: u64,
    /// Effective gas price in wei
    pub gas_price: u128,
}

/// Supply-side pool.
#[async_trait]
pub trait LendingPoolGateway: Send + Sync + Debug {
    /// Contract address, also used as the token address of supply records.
    fn address(&self) -> Address;

    async fn deposit(&self, user: Address, amount: U256) -> Result<SubmittedTx>;

    async fn withdraw(&self, user: Address, amount: U256) -> Result<SubmittedTx>;

    /// Balance including accrued interest.
    async fn balance_with_interest(&self, user: Address) -> Result<U256>;

    /// Deposited principal.
    async fn principal(&self, user: Address) -> Result<U256>;

    async fn total_lending(&self) -> Result<U256>;

    async fn annual_interest_rate(&self) -> Result<U256>;
}

/// Borrowing contract.
#[async_trait]
pub trait BorrowingGateway: Send + Sync + Debug {
    fn address(&self) -> Address;

    async fn borrow(&self, user: Address, amount: U256) -> Result<SubmittedTx>;

    async fn repay(&self, user: Address, amount: U256) -> Result<SubmittedTx>;

    /// Outstanding debt including accrued interest.
    async fn debt_with_interest(&self, user: Address) -> Result<U256>;

    /// Borrowed principal.
    async fn principal(&self, user: Address) -> Result<U256>;

    async fn total_borrowed(&self) -> Result<U256>;

    async fn current_rate(&self) -> Result<U256>;
}

/// Collateral manager.
#[async_trait]
pub trait CollateralGateway: Send + Sync + Debug {
    fn address(&self) -> Address;

    async fn deposit_collateral(&self, user: Address, amount: U256) -> Result<SubmittedTx>;

    async fn withdraw_collateral(&self, user: Address, amount: U256) -> Result<SubmittedTx>;

    /// Submitted by `liquidator` against `borrower`.
    async fn liquidate(
        &self,
        liquidator: Address,
        borrower: Address,
        repay_amount: U256,
    ) -> Result<SubmittedTx>;

    async fn collateral_balance(&self, user: Address) -> Result<U256>;

    async fn collateral_ratio(&self, user: Address) -> Result<U256>;

    async fn max_borrowable(&self, user: Address) -> Result<U256>;

    async fn min_collateral_ratio(&self) -> Result<U256>;

    async fn liquidation_threshold(&self) -> Result<U256>;

    async fn liquidation_bonus(&self) -> Result<U256>;
}

/// Receipt lookup. `None` while the transaction is not yet mined.
#[async_trait]
pub trait ReceiptSource: Send + Sync + Debug {
    async fn receipt(&self, hash: B256) -> Result<Option<TxReceipt>>;
}

/// Explicit handle to every ledger collaborator, built once at startup.
#[derive(Debug, Clone)]
pub struct ChainGateways {
    pub lending_pool: Arc<dyn LendingPoolGateway>,
    pub borrowing: Arc<dyn BorrowingGateway>,
    pub collateral: Arc<dyn CollateralGateway>,
    pub receipts: Arc<dyn ReceiptSource>,
}
