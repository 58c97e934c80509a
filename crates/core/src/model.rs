//! Mirrored records: positions, submitted transactions and user accounts.

use crate::amount::Amount;
use alloy::primitives::{Address, B256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a [`Position`]. `Liquidated` and `Closed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Active,
    Liquidated,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Liquidated => "liquidated",
            Self::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "liquidated" => Ok(Self::Liquidated),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown position status {other:?}")),
        }
    }
}

/// One user's net exposure, mirrored from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: i64,
    pub user_id: i64,
    pub collateral_amount: Amount,
    /// Collateral manager contract
    pub collateral_token: Address,
    pub borrowed_amount: Amount,
    /// Borrowing contract
    pub borrowed_token: Address,
    /// Borrow rate at the last mirrored borrow (ledger scale)
    pub interest_rate: Amount,
    /// Last mirrored collateral ratio; unset until first read
    pub health_factor: Option<Amount>,
    pub liquidation_price: Option<Amount>,
    pub status: PositionStatus,
    /// Optimistic-concurrency counter, bumped by every update
    pub version: i64,
    pub last_interest_update: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// A new, not yet persisted, Active position with zero balances.
    pub fn open(user_id: i64, collateral_token: Address, borrowed_token: Address) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            user_id,
            collateral_amount: Amount::ZERO,
            collateral_token,
            borrowed_amount: Amount::ZERO,
            borrowed_token,
            interest_rate: Amount::ZERO,
            health_factor: None,
            liquidation_price: None,
            status: PositionStatus::Active,
            version: 0,
            last_interest_update: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == PositionStatus::Active
    }

    /// Both balances are zero.
    pub fn is_empty(&self) -> bool {
        self.collateral_amount.is_zero() && self.borrowed_amount.is_zero()
    }

    /// Active → Closed, only when both balances are zero.
    pub fn close_if_empty(&mut self) -> bool {
        if self.is_active() && self.is_empty() {
            self.status = PositionStatus::Closed;
            return true;
        }
        false
    }

    /// Active → Liquidated, only when a balance was wiped out.
    pub fn mark_liquidated_if_depleted(&mut self) -> bool {
        if self.is_active()
            && (self.collateral_amount.is_zero() || self.borrowed_amount.is_zero())
        {
            self.status = PositionStatus::Liquidated;
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdraw,
    Borrow,
    Repay,
    Liquidate,
    DepositCollateral,
    WithdrawCollateral,
}

impl TransactionKind {
    pub const LENDING: [Self; 2] = [Self::Deposit, Self::Withdraw];
    pub const BORROWING: [Self; 2] = [Self::Borrow, Self::Repay];
    pub const COLLATERAL: [Self; 2] = [Self::DepositCollateral, Self::WithdrawCollateral];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdraw => "withdraw",
            Self::Borrow => "borrow",
            Self::Repay => "repay",
            Self::Liquidate => "liquidate",
            Self::DepositCollateral => "deposit_collateral",
            Self::WithdrawCollateral => "withdraw_collateral",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(Self::Deposit),
            "withdraw" => Ok(Self::Withdraw),
            "borrow" => Ok(Self::Borrow),
            "repay" => Ok(Self::Repay),
            "liquidate" => Ok(Self::Liquidate),
            "deposit_collateral" => Ok(Self::DepositCollateral),
            "withdraw_collateral" => Ok(Self::WithdrawCollateral),
            other => Err(format!("unknown transaction kind {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown transaction status {other:?}")),
        }
    }
}

/// One submitted ledger operation. `(hash, user_id)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: i64,
    pub user_id: i64,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub hash: B256,
    pub amount: Amount,
    pub token_address: Address,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    /// Effective gas price in wei
    pub gas_price: Option<Amount>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// A Pending record for a freshly submitted transaction.
    pub fn pending(
        user_id: i64,
        kind: TransactionKind,
        hash: B256,
        amount: Amount,
        token_address: Address,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            user_id,
            kind,
            status: TransactionStatus::Pending,
            hash,
            amount,
            token_address,
            block_number: None,
            gas_used: None,
            gas_price: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Account known to the engine. Inactive accounts cannot operate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: i64,
    pub address: Address,
    pub active: bool,
}
