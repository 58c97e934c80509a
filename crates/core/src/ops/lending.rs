//! Supply-side deposits and withdrawals.

use super::EngineContext;
use crate::amount::Amount;
use crate::backfill::Submission;
use crate::error::OperationError;
use crate::model::{TransactionKind, TransactionRecord};
use crate::store::TransactionFilter;
use alloy::primitives::{Address, B256};
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Debug, Clone)]
pub struct LendingOperations {
    ctx: Arc<EngineContext>,
}

impl LendingOperations {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self), fields(user = %user))]
    pub async fn deposit(&self, user: Address, amount: &str) -> Result<B256, OperationError> {
        let amount = Amount::parse_positive(amount)?;
        let account = self.ctx.resolve_user(user).await?;
        let _guard = self.ctx.locks.lock(account.id).await;

        let pool = &self.ctx.gateways.lending_pool;
        let submitted = pool
            .deposit(user, amount.into())
            .await
            .map_err(OperationError::submission)?;
        info!(hash = %submitted.hash, amount = %amount, "Deposit submitted");

        self.ctx
            .record_all(&[Submission {
                user_id: account.id,
                user,
                kind: TransactionKind::Deposit,
                hash: submitted.hash,
                amount,
                token: pool.address(),
                affects_position: false,
            }])
            .await?;
        Ok(submitted.hash)
    }

    #[instrument(skip(self), fields(user = %user))]
    pub async fn withdraw(&self, user: Address, amount: &str) -> Result<B256, OperationError> {
        let amount = Amount::parse_positive(amount)?;
        let account = self.ctx.resolve_user(user).await?;
        let _guard = self.ctx.locks.lock(account.id).await;

        let pool = &self.ctx.gateways.lending_pool;
        let balance: Amount = pool
            .balance_with_interest(user)
            .await
            .map_err(OperationError::chain_read)?
            .into();
        if amount > balance {
            return Err(OperationError::InsufficientFunds {
                requested: amount,
                available: balance,
            });
        }

        let submitted = pool
            .withdraw(user, amount.into())
            .await
            .map_err(OperationError::submission)?;
        info!(hash = %submitted.hash, amount = %amount, "Withdrawal submitted");

        self.ctx
            .record_all(&[Submission {
                user_id: account.id,
                user,
                kind: TransactionKind::Withdraw,
                hash: submitted.hash,
                amount,
                token: pool.address(),
                affects_position: false,
            }])
            .await?;
        Ok(submitted.hash)
    }

    /// Balance including accrued interest.
    pub async fn get_user_balance(&self, user: Address) -> Result<Amount, OperationError> {
        let balance = self
            .ctx
            .gateways
            .lending_pool
            .balance_with_interest(user)
            .await
            .map_err(OperationError::chain_read)?;
        Ok(balance.into())
    }

    pub async fn get_total_deposited(&self) -> Result<Amount, OperationError> {
        let total = self
            .ctx
            .gateways
            .lending_pool
            .total_lending()
            .await
            .map_err(OperationError::chain_read)?;
        Ok(total.into())
    }

    pub async fn get_current_interest_rate(&self) -> Result<Amount, OperationError> {
        let rate = self
            .ctx
            .gateways
            .lending_pool
            .annual_interest_rate()
            .await
            .map_err(OperationError::chain_read)?;
        Ok(rate.into())
    }

    /// Balance with interest minus deposited principal.
    pub async fn get_user_interest_earned(&self, user: Address) -> Result<Amount, OperationError> {
        let pool = &self.ctx.gateways.lending_pool;
        let (balance, principal) = tokio::try_join!(
            pool.balance_with_interest(user),
            pool.principal(user)
        )
        .map_err(OperationError::chain_read)?;
        Ok(Amount::from(balance).saturating_sub(principal.into()))
    }

    /// Deposits and withdrawals of `user`, newest first.
    pub async fn get_user_transaction_history(
        &self,
        user: Address,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, OperationError> {
        let account = self.ctx.resolve_user(user).await?;
        let filter = TransactionFilter::for_user(account.id).with_kinds(&TransactionKind::LENDING);
        Ok(self.ctx.stores.transactions.list(&filter, offset, limit).await?)
    }

    pub async fn count_user_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> Result<i64, OperationError> {
        Ok(self.ctx.stores.transactions.count(filter).await?)
    }
}
