use super::bindings::ILendingPool;
use super::ContractClient;
use crate::gateway::{LendingPoolGateway, SubmittedTx};
use crate::signer::SignerRegistry;
use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// [`LendingPoolGateway`] over the deployed pool contract.
#[derive(Debug, Clone)]
pub struct AlloyLendingPool {
    client: ContractClient,
}

impl AlloyLendingPool {
    pub fn new(address: Address, rpc_url: &str, signers: Arc<SignerRegistry>) -> Self {
        Self {
            client: ContractClient::new(address, rpc_url, signers),
        }
    }

    /// Underlying asset supplied to the pool.
    pub async fn underlying(&self) -> Result<Address> {
        let pool = ILendingPool::new(self.client.address(), self.client.provider()?);
        Ok(pool.underlying().call().await?._0)
    }
}

#[async_trait]
impl LendingPoolGateway for AlloyLendingPool {
    fn address(&self) -> Address {
        self.client.address()
    }

    async fn deposit(&self, user: Address, amount: U256) -> Result<SubmittedTx> {
        self.client
            .submit(user, ILendingPool::depositCall { amount })
            .await
            .context("LendingPool.deposit")
    }

    async fn withdraw(&self, user: Address, amount: U256) -> Result<SubmittedTx> {
        self.client
            .submit(user, ILendingPool::withdrawCall { amount })
            .await
            .context("LendingPool.withdraw")
    }

    async fn balance_with_interest(&self, user: Address) -> Result<U256> {
        let pool = ILendingPool::new(self.client.address(), self.client.provider()?);
        let balance = pool
            .getLendingToken(user)
            .call()
            .await
            .context("LendingPool.getLendingToken")?;
        Ok(balance._0)
    }

    async fn principal(&self, user: Address) -> Result<U256> {
        let pool = ILendingPool::new(self.client.address(), self.client.provider()?);
        let principal = pool
            .lendingBalance(user)
            .call()
            .await
            .context("LendingPool.lendingBalance")?;
        Ok(principal._0)
    }

    async fn total_lending(&self) -> Result<U256> {
        let pool = ILendingPool::new(self.client.address(), self.client.provider()?);
        Ok(pool.totalLending().call().await.context("LendingPool.totalLending")?._0)
    }

    async fn annual_interest_rate(&self) -> Result<U256> {
        let pool = ILendingPool::new(self.client.address(), self.client.provider()?);
        let rate = pool
            .annualInterestRate()
            .call()
            .await
            .context("LendingPool.annualInterestRate")?;
        Ok(rate._0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_is_contract_address() {
        let address: Address = "0x5FbDB2315678afecb367f032d93F642f64180aa3".parse().unwrap();
        let pool = AlloyLendingPool::new(address, "http://127.0.0.1:8545", Arc::new(SignerRegistry::new()));
        assert_eq!(pool.address(), address);
    }

    #[tokio::test]
    async fn test_deposit_without_signer_fails_before_rpc() {
        let pool = AlloyLendingPool::new(Address::ZERO, "http://127.0.0.1:1", Arc::new(SignerRegistry::new()));
        let err = pool.deposit(Address::repeat_byte(1), U256::from(10)).await.unwrap_err();
        assert!(format!("{err:#}").contains("no custodial signer"));
    }

    #[tokio::test]
    #[ignore] // Requires a node with the pool deployed
    async fn test_read_total_lending() {
        let address: Address = "0x5FbDB2315678afecb367f032d93F642f64180aa3".parse().unwrap();
        let pool = AlloyLendingPool::new(address, "http://127.0.0.1:8545", Arc::new(SignerRegistry::new()));
        assert!(pool.total_lending().await.is_ok());
    }
}
