use super::bindings::IBorrowing;
use super::ContractClient;
use crate::gateway::{BorrowingGateway, SubmittedTx};
use crate::signer::SignerRegistry;
use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// [`BorrowingGateway`] over the deployed borrowing contract.
#[derive(Debug, Clone)]
pub struct AlloyBorrowing {
    client: ContractClient,
}

impl AlloyBorrowing {
    pub fn new(address: Address, rpc_url: &str, signers: Arc<SignerRegistry>) -> Self {
        Self {
            client: ContractClient::new(address, rpc_url, signers),
        }
    }

    /// Asset lent out by the borrowing contract.
    pub async fn token(&self) -> Result<Address> {
        let borrowing = IBorrowing::new(self.client.address(), self.client.provider()?);
        Ok(borrowing.token().call().await?._0)
    }
}

#[async_trait]
impl BorrowingGateway for AlloyBorrowing {
    fn address(&self) -> Address {
        self.client.address()
    }

    async fn borrow(&self, user: Address, amount: U256) -> Result<SubmittedTx> {
        self.client
            .submit(user, IBorrowing::borrowCall { amount })
            .await
            .context("Borrowing.borrow")
    }

    async fn repay(&self, user: Address, amount: U256) -> Result<SubmittedTx> {
        self.client
            .submit(user, IBorrowing::repayCall { amount })
            .await
            .context("Borrowing.repay")
    }

    async fn debt_with_interest(&self, user: Address) -> Result<U256> {
        let borrowing = IBorrowing::new(self.client.address(), self.client.provider()?);
        let debt = borrowing
            .getBorrowToken(user)
            .call()
            .await
            .context("Borrowing.getBorrowToken")?;
        Ok(debt._0)
    }

    async fn principal(&self, user: Address) -> Result<U256> {
        let borrowing = IBorrowing::new(self.client.address(), self.client.provider()?);
        let principal = borrowing
            .borrowedPrincipal(user)
            .call()
            .await
            .context("Borrowing.borrowedPrincipal")?;
        Ok(principal._0)
    }

    async fn total_borrowed(&self) -> Result<U256> {
        let borrowing = IBorrowing::new(self.client.address(), self.client.provider()?);
        Ok(borrowing.totalBorrowed().call().await.context("Borrowing.totalBorrowed")?._0)
    }

    async fn current_rate(&self) -> Result<U256> {
        let borrowing = IBorrowing::new(self.client.address(), self.client.provider()?);
        Ok(borrowing.getCurrentRate().call().await.context("Borrowing.getCurrentRate")?._0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_repay_without_signer_fails() {
        let borrowing = AlloyBorrowing::new(Address::ZERO, "http://127.0.0.1:1", Arc::new(SignerRegistry::new()));
        let err = borrowing.repay(Address::repeat_byte(2), U256::from(1)).await.unwrap_err();
        let message = format!("{err:#}");
        assert!(message.starts_with("Borrowing.repay"));
        assert!(message.contains("no custodial signer"));
    }

    #[tokio::test]
    #[ignore] // Requires a node with the borrowing contract deployed
    async fn test_read_current_rate() {
        let address: Address = "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512".parse().unwrap();
        let borrowing = AlloyBorrowing::new(address, "http://127.0.0.1:8545", Arc::new(SignerRegistry::new()));
        assert!(borrowing.current_rate().await.is_ok());
    }
}
