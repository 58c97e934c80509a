use super::bindings::ICollateral;
use super::ContractClient;
use crate::gateway::{CollateralGateway, SubmittedTx};
use crate::signer::SignerRegistry;
use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// [`CollateralGateway`] over the deployed collateral manager.
#[derive(Debug, Clone)]
pub struct AlloyCollateral {
    client: ContractClient,
}

impl AlloyCollateral {
    pub fn new(address: Address, rpc_url: &str, signers: Arc<SignerRegistry>) -> Self {
        Self {
            client: ContractClient::new(address, rpc_url, signers),
        }
    }
}

#[async_trait]
impl CollateralGateway for AlloyCollateral {
    fn address(&self) -> Address {
        self.client.address()
    }

    async fn deposit_collateral(&self, user: Address, amount: U256) -> Result<SubmittedTx> {
        self.client
            .submit(user, ICollateral::depositCollateralCall { amount })
            .await
            .context("Collateral.depositCollateral")
    }

    async fn withdraw_collateral(&self, user: Address, amount: U256) -> Result<SubmittedTx> {
        self.client
            .submit(user, ICollateral::withdrawCollateralCall { amount })
            .await
            .context("Collateral.withdrawCollateral")
    }

    async fn liquidate(
        &self,
        liquidator: Address,
        borrower: Address,
        repay_amount: U256,
    ) -> Result<SubmittedTx> {
        self.client
            .submit(
                liquidator,
                ICollateral::liquidateCall {
                    borrower,
                    repayAmount: repay_amount,
                },
            )
            .await
            .context("Collateral.liquidate")
    }

    async fn collateral_balance(&self, user: Address) -> Result<U256> {
        let collateral = ICollateral::new(self.client.address(), self.client.provider()?);
        let balance = collateral
            .collateralBalance(user)
            .call()
            .await
            .context("Collateral.collateralBalance")?;
        Ok(balance._0)
    }

    async fn collateral_ratio(&self, user: Address) -> Result<U256> {
        let collateral = ICollateral::new(self.client.address(), self.client.provider()?);
        let ratio = collateral
            .getCollateralRatio(user)
            .call()
            .await
            .context("Collateral.getCollateralRatio")?;
        Ok(ratio._0)
    }

    async fn max_borrowable(&self, user: Address) -> Result<U256> {
        let collateral = ICollateral::new(self.client.address(), self.client.provider()?);
        let max = collateral
            .getMaxBorrowableAmount(user)
            .call()
            .await
            .context("Collateral.getMaxBorrowableAmount")?;
        Ok(max._0)
    }

    async fn min_collateral_ratio(&self) -> Result<U256> {
        let collateral = ICollateral::new(self.client.address(), self.client.provider()?);
        Ok(collateral
            .MIN_COLLATERAL_RATIO()
            .call()
            .await
            .context("Collateral.MIN_COLLATERAL_RATIO")?
            ._0)
    }

    async fn liquidation_threshold(&self) -> Result<U256> {
        let collateral = ICollateral::new(self.client.address(), self.client.provider()?);
        Ok(collateral
            .LIQUIDATION_THRESHOLD()
            .call()
            .await
            .context("Collateral.LIQUIDATION_THRESHOLD")?
            ._0)
    }

    async fn liquidation_bonus(&self) -> Result<U256> {
        let collateral = ICollateral::new(self.client.address(), self.client.provider()?);
        Ok(collateral
            .LIQUIDATION_BONUS()
            .call()
            .await
            .context("Collateral.LIQUIDATION_BONUS")?
            ._0)
    }
}
