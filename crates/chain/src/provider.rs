//! Provider management for the lending contracts' RPC endpoint.
//! Uses Alloy providers for type-safe RPC interactions.

use crate::gateway::{ReceiptSource, TxReceipt};
use alloy::primitives::B256;
use alloy::providers::{Provider, ProviderBuilder};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

/// Read-side handle to one RPC endpoint.
#[derive(Debug, Clone)]
pub struct ProviderManager {
    /// HTTP URL used for reads and receipt lookups
    rpc_url: String,
    /// Chain ID reported by the node at startup
    chain_id: u64,
}

impl ProviderManager {
    /// Connect and verify the endpoint answers.
    pub async fn new(rpc_url: &str) -> Result<Self> {
        info!(rpc = rpc_url, "Initializing provider manager");

        let provider = ProviderBuilder::new().on_http(rpc_url.parse()?);
        let block = provider
            .get_block_number()
            .await
            .context("RPC endpoint did not answer eth_blockNumber")?;
        let chain_id = provider.get_chain_id().await?;
        info!(block = block, chain_id = chain_id, "Provider connection verified");

        Ok(Self {
            rpc_url: rpc_url.to_string(),
            chain_id,
        })
    }

    /// Get the HTTP URL.
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Chain ID observed when connecting.
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub async fn block_number(&self) -> Result<u64> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.parse()?);
        Ok(provider.get_block_number().await?)
    }

    /// Check if provider is healthy.
    pub async fn health_check(&self) -> Result<bool> {
        let block = self.block_number().await?;
        debug!(block = block, "Provider health check passed");
        Ok(block > 0)
    }
}

#[async_trait]
impl ReceiptSource for ProviderManager {
    async fn receipt(&self, hash: B256) -> Result<Option<TxReceipt>> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.parse()?);
        let receipt = provider
            .get_transaction_receipt(hash)
            .await
            .with_context(|| format!("receipt lookup failed for {hash}"))?;

        Ok(receipt.map(|receipt| TxReceipt {
            hash,
            success: receipt.status(),
            block_number: receipt.block_number,
            gas_used: receipt.gas_used,
            gas_price: receipt.effective_gas_price,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_provider_creation() {
        let provider = ProviderManager::new("http://127.0.0.1:8545").await;
        assert!(provider.is_ok());
    }

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_health_check_reads_block() {
        let provider = ProviderManager::new("http://127.0.0.1:8545").await.unwrap();
        assert!(provider.health_check().await.is_ok());
    }

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_unknown_receipt_is_none() {
        let provider = ProviderManager::new("http://127.0.0.1:8545").await.unwrap();
        let receipt = provider.receipt(B256::repeat_byte(0xab)).await.unwrap();
        assert!(receipt.is_none());
    }
}
