use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, Block, BlockNumber, Bytes, Filter, Log,
    Transaction, TransactionRequest, H256, U256,
};
use log::debug;
use std::time::Duration;

use super::ChainClient;
use crate::{Error, Result};

/// 基于 ethers JSON-RPC 的 Celo 节点客户端
#[derive(Debug, Clone)]
pub struct EthersClient {
    provider: Provider<Http>,
}

impl EthersClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let url = reqwest::Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("Invalid endpoint {}: {}", endpoint, e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        let provider = Provider::new(Http::new_with_client(url, client));
        debug!("Connected JSON-RPC client to {}", endpoint);
        Ok(Self { provider })
    }

    /// 节点所在网络的链 id，用于交易签名
    pub async fn network_chain_id(&self) -> Result<u64> {
        Ok(self.provider.get_chainid().await?.as_u64())
    }
}

#[async_trait]
impl ChainClient for EthersClient {
    async fn latest_block(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    async fn header_by_number(&self, number: u64) -> Result<Option<Block<H256>>> {
        Ok(self
            .provider
            .get_block(BlockNumber::Number(number.into()))
            .await?)
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<Block<Transaction>>> {
        Ok(self
            .provider
            .get_block_with_txs(BlockNumber::Number(number.into()))
            .await?)
    }

    async fn filter_logs(&self, filter: &Filter) -> Result<Vec<Log>> {
        Ok(self.provider.get_logs(filter).await?)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        Ok(self.provider.call(&tx, None).await?)
    }

    async fn code_at(&self, address: Address) -> Result<Bytes> {
        Ok(self.provider.get_code(address, None).await?)
    }

    async fn pending_nonce_at(&self, address: Address) -> Result<U256> {
        Ok(self
            .provider
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await?)
    }

    async fn suggest_gas_price(&self) -> Result<U256> {
        Ok(self.provider.get_gas_price().await?)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| Error::Transaction(e.to_string()))?;
        Ok(pending.tx_hash())
    }
}
