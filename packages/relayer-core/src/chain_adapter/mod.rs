use async_trait::async_trait;
use ethers::types::{Address, Block, Bytes, Filter, Log, Transaction, H256, U256};
use log::trace;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::{
    types::{ChainId, Nonce, Payload, Proposal, ResourceId},
    Error, Result,
};

pub mod celo;
pub mod contracts;
pub mod tx_opts;

pub use celo::EthersClient;
pub use contracts::{BridgeContractClient, HandlerContractClient, Transactor};
pub use tx_opts::{GasPolicy, TxOptsManager};

/// 链节点访问，所有读写都经由这里
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn latest_block(&self) -> Result<u64>;

    /// 区块尚未产生时返回 `None`
    async fn header_by_number(&self, number: u64) -> Result<Option<Block<H256>>>;

    async fn block_by_number(&self, number: u64) -> Result<Option<Block<Transaction>>>;

    async fn filter_logs(&self, filter: &Filter) -> Result<Vec<Log>>;

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes>;

    async fn code_at(&self, address: Address) -> Result<Bytes>;

    async fn pending_nonce_at(&self, address: Address) -> Result<U256>;

    async fn suggest_gas_price(&self) -> Result<U256>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256>;
}

/// 提交交易时使用的 nonce、gas 价格与 gas 上限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOptions {
    pub nonce: U256,
    pub gas_price: U256,
    pub gas_limit: U256,
}

/// 交易参数的唯一来源，保证 nonce 单调分配
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TxOptsSource: Send + Sync {
    /// 签名账户地址
    fn sender(&self) -> Address;

    async fn next_opts(&self) -> Result<TxOptions>;

    /// 丢弃本地 nonce，下一次从链上重新读取
    async fn refresh(&self) -> Result<()>;
}

/// executeProposal 的全部参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteProposalCall {
    pub source: ChainId,
    pub nonce: Nonce,
    pub data: Bytes,
    pub resource_id: ResourceId,
    pub signature_header: Bytes,
    pub aggregate_public_key: Bytes,
    pub g1: Bytes,
    pub hashed_message: H256,
    pub root_hash: H256,
    pub key: Bytes,
    pub nodes: Bytes,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BridgeContract: Send + Sync {
    fn address(&self) -> Address;

    async fn chain_id(&self) -> Result<ChainId>;

    async fn resource_id_to_handler_address(&self, resource_id: ResourceId) -> Result<Address>;

    async fn get_proposal(&self, source: ChainId, nonce: Nonce, data_hash: H256) -> Result<Proposal>;

    async fn has_voted_on_proposal(
        &self,
        source: ChainId,
        nonce: Nonce,
        data_hash: H256,
        relayer: Address,
    ) -> Result<bool>;

    async fn vote_proposal(
        &self,
        opts: TxOptions,
        source: ChainId,
        nonce: Nonce,
        resource_id: ResourceId,
        data_hash: H256,
    ) -> Result<H256>;

    async fn execute_proposal(&self, opts: TxOptions, call: ExecuteProposalCall) -> Result<H256>;
}

/// 资源对应的处理合约类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Erc20,
    Erc721,
    Generic,
}

/// 处理合约中记录的一笔存款
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositRecord {
    pub destination: ChainId,
    pub resource_id: ResourceId,
    pub depositer: Address,
    pub payload: Payload,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HandlerContract: Send + Sync {
    async fn get_deposit_record(
        &self,
        handler: Address,
        kind: HandlerKind,
        nonce: Nonce,
        destination: ChainId,
    ) -> Result<DepositRecord>;
}

/// 等待链高度达到 `block`，被取消时返回 `Error::Cancelled`
pub async fn wait_for_block(
    client: &dyn ChainClient,
    block: u64,
    retry_limit: u32,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut retries = retry_limit;
    loop {
        match client.latest_block().await {
            Ok(head) if head >= block => return Ok(()),
            Ok(head) => trace!("Block {} not ready, head is {}", block, head),
            Err(e) => {
                if retries == 0 {
                    return Err(Error::FatalQuery);
                }
                retries -= 1;
                log::warn!("Failed to query latest block while waiting for {}: {}", block, e);
            }
        }
        if !crate::sleep_or_cancel(cancel, interval).await {
            return Err(Error::Cancelled);
        }
    }
}
