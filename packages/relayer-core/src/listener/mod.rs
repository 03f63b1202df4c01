//! 源链区块轮询：提取 Deposit 事件，证明交易包含性，附上验证者签名后交给路由。

use ethers::types::{Address, Bytes, Filter};
use log::{debug, error, info, trace};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::{
    blockstore::Blockstore,
    chain_adapter::{BridgeContract, ChainClient, HandlerContract},
    router::MessageRouter,
    trie::TxTrie,
    types::{ChainId, EventSig, MerkleProof, Message, SignatureVerification},
    validator::{IstanbulExtra, ValidatorsAggregator},
    Error, Result,
};

pub mod handlers;

pub use handlers::{DepositEvent, HandlerAddresses};

/// 链头需要领先游标的区块数
pub const BLOCK_CONFIRMATIONS: u64 = 10;
pub const BLOCK_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const BLOCK_RETRY_LIMIT: u32 = 5;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub chain_id: ChainId,
    pub bridge: Address,
    pub handlers: HandlerAddresses,
    pub block_confirmations: u64,
    pub block_retry_limit: u32,
    pub block_retry_interval: Duration,
}

impl ListenerConfig {
    pub fn new(chain_id: ChainId, bridge: Address, handlers: HandlerAddresses) -> Self {
        Self {
            chain_id,
            bridge,
            handlers,
            block_confirmations: BLOCK_CONFIRMATIONS,
            block_retry_limit: BLOCK_RETRY_LIMIT,
            block_retry_interval: BLOCK_RETRY_INTERVAL,
        }
    }
}

/// 含存款区块的交易树和签名信息，每个区块只构建一次
struct BlockEvidence {
    trie: TxTrie,
    signature: SignatureVerification,
}

pub struct Listener {
    config: ListenerConfig,
    client: Arc<dyn ChainClient>,
    bridge: Arc<dyn BridgeContract>,
    handler_contract: Arc<dyn HandlerContract>,
    aggregator: Arc<dyn ValidatorsAggregator>,
    router: Arc<dyn MessageRouter>,
    blockstore: Arc<dyn Blockstore>,
}

impl Listener {
    pub fn new(
        config: ListenerConfig,
        client: Arc<dyn ChainClient>,
        bridge: Arc<dyn BridgeContract>,
        handler_contract: Arc<dyn HandlerContract>,
        aggregator: Arc<dyn ValidatorsAggregator>,
        router: Arc<dyn MessageRouter>,
        blockstore: Arc<dyn Blockstore>,
    ) -> Self {
        Self {
            config,
            client,
            bridge,
            handler_contract,
            aggregator,
            router,
            blockstore,
        }
    }

    /// 从 `start_block` 起逐块轮询，重试耗尽时返回 `Error::FatalPolling`
    pub async fn run(&self, start_block: u64, cancel: CancellationToken) -> Result<()> {
        let chain = self.config.chain_id;
        let interval = self.config.block_retry_interval;
        info!("Chain {}: polling blocks from {}", chain, start_block);

        let mut current = start_block;
        let mut retry = self.config.block_retry_limit;
        loop {
            if cancel.is_cancelled() {
                info!("Chain {}: listener stopped at block {}", chain, current);
                return Ok(());
            }
            if retry == 0 {
                error!("Chain {}: polling failed, retries exceeded", chain);
                return Err(Error::FatalPolling);
            }

            let head = match self.client.latest_block().await {
                Ok(head) => head,
                Err(e) => {
                    error!("Chain {}: unable to get latest block at {}: {}", chain, current, e);
                    retry -= 1;
                    if !crate::sleep_or_cancel(&cancel, interval).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            if head.saturating_sub(current) < self.config.block_confirmations {
                trace!("Chain {}: block {} not ready, head is {}", chain, current, head);
                if !crate::sleep_or_cancel(&cancel, interval).await {
                    return Ok(());
                }
                continue;
            }

            match self.process_block(current).await {
                Ok(()) => {}
                Err(Error::ValidatorsNotSynced(_)) => {
                    debug!("Chain {}: waiting for validators of block {}", chain, current);
                    if !crate::sleep_or_cancel(&cancel, interval).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => {
                    error!("Chain {}: failed to get events for block {}: {}", chain, current, e);
                    retry -= 1;
                    if !crate::sleep_or_cancel(&cancel, interval).await {
                        return Ok(());
                    }
                    continue;
                }
            }

            if let Err(e) = self.blockstore.store_block(current) {
                error!("Chain {}: failed to write block {} to blockstore: {}", chain, current, e);
            }
            current += 1;
            retry = self.config.block_retry_limit;
        }
    }

    /// 处理单个区块内的全部 Deposit 事件
    pub async fn process_block(&self, block: u64) -> Result<()> {
        let chain = self.config.chain_id;
        let filter = Filter::new()
            .address(self.config.bridge)
            .topic0(EventSig::Deposit.topic())
            .from_block(block)
            .to_block(block);
        let logs = self.client.filter_logs(&filter).await?;
        if logs.is_empty() {
            return Ok(());
        }
        debug!("Chain {}: found {} deposit events in block {}", chain, logs.len(), block);

        let evidence = self.block_evidence(block).await?;

        for log in &logs {
            let deposit = match DepositEvent::from_log(log) {
                Ok(deposit) => deposit,
                Err(e) => {
                    error!("Chain {}: skipping malformed deposit log in block {}: {}", chain, block, e);
                    continue;
                }
            };

            let handler = self
                .bridge
                .resource_id_to_handler_address(deposit.resource_id)
                .await?;
            let kind = match self.config.handlers.kind_of(handler) {
                Some(kind) => kind,
                None => {
                    error!(
                        "Chain {}: event has unrecognized handler {:?}, rid=0x{}",
                        chain,
                        handler,
                        hex::encode(deposit.resource_id)
                    );
                    return Ok(());
                }
            };

            let record = match self
                .handler_contract
                .get_deposit_record(handler, kind, deposit.nonce, deposit.destination)
                .await
            {
                Ok(record) => record,
                Err(e) => {
                    error!(
                        "Chain {}: failed to decode {:?} deposit record nonce={}: {}",
                        chain, kind, deposit.nonce, e
                    );
                    continue;
                }
            };

            let (key, proof) = evidence.trie.prove_index(deposit.tx_index)?;
            let message = Message {
                source: chain,
                destination: deposit.destination,
                deposit_nonce: deposit.nonce,
                resource_id: deposit.resource_id,
                payload: record.payload,
                proof: MerkleProof {
                    tx_root_hash: evidence.trie.root(),
                    key: Bytes::from(key),
                    nodes: Bytes::from(proof.encode_nodes()),
                },
                signature: evidence.signature.clone(),
            };

            info!("Chain {}: deposit event found {}", chain, message);
            if let Err(e) = self.router.send(message).await {
                error!("Chain {}: failed to route message: {}", chain, e);
            }
        }
        Ok(())
    }

    async fn block_evidence(&self, block: u64) -> Result<BlockEvidence> {
        let full = self
            .client
            .block_by_number(block)
            .await?
            .ok_or_else(|| Error::Chain(format!("block {} not found", block)))?;

        let transactions: Vec<Bytes> = full.transactions.iter().map(|tx| tx.rlp()).collect();
        let trie = TxTrie::build(full.transactions_root, &transactions)?;

        let aggregate_public_key = self.aggregator.aggregate_public_key_for_block(block).await?;
        let extra = IstanbulExtra::from_header_extra(&full.extra_data)?;
        let block_hash = full
            .hash
            .ok_or_else(|| Error::Chain(format!("block {} has no hash", block)))?;

        Ok(BlockEvidence {
            trie,
            signature: SignatureVerification {
                aggregate_public_key,
                block_hash,
                signature: extra.block_signature().clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::MockBlockstore;
    use crate::chain_adapter::{DepositRecord, HandlerKind, MockBridgeContract, MockChainClient, MockHandlerContract};
    use crate::router::MockMessageRouter;
    use crate::test_utils::{bls_key, deposit_log, tx_root};
    use crate::trie::{verify_encoded_proof, TrieError};
    use crate::types::Payload;
    use crate::chain_adapter::{ExecuteProposalCall, MockTxOptsSource, TxOptions};
    use crate::router::Router;
    use crate::test_utils::{proposal_event_log, validator};
    use crate::types::{Proposal, ProposalStatus};
    use crate::validator::{
        aggregate_public_keys, istanbul::AggregatedSeal, MockValidatorsAggregator, ValidatorStore, ValidatorSyncer,
    };
    use crate::writer::{data_hash, proposal_data, Writer, WriterConfig};
    use ethers::types::{Block, Transaction, H256, U256};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    const CHAIN: ChainId = 1;
    const BLOCK: u64 = 42;

    fn bridge_address() -> Address {
        Address::repeat_byte(0x0b)
    }

    fn handlers() -> HandlerAddresses {
        HandlerAddresses {
            erc20: Address::repeat_byte(0x20),
            erc721: Address::repeat_byte(0x72),
            generic: Address::repeat_byte(0x6e),
        }
    }

    fn transactions() -> Vec<Transaction> {
        (0..4u64)
            .map(|i| Transaction {
                nonce: U256::from(i),
                gas: U256::from(21_000 + i),
                gas_price: Some(U256::from(1_000_000_000u64)),
                to: Some(Address::from_low_u64_be(100 + i)),
                value: U256::from(i * 1000),
                ..Default::default()
            })
            .collect()
    }

    /// 带四笔交易和聚合签名的区块
    fn block_with_transactions() -> Block<Transaction> {
        let txs = transactions();
        let encoded: Vec<Vec<u8>> = txs.iter().map(|tx| tx.rlp().to_vec()).collect();
        let extra = IstanbulExtra {
            aggregated_seal: AggregatedSeal {
                bitmap: vec![0x07],
                signature: Bytes::from(vec![0x5a; 48]),
                round: vec![],
            },
            ..Default::default()
        };
        Block {
            hash: Some(H256::repeat_byte(0xbb)),
            number: Some(BLOCK.into()),
            transactions_root: tx_root(&encoded),
            extra_data: Bytes::from(extra.to_header_extra([0u8; 32])),
            transactions: txs,
            ..Default::default()
        }
    }

    fn fungible_record(destination: ChainId) -> DepositRecord {
        DepositRecord {
            destination,
            resource_id: [0x11; 32],
            depositer: Address::repeat_byte(0xd0),
            payload: Payload::Fungible {
                amount: U256::from(100u64),
                recipient: Bytes::from(vec![0xcc; 20]),
            },
        }
    }

    fn client_for(block: Block<Transaction>, logs: Vec<ethers::types::Log>) -> MockChainClient {
        let mut client = MockChainClient::new();
        client.expect_latest_block().returning(|| Ok(BLOCK + 20));
        // 只有 BLOCK 含存款事件
        client.expect_filter_logs().returning(move |filter| {
            if filter.get_from_block() == Some(BLOCK.into()) {
                Ok(logs.clone())
            } else {
                Ok(vec![])
            }
        });
        client
            .expect_block_by_number()
            .returning(move |_| Ok(Some(block.clone())));
        client
    }

    fn bridge_resolving_to(handler: Address) -> MockBridgeContract {
        let mut bridge = MockBridgeContract::new();
        bridge
            .expect_resource_id_to_handler_address()
            .returning(move |_| Ok(handler));
        bridge
    }

    fn aggregator() -> MockValidatorsAggregator {
        let mut aggregator = MockValidatorsAggregator::new();
        aggregator
            .expect_aggregate_public_key_for_block()
            .returning(|_| Ok(bls_key(6)));
        aggregator
    }

    fn listener(
        client: MockChainClient,
        bridge: MockBridgeContract,
        handler_contract: MockHandlerContract,
        aggregator: MockValidatorsAggregator,
        router: MockMessageRouter,
    ) -> Listener {
        let mut blockstore = MockBlockstore::new();
        blockstore.expect_store_block().returning(|_| Ok(()));
        Listener::new(
            ListenerConfig::new(CHAIN, bridge_address(), handlers()),
            Arc::new(client),
            Arc::new(bridge),
            Arc::new(handler_contract),
            Arc::new(aggregator),
            Arc::new(router),
            Arc::new(blockstore),
        )
    }

    fn capturing_router(sent: Arc<Mutex<Vec<Message>>>) -> MockMessageRouter {
        let mut router = MockMessageRouter::new();
        router.expect_send().returning(move |message| {
            sent.lock().unwrap().push(message);
            Ok(())
        });
        router
    }

    async fn run_fungible_deposit() -> Vec<Message> {
        let logs = vec![deposit_log(bridge_address(), BLOCK, 2, 2, [0x11; 32], 7)];
        let mut handler_contract = MockHandlerContract::new();
        handler_contract
            .expect_get_deposit_record()
            .withf(|handler, kind, nonce, destination| {
                *handler == Address::repeat_byte(0x20)
                    && *kind == HandlerKind::Erc20
                    && *nonce == 7
                    && *destination == 2
            })
            .times(1)
            .returning(|_, _, _, destination| Ok(fungible_record(destination)));

        let sent = Arc::new(Mutex::new(Vec::new()));
        let listener = listener(
            client_for(block_with_transactions(), logs),
            bridge_resolving_to(handlers().erc20),
            handler_contract,
            aggregator(),
            capturing_router(sent.clone()),
        );
        listener.process_block(BLOCK).await.unwrap();
        let messages = sent.lock().unwrap().clone();
        messages
    }

    #[tokio::test]
    async fn test_fungible_deposit_end_to_end() {
        let messages = run_fungible_deposit().await;
        assert_eq!(messages.len(), 1);
        let message = &messages[0];

        assert_eq!(message.source, CHAIN);
        assert_eq!(message.destination, 2);
        assert_eq!(message.deposit_nonce, 7);
        assert_eq!(message.resource_id, [0x11; 32]);
        assert_eq!(message.payload, fungible_record(2).payload);
        assert_eq!(message.signature.aggregate_public_key, bls_key(6));
        assert_eq!(message.signature.block_hash, H256::repeat_byte(0xbb));
        assert_eq!(message.signature.signature, Bytes::from(vec![0x5a; 48]));

        let block = block_with_transactions();
        assert_eq!(message.proof.tx_root_hash, block.transactions_root);
        let value = verify_encoded_proof(message.proof.tx_root_hash, &message.proof.key, &message.proof.nodes).unwrap();
        assert_eq!(value, block.transactions[2].rlp().to_vec());

        // 两次处理同一区块得到相同的数据哈希
        let again = run_fungible_deposit().await;
        let hash = |m: &Message| data_hash(&proposal_data(&m.payload), handlers().erc20, &m.proof, &m.signature);
        assert_eq!(hash(message), hash(&again[0]));
    }

    #[tokio::test]
    async fn test_block_without_deposits_skips_proof() {
        let mut client = MockChainClient::new();
        client.expect_filter_logs().returning(|_| Ok(vec![]));
        client.expect_block_by_number().never();

        let mut router = MockMessageRouter::new();
        router.expect_send().never();
        let listener = listener(
            client,
            MockBridgeContract::new(),
            MockHandlerContract::new(),
            MockValidatorsAggregator::new(),
            router,
        );
        tokio_test::assert_ok!(listener.process_block(BLOCK).await);
    }

    #[tokio::test]
    async fn test_unrecognized_handler_stops_block() {
        let logs = vec![
            deposit_log(bridge_address(), BLOCK, 0, 2, [0x11; 32], 7),
            deposit_log(bridge_address(), BLOCK, 1, 2, [0x11; 32], 8),
        ];
        let mut handler_contract = MockHandlerContract::new();
        handler_contract.expect_get_deposit_record().never();
        let mut router = MockMessageRouter::new();
        router.expect_send().never();

        let listener = listener(
            client_for(block_with_transactions(), logs),
            bridge_resolving_to(Address::repeat_byte(0x99)),
            handler_contract,
            aggregator(),
            router,
        );
        tokio_test::assert_ok!(listener.process_block(BLOCK).await);
    }

    #[tokio::test]
    async fn test_bad_record_skips_only_that_event() {
        let logs = vec![
            deposit_log(bridge_address(), BLOCK, 0, 2, [0x11; 32], 7),
            deposit_log(bridge_address(), BLOCK, 1, 2, [0x11; 32], 8),
        ];
        let mut handler_contract = MockHandlerContract::new();
        handler_contract
            .expect_get_deposit_record()
            .returning(|_, _, nonce, destination| {
                if nonce == 7 {
                    Err(Error::Serialization("unexpected ABI output".into()))
                } else {
                    Ok(fungible_record(destination))
                }
            });

        let sent = Arc::new(Mutex::new(Vec::new()));
        let listener = listener(
            client_for(block_with_transactions(), logs),
            bridge_resolving_to(handlers().erc20),
            handler_contract,
            aggregator(),
            capturing_router(sent.clone()),
        );
        listener.process_block(BLOCK).await.unwrap();
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].deposit_nonce, 8);
    }

    #[tokio::test]
    async fn test_root_mismatch_is_an_error() {
        let mut block = block_with_transactions();
        block.transactions_root = H256::repeat_byte(0x01);
        let logs = vec![deposit_log(bridge_address(), BLOCK, 0, 2, [0x11; 32], 7)];
        let listener = listener(
            client_for(block, logs),
            MockBridgeContract::new(),
            MockHandlerContract::new(),
            aggregator(),
            MockMessageRouter::new(),
        );
        assert!(matches!(
            listener.process_block(BLOCK).await,
            Err(Error::Trie(TrieError::RootMismatch { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_validators_without_consuming_retries() {
        let logs = vec![deposit_log(bridge_address(), BLOCK, 2, 2, [0x11; 32], 7)];
        let mut aggregator = MockValidatorsAggregator::new();
        let mut calls = 0;
        // 前十次同步器尚未追上
        aggregator.expect_aggregate_public_key_for_block().returning(move |block| {
            calls += 1;
            if calls <= 10 {
                Err(Error::ValidatorsNotSynced(block))
            } else {
                Ok(bls_key(6))
            }
        });
        let mut handler_contract = MockHandlerContract::new();
        handler_contract
            .expect_get_deposit_record()
            .returning(|_, _, _, destination| Ok(fungible_record(destination)));

        let sent = Arc::new(Mutex::new(Vec::new()));
        let listener = listener(
            client_for(block_with_transactions(), logs),
            bridge_resolving_to(handlers().erc20),
            handler_contract,
            aggregator,
            capturing_router(sent.clone()),
        );

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(120)).await;
            stopper.cancel();
        });
        // 链头为 62，只有 42 之前（含）的区块满足确认数
        tokio_test::assert_ok!(listener.run(BLOCK, cancel).await);
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_failure_is_fatal() {
        let mut client = MockChainClient::new();
        client
            .expect_latest_block()
            .times(BLOCK_RETRY_LIMIT as usize)
            .returning(|| Err(Error::Network("connection refused".into())));
        let listener = listener(
            client,
            MockBridgeContract::new(),
            MockHandlerContract::new(),
            MockValidatorsAggregator::new(),
            MockMessageRouter::new(),
        );
        let err = listener.run(0, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::FatalPolling));
    }

    #[tokio::test(start_paused = true)]
    async fn test_advances_and_stores_cursor() {
        let mut client = MockChainClient::new();
        client.expect_latest_block().returning(|| Ok(15));
        client.expect_filter_logs().returning(|_| Ok(vec![]));

        let stored = Arc::new(Mutex::new(Vec::new()));
        let mut blockstore = MockBlockstore::new();
        let sink = stored.clone();
        blockstore.expect_store_block().returning(move |block| {
            sink.lock().unwrap().push(block);
            Ok(())
        });

        let listener = Listener::new(
            ListenerConfig::new(CHAIN, bridge_address(), handlers()),
            Arc::new(client),
            Arc::new(MockBridgeContract::new()),
            Arc::new(MockHandlerContract::new()),
            Arc::new(MockValidatorsAggregator::new()),
            Arc::new(MockMessageRouter::new()),
            Arc::new(blockstore),
        );
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            stopper.cancel();
        });
        listener.run(3, cancel).await.unwrap();
        // 链头 15、确认数 10：只处理到区块 5
        assert_eq!(*stored.lock().unwrap(), vec![3, 4, 5]);
    }

    /// 同步器、路由与写入者均为真实实现，只在 RPC 与合约边界使用模拟。
    /// 返回写入者投票用的数据哈希和执行参数。
    async fn run_pipeline(recipient: Bytes) -> (H256, ExecuteProposalCall) {
        let dir = tempfile::tempdir().unwrap();
        let store = ValidatorStore::open(dir.path().join("validators")).unwrap();

        // 创世区块加入 A、B、C，之后的纪元没有变化
        let genesis = [validator(1), validator(2), validator(3)];
        let mut headers = HashMap::new();
        for epoch_block in [0u64, 10, 20, 30, 40] {
            let extra = if epoch_block == 0 {
                IstanbulExtra {
                    added_validators: genesis.iter().map(|v| v.address).collect(),
                    added_validators_public_keys: genesis.iter().map(|v| v.bls_public_key.clone()).collect(),
                    ..Default::default()
                }
            } else {
                IstanbulExtra::default()
            };
            let header: Block<H256> = Block {
                extra_data: Bytes::from(extra.to_header_extra([0u8; 32])),
                ..Default::default()
            };
            headers.insert(epoch_block, header);
        }
        let mut syncer_client = MockChainClient::new();
        syncer_client
            .expect_header_by_number()
            .returning(move |n| Ok(headers.get(&n).cloned()));
        let syncer = Arc::new(ValidatorSyncer::new(CHAIN, 10, Arc::new(syncer_client), store, 5));

        // 目标链
        let destination_bridge = Address::repeat_byte(0x0d);
        let (voted_tx, mut voted_rx) = mpsc::unbounded_channel();
        let (executed_tx, mut executed_rx) = mpsc::unbounded_channel();
        let mut bridge = MockBridgeContract::new();
        bridge.expect_address().return_const(destination_bridge);
        bridge
            .expect_resource_id_to_handler_address()
            .returning(|_| Ok(Address::repeat_byte(0x21)));
        bridge.expect_get_proposal().returning(|_, _, _| {
            Ok(Proposal {
                resource_id: [0x05; 32],
                data_hash: H256::zero(),
                yes_votes: vec![],
                no_votes: vec![],
                status: ProposalStatus::Active,
                proposed_block: U256::zero(),
            })
        });
        bridge
            .expect_has_voted_on_proposal()
            .returning(|_, _, _, _| Ok(false));
        bridge
            .expect_vote_proposal()
            .withf(|_, source, nonce, rid, _| *source == CHAIN && *nonce == 7 && *rid == [0x05; 32])
            .times(1)
            .returning(move |_, _, _, _, data_hash| {
                voted_tx.send(data_hash).unwrap();
                Ok(H256::repeat_byte(0x01))
            });
        bridge.expect_execute_proposal().times(1).returning(move |_, call| {
            executed_tx.send(call).unwrap();
            Ok(H256::repeat_byte(0x02))
        });

        let mut destination_client = MockChainClient::new();
        destination_client.expect_latest_block().returning(|| Ok(500));
        destination_client.expect_filter_logs().returning(move |_| {
            Ok(vec![proposal_event_log(destination_bridge, 500, CHAIN, 7, ProposalStatus::Passed)])
        });

        let mut opts = MockTxOptsSource::new();
        opts.expect_sender().return_const(Address::repeat_byte(0xaa));
        opts.expect_next_opts().returning(|| {
            Ok(TxOptions {
                nonce: U256::from(1u64),
                gas_price: U256::from(1_000_000_000u64),
                gas_limit: U256::from(6_721_975u64),
            })
        });

        let cancel = CancellationToken::new();
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let mut writer_config = WriterConfig::new(2);
        writer_config.allowed_source_chains = vec![CHAIN];
        let router = Arc::new(Router::new());
        router
            .register(
                2,
                Arc::new(Writer::new(
                    writer_config,
                    Arc::new(destination_client),
                    Arc::new(bridge),
                    Arc::new(opts),
                    fatal_tx,
                    cancel.clone(),
                )),
            )
            .await;

        // 源链
        let logs = vec![deposit_log(bridge_address(), BLOCK, 2, 2, [0x05; 32], 7)];
        let mut handler_contract = MockHandlerContract::new();
        handler_contract
            .expect_get_deposit_record()
            .returning(move |_, _, _, destination| {
                Ok(DepositRecord {
                    destination,
                    resource_id: [0x05; 32],
                    depositer: Address::repeat_byte(0xd0),
                    payload: Payload::Fungible {
                        amount: U256::from(1_000_000u64),
                        recipient: recipient.clone(),
                    },
                })
            });
        let mut blockstore = MockBlockstore::new();
        blockstore.expect_store_block().returning(|_| Ok(()));
        let listener = Listener::new(
            ListenerConfig::new(CHAIN, bridge_address(), handlers()),
            Arc::new(client_for(block_with_transactions(), logs)),
            Arc::new(bridge_resolving_to(handlers().erc20)),
            Arc::new(handler_contract),
            syncer.clone(),
            router.clone(),
            Arc::new(blockstore),
        );

        let sync_task = tokio::spawn({
            let cancel = cancel.clone();
            async move { syncer.run(cancel).await }
        });
        let listen_task = tokio::spawn({
            let cancel = cancel.clone();
            async move { listener.run(BLOCK, cancel).await }
        });

        let voted = voted_rx.recv().await.unwrap();
        let executed = executed_rx.recv().await.unwrap();
        cancel.cancel();
        sync_task.await.unwrap().unwrap();
        listen_task.await.unwrap().unwrap();
        assert!(fatal_rx.try_recv().is_err());
        (voted, executed)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fungible_deposit_through_relayer_pipeline() {
        let bob = Bytes::from(Address::repeat_byte(0xb0).as_bytes().to_vec());
        let (first_hash, executed) = run_pipeline(bob.clone()).await;
        let (second_hash, _) = run_pipeline(bob.clone()).await;

        assert_eq!(first_hash, second_hash);
        assert_ne!(first_hash, H256::zero());

        let expected_key = aggregate_public_keys(&[validator(1), validator(2), validator(3)]).unwrap();
        assert_eq!(executed.aggregate_public_key, expected_key);
        assert_eq!(
            executed.data,
            proposal_data(&Payload::Fungible {
                amount: U256::from(1_000_000u64),
                recipient: bob,
            })
        );
        assert_eq!(executed.source, CHAIN);
        assert_eq!(executed.nonce, 7);
        assert_eq!(executed.resource_id, [0x05; 32]);
        assert_eq!(executed.hashed_message, H256::repeat_byte(0xbb));
        assert_eq!(executed.root_hash, block_with_transactions().transactions_root);
    }
}
