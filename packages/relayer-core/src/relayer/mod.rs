use ethers::types::{Address, U256};
use log::{error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    blockstore::{resolve_start_block, Blockstore, FileBlockstore},
    chain_adapter::{
        BridgeContract, BridgeContractClient, ChainClient, EthersClient, GasPolicy,
        HandlerContractClient, Transactor, TxOptsManager,
    },
    config::{ChainConfig, Config},
    listener::{HandlerAddresses, Listener, ListenerConfig},
    router::Router,
    types::ChainId,
    validator::{ValidatorStore, ValidatorSyncer},
    writer::{Writer, WriterConfig},
    Error, FatalErrorSender, Result,
};

/// 一条链上的监听器与验证者同步器
struct ChainRuntime {
    id: ChainId,
    listener: Arc<Listener>,
    syncer: Arc<ValidatorSyncer>,
    start_block: u64,
    cancel: CancellationToken,
}

pub struct Relayer {
    chains: Vec<ChainRuntime>,
    store: ValidatorStore,
    cancel: CancellationToken,
    fatal_tx: FatalErrorSender,
    fatal_rx: mpsc::UnboundedReceiver<(ChainId, Error)>,
}

impl Relayer {
    /// 连接所有链并完成启动检查，任一链失败即返回错误
    pub async fn new(config: Config) -> Result<Self> {
        let store = ValidatorStore::open(&config.relayer.validator_db_path)?;
        let router = Arc::new(Router::new());
        let cancel = CancellationToken::new();
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let mut chains = Vec::with_capacity(config.chains.len());
        for chain in &config.chains {
            let runtime = connect_chain(&config, chain, &store, &router, &fatal_tx, &cancel).await?;
            chains.push(runtime);
        }

        Ok(Self {
            chains,
            store,
            cancel,
            fatal_tx,
            fatal_rx,
        })
    }

    /// 运行直到 Ctrl-C 或首个致命错误
    pub async fn start(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Starting relayer for {} chains", self.chains.len());
        let Relayer {
            chains,
            store,
            cancel,
            fatal_tx,
            mut fatal_rx,
        } = self;

        let mut tasks = Vec::new();
        let mut chain_tokens = HashMap::new();
        for chain in chains {
            chain_tokens.insert(chain.id, chain.cancel.clone());
            tasks.extend(spawn_chain(chain, fatal_tx.clone()));
        }
        drop(fatal_tx);

        let result = supervise(&mut fatal_rx, &chain_tokens, &cancel, shutdown).await;

        for task in tasks {
            if let Err(e) = task.await {
                warn!("Chain task ended abnormally: {}", e);
            }
        }
        if let Err(e) = store.flush() {
            warn!("Failed to flush validator store: {}", e);
        }
        info!("Relayer stopped");
        result
    }
}

/// 等待关闭信号或致命错误；致命错误先取消出错的链，再取消全部
async fn supervise<F>(
    fatal_rx: &mut mpsc::UnboundedReceiver<(ChainId, Error)>,
    chain_tokens: &HashMap<ChainId, CancellationToken>,
    root: &CancellationToken,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    tokio::select! {
        fatal = fatal_rx.recv() => match fatal {
            Some((chain, err)) => {
                error!("Chain {} reported fatal error: {}", chain, err);
                if let Some(token) = chain_tokens.get(&chain) {
                    token.cancel();
                }
                root.cancel();
                Err(err)
            }
            None => {
                root.cancel();
                Ok(())
            }
        },
        _ = shutdown => {
            info!("Shutting down relayer");
            root.cancel();
            Ok(())
        }
    }
}

fn spawn_chain(chain: ChainRuntime, fatal_tx: FatalErrorSender) -> Vec<JoinHandle<()>> {
    let ChainRuntime {
        id,
        listener,
        syncer,
        start_block,
        cancel,
    } = chain;

    let syncer_task = {
        let cancel = cancel.clone();
        let fatal_tx = fatal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = syncer.run(cancel).await {
                let _ = fatal_tx.send((id, e));
            }
        })
    };
    let listener_task = tokio::spawn(async move {
        if let Err(e) = listener.run(start_block, cancel).await {
            let _ = fatal_tx.send((id, e));
        }
    });
    vec![syncer_task, listener_task]
}

async fn connect_chain(
    config: &Config,
    chain: &ChainConfig,
    store: &ValidatorStore,
    router: &Arc<Router>,
    fatal_tx: &FatalErrorSender,
    root: &CancellationToken,
) -> Result<ChainRuntime> {
    info!("Chain {}: connecting to {} at {}", chain.id, chain.name, chain.endpoint);
    let ethers_client = EthersClient::new(&chain.endpoint, chain.request_timeout())?;
    let network_chain_id = ethers_client.network_chain_id().await?;
    let wallet = chain.load_wallet(network_chain_id)?;
    let client: Arc<dyn ChainClient> = Arc::new(ethers_client);

    check_contracts(client.as_ref(), chain).await?;
    let transactor = Arc::new(Transactor::new(client.clone(), wallet));
    info!("Chain {}: relaying as {:?} on network {}", chain.id, transactor.address(), network_chain_id);
    let bridge: Arc<dyn BridgeContract> =
        Arc::new(BridgeContractClient::new(chain.bridge, client.clone(), transactor));
    check_bridge_chain_id(bridge.as_ref(), chain.id).await?;

    let tx_opts = Arc::new(TxOptsManager::spawn(client.clone(), chain.from, gas_policy(chain)));
    let cancel = root.child_token();

    let relayer = &config.relayer;
    let writer = Writer::new(
        WriterConfig {
            chain_id: chain.id,
            allowed_source_chains: config.chain_ids().into_iter().filter(|id| *id != chain.id).collect(),
            tx_retry_limit: relayer.tx_retry_limit,
            tx_retry_interval: relayer.tx_retry_interval(),
            execute_watch_limit: relayer.execute_watch_limit,
            block_retry_limit: relayer.block_retry_limit,
            block_retry_interval: relayer.block_retry_interval(),
        },
        client.clone(),
        bridge.clone(),
        tx_opts,
        fatal_tx.clone(),
        cancel.clone(),
    );
    router.register(chain.id, Arc::new(writer)).await;

    let syncer = Arc::new(ValidatorSyncer::new(
        chain.id,
        chain.epoch_size,
        client.clone(),
        store.clone(),
        relayer.block_retry_limit,
    ));

    let blockstore = FileBlockstore::new(&relayer.blockstore_path, chain.id, chain.from)?;
    let start_block = initial_block(client.as_ref(), &blockstore, chain).await?;

    let listener = Listener::new(
        ListenerConfig {
            chain_id: chain.id,
            bridge: chain.bridge,
            handlers: HandlerAddresses {
                erc20: chain.erc20_handler,
                erc721: chain.erc721_handler,
                generic: chain.generic_handler,
            },
            block_confirmations: chain.block_confirmations,
            block_retry_limit: relayer.block_retry_limit,
            block_retry_interval: relayer.block_retry_interval(),
        },
        client.clone(),
        bridge,
        Arc::new(HandlerContractClient::new(client)),
        syncer.clone(),
        router.clone(),
        Arc::new(blockstore),
    );

    info!("Chain {}: ready, listening from block {}", chain.id, start_block);
    Ok(ChainRuntime {
        id: chain.id,
        listener: Arc::new(listener),
        syncer,
        start_block,
        cancel,
    })
}

fn gas_policy(chain: &ChainConfig) -> GasPolicy {
    GasPolicy {
        gas_limit: U256::from(chain.gas_limit),
        max_gas_price: U256::from(chain.max_gas_price),
        gas_multiplier: chain.gas_multiplier,
    }
}

/// 桥合约与已配置的处理合约都必须已部署
async fn check_contracts(client: &dyn ChainClient, chain: &ChainConfig) -> Result<()> {
    let contracts: [(&str, Address); 4] = [
        ("bridge", chain.bridge),
        ("erc20Handler", chain.erc20_handler),
        ("erc721Handler", chain.erc721_handler),
        ("genericHandler", chain.generic_handler),
    ];
    for (name, address) in contracts {
        if address.is_zero() {
            continue;
        }
        let code = client.code_at(address).await?;
        if code.is_empty() {
            return Err(Error::Config(format!(
                "Chain {}: no {} contract deployed at {:?}",
                chain.id, name, address
            )));
        }
    }
    Ok(())
}

async fn check_bridge_chain_id(bridge: &dyn BridgeContract, expected: ChainId) -> Result<()> {
    let actual = bridge.chain_id().await?;
    if actual != expected {
        return Err(Error::Config(format!(
            "Bridge at {:?} reports chain id {}, config says {}",
            bridge.address(),
            actual,
            expected
        )));
    }
    Ok(())
}

async fn initial_block(client: &dyn ChainClient, blockstore: &dyn Blockstore, chain: &ChainConfig) -> Result<u64> {
    let base = if chain.latest_block {
        client.latest_block().await?
    } else {
        chain.start_block
    };
    resolve_start_block(blockstore, base, chain.fresh_start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::MockBlockstore;
    use crate::chain_adapter::{MockBridgeContract, MockChainClient};
    use ethers::types::Bytes;
    use std::time::Duration;

    fn chain_config() -> ChainConfig {
        serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "local",
            "endpoint": "http://localhost:8545",
            "from": "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf",
            "bridge": "0x0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b",
            "erc20Handler": "0x2020202020202020202020202020202020202020",
            "epochSize": 10,
            "startBlock": 50
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_check_contracts_requires_bytecode() {
        let chain = chain_config();
        let mut client = MockChainClient::new();
        client.expect_code_at().times(2).returning(|address| {
            if address == Address::repeat_byte(0x0b) {
                Ok(Bytes::from(vec![0x60, 0x80]))
            } else {
                Ok(Bytes::new())
            }
        });
        let err = check_contracts(&client, &chain).await.unwrap_err();
        assert!(err.to_string().contains("erc20Handler"));
    }

    #[tokio::test]
    async fn test_bridge_chain_id_must_match() {
        let mut bridge = MockBridgeContract::new();
        bridge.expect_chain_id().returning(|| Ok(3));
        bridge.expect_address().return_const(Address::repeat_byte(0x0b));
        tokio_test::assert_ok!(check_bridge_chain_id(&bridge, 3).await);
        assert!(check_bridge_chain_id(&bridge, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_initial_block() {
        let mut chain = chain_config();
        let mut client = MockChainClient::new();
        client.expect_latest_block().returning(|| Ok(900));
        let mut empty = MockBlockstore::new();
        empty.expect_try_load_latest_block().returning(|| Ok(None));
        let mut stored = MockBlockstore::new();
        stored.expect_try_load_latest_block().returning(|| Ok(Some(70)));

        assert_eq!(initial_block(&client, &empty, &chain).await.unwrap(), 50);
        assert_eq!(initial_block(&client, &stored, &chain).await.unwrap(), 71);

        chain.fresh_start = true;
        assert_eq!(initial_block(&client, &stored, &chain).await.unwrap(), 50);

        chain.fresh_start = false;
        chain.latest_block = true;
        assert_eq!(initial_block(&client, &stored, &chain).await.unwrap(), 900);
    }

    #[tokio::test]
    async fn test_fatal_error_cancels_chain_then_all() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();
        let tokens: HashMap<ChainId, CancellationToken> =
            [(1, root.child_token()), (2, root.child_token())].into();

        tx.send((2, Error::FatalTx)).unwrap();
        let err = supervise(&mut rx, &tokens, &root, std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FatalTx));
        assert!(tokens[&1].is_cancelled());
        assert!(tokens[&2].is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_signal_is_clean() {
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();
        let tokens: HashMap<ChainId, CancellationToken> = [(1, root.child_token())].into();

        let shutdown = tokio::time::sleep(Duration::from_secs(1));
        tokio_test::assert_ok!(supervise(&mut rx, &tokens, &root, shutdown).await);
        assert!(tokens[&1].is_cancelled());
    }

    #[test]
    fn test_gas_policy_from_config() {
        let mut chain = chain_config();
        chain.gas_multiplier = 1.25;
        let policy = gas_policy(&chain);
        assert_eq!(policy.gas_limit, U256::from(crate::config::DEFAULT_GAS_LIMIT));
        assert_eq!(policy.max_gas_price, U256::from(crate::config::DEFAULT_MAX_GAS_PRICE));
        assert_eq!(policy.gas_multiplier, 1.25);
    }
}
