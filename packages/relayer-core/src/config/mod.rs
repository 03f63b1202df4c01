use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{types::ChainId, Error};

pub const DEFAULT_GAS_LIMIT: u64 = 6_721_975;
pub const DEFAULT_MAX_GAS_PRICE: u64 = 20_000_000_000;

/// 私钥环境变量，按链覆盖时加 `_<chainId>` 后缀
pub const RELAYER_KEY_ENV: &str = "RELAYER_KEY";

fn default_gas_limit() -> u64 {
    DEFAULT_GAS_LIMIT
}

fn default_max_gas_price() -> u64 {
    DEFAULT_MAX_GAS_PRICE
}

fn default_gas_multiplier() -> f64 {
    1.0
}

fn default_block_confirmations() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub id: ChainId,
    pub name: String,
    pub endpoint: String,
    /// 中继者账户地址，必须与私钥一致
    pub from: Address,
    pub bridge: Address,
    #[serde(default)]
    pub erc20_handler: Address,
    #[serde(default)]
    pub erc721_handler: Address,
    #[serde(default)]
    pub generic_handler: Address,
    pub epoch_size: u64,
    #[serde(default)]
    pub start_block: u64,
    /// 忽略 start_block，从当前链头开始
    #[serde(default)]
    pub latest_block: bool,
    /// 不读取已保存的区块游标
    #[serde(default)]
    pub fresh_start: bool,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default = "default_max_gas_price")]
    pub max_gas_price: u64,
    #[serde(default = "default_gas_multiplier")]
    pub gas_multiplier: f64,
    #[serde(default = "default_block_confirmations")]
    pub block_confirmations: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ChainConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// 读取本链的中继者私钥并绑定链上 chain id
    pub fn load_wallet(&self, network_chain_id: u64) -> Result<LocalWallet, Error> {
        self.wallet_from(network_chain_id, |name| std::env::var(name).ok())
    }

    fn wallet_from<F>(&self, network_chain_id: u64, lookup: F) -> Result<LocalWallet, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let per_chain = format!("{}_{}", RELAYER_KEY_ENV, self.id);
        let raw = lookup(&per_chain)
            .or_else(|| lookup(RELAYER_KEY_ENV))
            .ok_or_else(|| {
                Error::Config(format!(
                    "No key for chain {}: set {} or {}",
                    self.id, per_chain, RELAYER_KEY_ENV
                ))
            })?;
        let wallet = raw
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| Error::Config(format!("Invalid relayer key for chain {}: {}", self.id, e)))?
            .with_chain_id(network_chain_id);
        if wallet.address() != self.from {
            return Err(Error::Config(format!(
                "Key for chain {} belongs to {:?}, config expects {:?}",
                self.id,
                wallet.address(),
                self.from
            )));
        }
        Ok(wallet)
    }
}

fn default_blockstore_path() -> PathBuf {
    PathBuf::from("./blockstore")
}

fn default_validator_db_path() -> PathBuf {
    PathBuf::from("./validators-db")
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayerConfig {
    pub blockstore_path: PathBuf,
    pub validator_db_path: PathBuf,
    pub block_retry_limit: u32,
    pub block_retry_interval_secs: u64,
    pub tx_retry_limit: u32,
    pub tx_retry_interval_secs: u64,
    pub execute_watch_limit: u64,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            blockstore_path: default_blockstore_path(),
            validator_db_path: default_validator_db_path(),
            block_retry_limit: 5,
            block_retry_interval_secs: 5,
            tx_retry_limit: 10,
            tx_retry_interval_secs: 2,
            execute_watch_limit: 100,
        }
    }
}

impl RelayerConfig {
    pub fn block_retry_interval(&self) -> Duration {
        Duration::from_secs(self.block_retry_interval_secs)
    }

    pub fn tx_retry_interval(&self) -> Duration {
        Duration::from_secs(self.tx_retry_interval_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub relayer: RelayerConfig,
}

impl Config {
    /// 按扩展名解析 JSON 或 TOML 配置并校验
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, Error> {
        let path = config_path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&config_str)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?,
            Some("json") => serde_json::from_str(&config_str)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?,
            other => {
                return Err(Error::Config(format!(
                    "Unsupported config format: {:?}",
                    other.unwrap_or("")
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.chains.is_empty() {
            return Err(Error::Config("At least one chain must be configured".to_string()));
        }

        let mut ids = HashSet::new();
        for chain in &self.chains {
            if !ids.insert(chain.id) {
                return Err(Error::Config(format!("Duplicate chain id: {}", chain.id)));
            }
            if chain.endpoint.is_empty() {
                return Err(Error::Config(format!("Chain {} has no endpoint", chain.id)));
            }
            if chain.bridge.is_zero() {
                return Err(Error::Config(format!("Chain {} must provide a bridge address", chain.id)));
            }
            if chain.epoch_size == 0 {
                return Err(Error::Config(format!("Chain {} epoch size must be greater than 0", chain.id)));
            }
            if !(chain.gas_multiplier > 0.0) {
                return Err(Error::Config(format!("Chain {} gas multiplier must be positive", chain.id)));
            }
            if chain.max_gas_price == 0 || chain.gas_limit == 0 {
                return Err(Error::Config(format!("Chain {} gas settings must be greater than 0", chain.id)));
            }
        }

        // 验证中继器配置
        if self.relayer.block_retry_limit == 0 || self.relayer.tx_retry_limit == 0 {
            return Err(Error::Config("Relayer retry limits must be greater than 0".to_string()));
        }
        if self.relayer.execute_watch_limit == 0 {
            return Err(Error::Config("Execute watch limit must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn get_chain_config(&self, chain_id: ChainId) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.id == chain_id)
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        self.chains.iter().map(|c| c.id).collect()
    }
}
