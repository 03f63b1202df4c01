pub mod blockstore;
pub mod chain_adapter;
pub mod config;
pub mod listener;
pub mod relayer;
pub mod router;
pub mod trie;
pub mod types;
pub mod validator;
pub mod verify;
pub mod writer;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::Config;
pub use types::{ChainId, Message, Nonce, Payload, ProposalStatus, ResourceId, TransferType};

use ethers::providers::ProviderError;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Trie error: {0}")]
    Trie(#[from] trie::TrieError),

    #[error("Validator error: {0}")]
    Validator(#[from] validator::ValidatorError),

    #[error("no resolver registered for destination chain {0}")]
    UnknownDestination(ChainId),

    #[error("validators covering block {0} are not synced yet")]
    ValidatorsNotSynced(u64),

    #[error("listener block polling failed")]
    FatalPolling,

    #[error("submission of transaction failed")]
    FatalTx,

    #[error("query of chain state failed")]
    FatalQuery,

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// 致命错误上报通道，接收方为中继器主循环
pub type FatalErrorSender = mpsc::UnboundedSender<(ChainId, Error)>;

impl From<ProviderError> for Error {
    fn from(e: ProviderError) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<bcs::Error> for Error {
    fn from(e: bcs::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<ethers::abi::Error> for Error {
    fn from(e: ethers::abi::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<ethers::utils::rlp::DecoderError> for Error {
    fn from(e: ethers::utils::rlp::DecoderError) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// 可取消的休眠，被取消时返回 false
pub(crate) async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
