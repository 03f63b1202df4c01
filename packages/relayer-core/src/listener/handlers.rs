use ethers::types::{Address, Log};

use crate::{
    chain_adapter::HandlerKind,
    types::{ChainId, Nonce, ResourceId},
    Error, Result,
};

/// 桥合约 Deposit 事件的三个 indexed 字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositEvent {
    pub destination: ChainId,
    pub resource_id: ResourceId,
    pub nonce: Nonce,
    pub tx_index: usize,
}

impl DepositEvent {
    pub fn from_log(log: &Log) -> Result<Self> {
        if log.topics.len() < 4 {
            return Err(Error::Serialization(format!(
                "deposit log has {} topics, expected 4",
                log.topics.len()
            )));
        }
        let destination = log.topics[1].to_low_u64_be();
        let destination = ChainId::try_from(destination)
            .map_err(|_| Error::Serialization(format!("destination chain {} out of range", destination)))?;
        let tx_index = log
            .transaction_index
            .ok_or_else(|| Error::Serialization("deposit log without transaction index".to_string()))?;
        Ok(Self {
            destination,
            resource_id: log.topics[2].0,
            nonce: log.topics[3].to_low_u64_be(),
            tx_index: tx_index.as_usize(),
        })
    }
}

/// 已配置的三类处理合约地址
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerAddresses {
    pub erc20: Address,
    pub erc721: Address,
    pub generic: Address,
}

impl HandlerAddresses {
    /// 未配置的地址返回 `None`
    pub fn kind_of(&self, handler: Address) -> Option<HandlerKind> {
        if handler.is_zero() {
            None
        } else if handler == self.erc20 {
            Some(HandlerKind::Erc20)
        } else if handler == self.erc721 {
            Some(HandlerKind::Erc721)
        } else if handler == self.generic {
            Some(HandlerKind::Generic)
        } else {
            None
        }
    }
}
