use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type ChainId = u8;
pub type Nonce = u64;
pub type ResourceId = [u8; 32];

/// 跨链转账类型，由 payload 变体决定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferType {
    Fungible,
    NonFungible,
    Generic,
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferType::Fungible => "FungibleTransfer",
            TransferType::NonFungible => "NonFungibleTransfer",
            TransferType::Generic => "GenericTransfer",
        };
        f.write_str(name)
    }
}

/// 按转账类型区分的消息负载
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Fungible {
        amount: U256,
        recipient: Bytes,
    },
    NonFungible {
        token_id: U256,
        recipient: Bytes,
        metadata: Bytes,
    },
    Generic {
        metadata: Bytes,
    },
}

impl Payload {
    pub fn transfer_type(&self) -> TransferType {
        match self {
            Payload::Fungible { .. } => TransferType::Fungible,
            Payload::NonFungible { .. } => TransferType::NonFungible,
            Payload::Generic { .. } => TransferType::Generic,
        }
    }
}

/// 交易在区块交易树中的包含性证明
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MerkleProof {
    pub tx_root_hash: H256,
    /// RLP 编码的交易下标
    pub key: Bytes,
    /// RLP 列表形式的证明节点
    pub nodes: Bytes,
}

/// 区块的验证者聚合签名信息
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignatureVerification {
    pub aggregate_public_key: Bytes,
    pub block_hash: H256,
    pub signature: Bytes,
}

/// 源链产生、目标链消费的跨链消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub source: ChainId,
    pub destination: ChainId,
    pub deposit_nonce: Nonce,
    pub resource_id: ResourceId,
    pub payload: Payload,
    pub proof: MerkleProof,
    pub signature: SignatureVerification,
}

impl Message {
    pub fn transfer_type(&self) -> TransferType {
        self.payload.transfer_type()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}->{} nonce={} rid=0x{}",
            self.transfer_type(),
            self.source,
            self.destination,
            self.deposit_nonce,
            hex::encode(self.resource_id)
        )
    }
}

/// 桥合约中提案的状态，数值与合约枚举一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProposalStatus {
    Inactive = 0,
    Active = 1,
    Passed = 2,
    Executed = 3,
    Cancelled = 4,
}

impl ProposalStatus {
    /// 已通过、已执行或已取消的提案不再需要投票
    pub fn is_complete(self) -> bool {
        matches!(
            self,
            ProposalStatus::Passed | ProposalStatus::Executed | ProposalStatus::Cancelled
        )
    }

    pub fn is_finalized(self) -> bool {
        matches!(self, ProposalStatus::Executed | ProposalStatus::Cancelled)
    }
}

impl TryFrom<u8> for ProposalStatus {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProposalStatus::Inactive),
            1 => Ok(ProposalStatus::Active),
            2 => Ok(ProposalStatus::Passed),
            3 => Ok(ProposalStatus::Executed),
            4 => Ok(ProposalStatus::Cancelled),
            other => Err(crate::Error::Serialization(format!(
                "invalid proposal status {}",
                other
            ))),
        }
    }
}

/// 链上读取的提案
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub resource_id: ResourceId,
    pub data_hash: H256,
    pub yes_votes: Vec<Address>,
    pub no_votes: Vec<Address>,
    pub status: ProposalStatus,
    pub proposed_block: U256,
}

/// 桥合约事件签名，topic 为签名的 keccak256
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSig {
    Deposit,
    ProposalEvent,
    ProposalVote,
}

impl EventSig {
    pub fn signature(self) -> &'static str {
        match self {
            EventSig::Deposit => "Deposit(uint8,bytes32,uint64)",
            EventSig::ProposalEvent => "ProposalEvent(uint8,uint64,uint8,bytes32,bytes32)",
            EventSig::ProposalVote => "ProposalVote(uint8,uint64,uint8,bytes32)",
        }
    }

    pub fn topic(self) -> H256 {
        H256(keccak256(self.signature()))
    }
}

/// 一个验证者的地址与 BLS12-377 G2 压缩公钥
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorData {
    pub address: Address,
    pub bls_public_key: Bytes,
}

pub type ValidatorSet = Vec<ValidatorData>;
