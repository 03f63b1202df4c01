use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, Bytes, TransactionRequest, H256, U256,
};
use ethers::utils::id;
use log::debug;
use std::sync::Arc;

use super::{
    BridgeContract, ChainClient, DepositRecord, ExecuteProposalCall, HandlerContract, HandlerKind,
    TxOptions,
};
use crate::{
    types::{ChainId, Nonce, Payload, Proposal, ProposalStatus, ResourceId},
    Error, Result,
};

const CHAIN_ID: &str = "_chainID()";
const RESOURCE_ID_TO_HANDLER: &str = "_resourceIDToHandlerAddress(bytes32)";
const GET_PROPOSAL: &str = "getProposal(uint8,uint64,bytes32)";
const HAS_VOTED_ON_PROPOSAL: &str = "_hasVotedOnProposal(uint72,bytes32,address)";
const VOTE_PROPOSAL: &str = "voteProposal(uint8,uint64,bytes32,bytes32)";
const EXECUTE_PROPOSAL: &str =
    "executeProposal(uint8,uint64,bytes,bytes32,bytes,bytes,bytes,bytes32,bytes32,bytes,bytes)";
const GET_DEPOSIT_RECORD: &str = "getDepositRecord(uint64,uint8)";

fn encode_call(signature: &str, tokens: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend_from_slice(&abi::encode(tokens));
    Bytes::from(data)
}

fn decode_output(types: &[ParamType], output: &[u8]) -> Result<Vec<Token>> {
    abi::decode(types, output).map_err(|e| Error::Serialization(format!("Failed to decode call output: {}", e)))
}

fn unexpected(what: &str) -> Error {
    Error::Serialization(format!("unexpected ABI output for {}", what))
}

fn to_fixed32(token: Token, what: &str) -> Result<[u8; 32]> {
    match token {
        Token::FixedBytes(bytes) if bytes.len() == 32 => {
            let mut out = [0u8; 32];
            out.copy_from_slice(&bytes);
            Ok(out)
        }
        _ => Err(unexpected(what)),
    }
}

fn to_uint(token: Token, what: &str) -> Result<U256> {
    token.into_uint().ok_or_else(|| unexpected(what))
}

fn to_u8(token: Token, what: &str) -> Result<u8> {
    let value = to_uint(token, what)?;
    if value > U256::from(u8::MAX) {
        return Err(unexpected(what));
    }
    Ok(value.low_u32() as u8)
}

fn to_address(token: Token, what: &str) -> Result<Address> {
    token.into_address().ok_or_else(|| unexpected(what))
}

fn to_bytes(token: Token, what: &str) -> Result<Bytes> {
    token.into_bytes().map(Bytes::from).ok_or_else(|| unexpected(what))
}

fn to_addresses(token: Token, what: &str) -> Result<Vec<Address>> {
    token
        .into_array()
        .ok_or_else(|| unexpected(what))?
        .into_iter()
        .map(|t| to_address(t, what))
        .collect()
}

/// 桥合约 `_hasVotedOnProposal` 使用的键：nonce 的大端字节后接源链 id
pub fn id_and_nonce(source: ChainId, nonce: Nonce) -> U256 {
    (U256::from(nonce) << 8) | U256::from(source)
}

/// 用本地私钥签名并发送原始交易
pub struct Transactor {
    client: Arc<dyn ChainClient>,
    wallet: LocalWallet,
}

impl Transactor {
    pub fn new(client: Arc<dyn ChainClient>, wallet: LocalWallet) -> Self {
        Self { client, wallet }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub async fn send(&self, to: Address, data: Bytes, opts: TxOptions) -> Result<H256> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.wallet.address())
            .to(to)
            .data(data)
            .nonce(opts.nonce)
            .gas(opts.gas_limit)
            .gas_price(opts.gas_price)
            .chain_id(self.wallet.chain_id())
            .into();
        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| Error::Transaction(format!("Failed to sign transaction: {}", e)))?;
        self.client.send_raw_transaction(tx.rlp_signed(&signature)).await
    }
}

pub struct BridgeContractClient {
    address: Address,
    client: Arc<dyn ChainClient>,
    transactor: Arc<Transactor>,
}

impl BridgeContractClient {
    pub fn new(address: Address, client: Arc<dyn ChainClient>, transactor: Arc<Transactor>) -> Self {
        Self {
            address,
            client,
            transactor,
        }
    }

    async fn call(&self, signature: &str, tokens: &[Token], output: &[ParamType]) -> Result<Vec<Token>> {
        let raw = self.client.call(self.address, encode_call(signature, tokens)).await?;
        decode_output(output, &raw)
    }
}

#[async_trait]
impl BridgeContract for BridgeContractClient {
    fn address(&self) -> Address {
        self.address
    }

    async fn chain_id(&self) -> Result<ChainId> {
        let mut out = self.call(CHAIN_ID, &[], &[ParamType::Uint(8)]).await?;
        to_u8(out.remove(0), CHAIN_ID)
    }

    async fn resource_id_to_handler_address(&self, resource_id: ResourceId) -> Result<Address> {
        let mut out = self
            .call(
                RESOURCE_ID_TO_HANDLER,
                &[Token::FixedBytes(resource_id.to_vec())],
                &[ParamType::Address],
            )
            .await?;
        to_address(out.remove(0), RESOURCE_ID_TO_HANDLER)
    }

    async fn get_proposal(&self, source: ChainId, nonce: Nonce, data_hash: H256) -> Result<Proposal> {
        let proposal_type = ParamType::Tuple(vec![
            ParamType::FixedBytes(32),
            ParamType::FixedBytes(32),
            ParamType::Array(Box::new(ParamType::Address)),
            ParamType::Array(Box::new(ParamType::Address)),
            ParamType::Uint(8),
            ParamType::Uint(256),
        ]);
        let mut out = self
            .call(
                GET_PROPOSAL,
                &[
                    Token::Uint(source.into()),
                    Token::Uint(nonce.into()),
                    Token::FixedBytes(data_hash.as_bytes().to_vec()),
                ],
                &[proposal_type],
            )
            .await?;
        let mut fields = out
            .remove(0)
            .into_tuple()
            .ok_or_else(|| unexpected(GET_PROPOSAL))?
            .into_iter();
        let mut next = || fields.next().ok_or_else(|| unexpected(GET_PROPOSAL));
        Ok(Proposal {
            resource_id: to_fixed32(next()?, GET_PROPOSAL)?,
            data_hash: H256(to_fixed32(next()?, GET_PROPOSAL)?),
            yes_votes: to_addresses(next()?, GET_PROPOSAL)?,
            no_votes: to_addresses(next()?, GET_PROPOSAL)?,
            status: ProposalStatus::try_from(to_u8(next()?, GET_PROPOSAL)?)?,
            proposed_block: to_uint(next()?, GET_PROPOSAL)?,
        })
    }

    async fn has_voted_on_proposal(
        &self,
        source: ChainId,
        nonce: Nonce,
        data_hash: H256,
        relayer: Address,
    ) -> Result<bool> {
        let mut out = self
            .call(
                HAS_VOTED_ON_PROPOSAL,
                &[
                    Token::Uint(id_and_nonce(source, nonce)),
                    Token::FixedBytes(data_hash.as_bytes().to_vec()),
                    Token::Address(relayer),
                ],
                &[ParamType::Bool],
            )
            .await?;
        out.remove(0)
            .into_bool()
            .ok_or_else(|| unexpected(HAS_VOTED_ON_PROPOSAL))
    }

    async fn vote_proposal(
        &self,
        opts: TxOptions,
        source: ChainId,
        nonce: Nonce,
        resource_id: ResourceId,
        data_hash: H256,
    ) -> Result<H256> {
        let data = encode_call(
            VOTE_PROPOSAL,
            &[
                Token::Uint(source.into()),
                Token::Uint(nonce.into()),
                Token::FixedBytes(resource_id.to_vec()),
                Token::FixedBytes(data_hash.as_bytes().to_vec()),
            ],
        );
        debug!("Voting on proposal {}/{} with nonce {}", source, nonce, opts.nonce);
        self.transactor.send(self.address, data, opts).await
    }

    async fn execute_proposal(&self, opts: TxOptions, call: ExecuteProposalCall) -> Result<H256> {
        let data = encode_call(
            EXECUTE_PROPOSAL,
            &[
                Token::Uint(call.source.into()),
                Token::Uint(call.nonce.into()),
                Token::Bytes(call.data.to_vec()),
                Token::FixedBytes(call.resource_id.to_vec()),
                Token::Bytes(call.signature_header.to_vec()),
                Token::Bytes(call.aggregate_public_key.to_vec()),
                Token::Bytes(call.g1.to_vec()),
                Token::FixedBytes(call.hashed_message.as_bytes().to_vec()),
                Token::FixedBytes(call.root_hash.as_bytes().to_vec()),
                Token::Bytes(call.key.to_vec()),
                Token::Bytes(call.nodes.to_vec()),
            ],
        );
        debug!(
            "Executing proposal {}/{} with nonce {}",
            call.source, call.nonce, opts.nonce
        );
        self.transactor.send(self.address, data, opts).await
    }
}

/// 三类处理合约共用的 `getDepositRecord` 读取
pub struct HandlerContractClient {
    client: Arc<dyn ChainClient>,
}

impl HandlerContractClient {
    pub fn new(client: Arc<dyn ChainClient>) -> Self {
        Self { client }
    }
}

fn deposit_record_type(kind: HandlerKind) -> ParamType {
    let fields = match kind {
        HandlerKind::Erc20 => vec![
            ParamType::Address,
            ParamType::Uint(8),
            ParamType::FixedBytes(32),
            ParamType::Bytes,
            ParamType::Address,
            ParamType::Uint(256),
        ],
        HandlerKind::Erc721 => vec![
            ParamType::Address,
            ParamType::Uint(8),
            ParamType::FixedBytes(32),
            ParamType::Bytes,
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::Bytes,
        ],
        HandlerKind::Generic => vec![
            ParamType::Uint(8),
            ParamType::Address,
            ParamType::FixedBytes(32),
            ParamType::Bytes,
        ],
    };
    ParamType::Tuple(fields)
}

pub(crate) fn decode_deposit_record(kind: HandlerKind, output: &[u8]) -> Result<DepositRecord> {
    let mut out = decode_output(&[deposit_record_type(kind)], output)?;
    let mut fields = out
        .remove(0)
        .into_tuple()
        .ok_or_else(|| unexpected(GET_DEPOSIT_RECORD))?
        .into_iter();
    let mut next = || fields.next().ok_or_else(|| unexpected(GET_DEPOSIT_RECORD));

    let record = match kind {
        HandlerKind::Erc20 | HandlerKind::Erc721 => {
            let _token = to_address(next()?, GET_DEPOSIT_RECORD)?;
            let destination = to_u8(next()?, GET_DEPOSIT_RECORD)?;
            let resource_id = to_fixed32(next()?, GET_DEPOSIT_RECORD)?;
            let recipient = to_bytes(next()?, GET_DEPOSIT_RECORD)?;
            let depositer = to_address(next()?, GET_DEPOSIT_RECORD)?;
            let value = to_uint(next()?, GET_DEPOSIT_RECORD)?;
            let payload = if kind == HandlerKind::Erc20 {
                Payload::Fungible {
                    amount: value,
                    recipient,
                }
            } else {
                Payload::NonFungible {
                    token_id: value,
                    recipient,
                    metadata: to_bytes(next()?, GET_DEPOSIT_RECORD)?,
                }
            };
            DepositRecord {
                destination,
                resource_id,
                depositer,
                payload,
            }
        }
        HandlerKind::Generic => DepositRecord {
            destination: to_u8(next()?, GET_DEPOSIT_RECORD)?,
            depositer: to_address(next()?, GET_DEPOSIT_RECORD)?,
            resource_id: to_fixed32(next()?, GET_DEPOSIT_RECORD)?,
            payload: Payload::Generic {
                metadata: to_bytes(next()?, GET_DEPOSIT_RECORD)?,
            },
        },
    };
    Ok(record)
}

#[async_trait]
impl HandlerContract for HandlerContractClient {
    async fn get_deposit_record(
        &self,
        handler: Address,
        kind: HandlerKind,
        nonce: Nonce,
        destination: ChainId,
    ) -> Result<DepositRecord> {
        let data = encode_call(
            GET_DEPOSIT_RECORD,
            &[Token::Uint(nonce.into()), Token::Uint(destination.into())],
        );
        let raw = self.client.call(handler, data).await?;
        decode_deposit_record(kind, &raw)
    }
}
