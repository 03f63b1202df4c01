use ark_bls12_377::{Fr, G2Projective};
use ark_ec::{CurveGroup, Group};
use ark_serialize::CanonicalSerialize;
use ethers::types::{Address, Bytes, Log, H256, U256, U64};

use crate::trie::{tx_key, Trie, TxTrie};
use crate::types::{
    ChainId, EventSig, MerkleProof, Message, Payload, ProposalStatus, SignatureVerification, ValidatorData,
};

/// 生成元乘以 `k` 的 G2 压缩公钥
pub fn bls_key(k: u64) -> Bytes {
    let point = (G2Projective::generator() * Fr::from(k)).into_affine();
    let mut out = Vec::new();
    point.serialize_compressed(&mut out).unwrap();
    Bytes::from(out)
}

pub fn validator(k: u64) -> ValidatorData {
    ValidatorData {
        address: Address::from_low_u64_be(k),
        bls_public_key: bls_key(k),
    }
}

/// 桥合约在 `block` 中发出的 Deposit 事件
pub fn deposit_log(
    bridge: Address,
    block: u64,
    tx_index: u64,
    destination: ChainId,
    resource_id: [u8; 32],
    nonce: u64,
) -> Log {
    Log {
        address: bridge,
        topics: vec![
            EventSig::Deposit.topic(),
            H256::from_low_u64_be(destination as u64),
            H256(resource_id),
            H256::from_low_u64_be(nonce),
        ],
        block_number: Some(U64::from(block)),
        transaction_index: Some(U64::from(tx_index)),
        ..Default::default()
    }
}

pub fn sample_message(source: ChainId, destination: ChainId, nonce: u64) -> Message {
    Message {
        source,
        destination,
        deposit_nonce: nonce,
        resource_id: [0x11; 32],
        payload: Payload::Fungible {
            amount: U256::from(100u64),
            recipient: Bytes::from(vec![0xcc; 20]),
        },
        proof: MerkleProof::default(),
        signature: SignatureVerification::default(),
    }
}

/// 三笔伪造交易组成的区块里第 1 笔交易的证明
pub fn proven_message(source: ChainId, destination: ChainId, nonce: u64) -> Message {
    let txs = sample_transactions(3);
    let root = tx_root(&txs);
    let tree = TxTrie::build(root, &txs).unwrap();
    let (key, proof) = tree.prove_index(1).unwrap();
    Message {
        proof: MerkleProof {
            tx_root_hash: tree.root(),
            key: Bytes::from(key),
            nodes: Bytes::from(proof.encode_nodes()),
        },
        signature: SignatureVerification {
            aggregate_public_key: bls_key(6),
            block_hash: H256::repeat_byte(0xbb),
            signature: Bytes::from(vec![0x5a; 48]),
        },
        ..sample_message(source, destination, nonce)
    }
}

/// 按交易下标建树得到的根
pub fn tx_root(txs: &[Vec<u8>]) -> H256 {
    let mut trie = Trie::new();
    for (i, tx) in txs.iter().enumerate() {
        trie.insert(&tx_key(i), tx.clone());
    }
    trie.root_hash()
}

pub fn sample_transactions(count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            let mut tx = vec![0xf8, 0x6b];
            tx.extend(std::iter::repeat(i as u8 + 1).take(107));
            tx
        })
        .collect()
}

/// 桥合约发出的 ProposalEvent 事件
pub fn proposal_event_log(bridge: Address, block: u64, source: ChainId, nonce: u64, status: ProposalStatus) -> Log {
    Log {
        address: bridge,
        topics: vec![
            EventSig::ProposalEvent.topic(),
            H256::from_low_u64_be(source as u64),
            H256::from_low_u64_be(nonce),
            H256::from_low_u64_be(status as u64),
        ],
        block_number: Some(U64::from(block)),
        ..Default::default()
    }
}
