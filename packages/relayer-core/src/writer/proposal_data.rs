use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;

use crate::types::{MerkleProof, Payload, SignatureVerification};

fn pad32(value: U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    value.to_big_endian(&mut out);
    out
}

fn pad_len(bytes: &[u8]) -> [u8; 32] {
    pad32(U256::from(bytes.len()))
}

/// 目标链处理合约解析的提案数据，布局与合约端逐字节一致
pub fn proposal_data(payload: &Payload) -> Bytes {
    let mut data = Vec::new();
    match payload {
        Payload::Fungible { amount, recipient } => {
            data.extend_from_slice(&pad32(*amount));
            data.extend_from_slice(&pad_len(recipient));
            data.extend_from_slice(recipient);
        }
        Payload::NonFungible {
            token_id,
            recipient,
            metadata,
        } => {
            data.extend_from_slice(&pad32(*token_id));
            data.extend_from_slice(&pad_len(recipient));
            data.extend_from_slice(recipient);
            data.extend_from_slice(&pad_len(metadata));
            data.extend_from_slice(metadata);
        }
        Payload::Generic { metadata } => {
            data.extend_from_slice(&pad_len(metadata));
            data.extend_from_slice(metadata);
        }
    }
    Bytes::from(data)
}

/// 投票与查询提案时使用的数据哈希
///
/// 字段顺序：data ‖ handler ‖ txRoot ‖ key ‖ nodes ‖ aggregatePublicKey ‖ blockHash ‖ signature
pub fn data_hash(
    data: &[u8],
    handler: Address,
    proof: &MerkleProof,
    signature: &SignatureVerification,
) -> H256 {
    let mut buf = Vec::with_capacity(data.len() + 20 + 64 + proof.key.len() + proof.nodes.len());
    buf.extend_from_slice(data);
    buf.extend_from_slice(handler.as_bytes());
    buf.extend_from_slice(proof.tx_root_hash.as_bytes());
    buf.extend_from_slice(&proof.key);
    buf.extend_from_slice(&proof.nodes);
    buf.extend_from_slice(&signature.aggregate_public_key);
    buf.extend_from_slice(signature.block_hash.as_bytes());
    buf.extend_from_slice(&signature.signature);
    H256(keccak256(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fungible_layout() {
        let data = proposal_data(&Payload::Fungible {
            amount: U256::from(100u64),
            recipient: Bytes::from(vec![0xab; 20]),
        });
        assert_eq!(data.len(), 32 + 32 + 20);
        assert_eq!(data[31], 100);
        assert!(data[..31].iter().all(|b| *b == 0));
        assert_eq!(data[63], 20);
        assert_eq!(&data[64..], &[0xab; 20][..]);
    }

    #[test]
    fn test_non_fungible_layout() {
        let data = proposal_data(&Payload::NonFungible {
            token_id: U256::from(0x0102u64),
            recipient: Bytes::from(vec![0xcd; 3]),
            metadata: Bytes::from(vec![0xee; 5]),
        });
        assert_eq!(data.len(), 32 + 32 + 3 + 32 + 5);
        assert_eq!(&data[30..32], &[0x01, 0x02]);
        assert_eq!(data[63], 3);
        assert_eq!(&data[64..67], &[0xcd; 3]);
        assert_eq!(data[98], 5);
        assert_eq!(&data[99..], &[0xee; 5]);
    }

    #[test]
    fn test_generic_layout() {
        let data = proposal_data(&Payload::Generic {
            metadata: Bytes::from(hex::decode("deadbeef").unwrap()),
        });
        assert_eq!(
            hex::encode(&data),
            format!("{}{}", "0".repeat(62) + "04", "deadbeef")
        );

        let empty = proposal_data(&Payload::Generic {
            metadata: Bytes::new(),
        });
        assert_eq!(empty.to_vec(), vec![0u8; 32]);
    }

    #[test]
    fn test_data_hash_covers_every_field() {
        let data = [1u8, 2, 3];
        let handler = Address::repeat_byte(0x11);
        let proof = MerkleProof {
            tx_root_hash: H256::repeat_byte(0x22),
            key: Bytes::from(vec![0x80]),
            nodes: Bytes::from(vec![0xc0]),
        };
        let signature = SignatureVerification {
            aggregate_public_key: Bytes::from(vec![0x33; 96]),
            block_hash: H256::repeat_byte(0x44),
            signature: Bytes::from(vec![0x55; 48]),
        };

        let hash = data_hash(&data, handler, &proof, &signature);
        assert_eq!(hash, data_hash(&data, handler, &proof, &signature));

        let mut expected = data.to_vec();
        expected.extend_from_slice(handler.as_bytes());
        expected.extend_from_slice(&[0x22; 32]);
        expected.extend_from_slice(&[0x80, 0xc0]);
        expected.extend_from_slice(&[0x33; 96]);
        expected.extend_from_slice(&[0x44; 32]);
        expected.extend_from_slice(&[0x55; 48]);
        assert_eq!(hash, H256(keccak256(expected)));

        let other = SignatureVerification {
            block_hash: H256::repeat_byte(0x45),
            ..signature.clone()
        };
        assert_ne!(hash, data_hash(&data, handler, &proof, &other));
        assert_ne!(hash, data_hash(&data, Address::repeat_byte(0x12), &proof, &signature));
    }
}
