//! 验证者集合同步：纪元边界上的差量应用、BLS 公钥聚合与按链持久化。

use ark_bls12_377::{G2Affine, G2Projective};
use ark_ec::CurveGroup;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use async_trait::async_trait;
use ethers::types::Bytes;

use crate::types::{ChainId, ValidatorData, ValidatorSet};

pub mod istanbul;
pub mod store;
pub mod syncer;

pub use istanbul::IstanbulExtra;
pub use store::ValidatorStore;
pub use syncer::ValidatorSyncer;

#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    #[error("removed validators bitmap has {bitmap_len} bits but only {known} validators are known")]
    WrongInitialValidators { bitmap_len: usize, known: usize },

    #[error("invalid istanbul extra data: {0}")]
    InvalidExtra(String),

    #[error("invalid BLS public key for validator {index}: {reason}")]
    InvalidPublicKey { index: usize, reason: String },

    #[error("cannot aggregate an empty validator set")]
    EmptyValidatorSet,
}

/// 给出某区块对应的验证者聚合公钥
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ValidatorsAggregator: Send + Sync {
    async fn aggregate_public_key_for_block(&self, block: u64) -> crate::Result<Bytes>;
}

/// 区块所在的纪元编号，0 号区块属于第 0 纪元
pub fn epoch_number(block: u64, epoch_size: u64) -> u64 {
    if block % epoch_size == 0 {
        block / epoch_size
    } else {
        block / epoch_size + 1
    }
}

pub fn epoch_last_block(epoch: u64, epoch_size: u64) -> u64 {
    if epoch == 0 {
        return 0;
    }
    epoch * epoch_size
}

/// 覆盖该区块的验证者集合所在的区块（上一纪元的最后一个区块）
pub fn validators_block_for(block: u64, epoch_size: u64) -> u64 {
    if block == 0 {
        return 0;
    }
    epoch_last_block(epoch_number(block, epoch_size) - 1, epoch_size)
}

/// 对上一纪元的验证者集合应用 istanbul 差量：
/// 先将位图中标记的下标置空，再追加新增验证者，最后压缩。
pub fn apply_diff(extra: &IstanbulExtra, previous: &[ValidatorData]) -> Result<ValidatorSet, ValidatorError> {
    let bitmap = &extra.removed_validators;
    let bit_len = bitmap_bit_len(bitmap);
    if bit_len > previous.len() {
        return Err(ValidatorError::WrongInitialValidators {
            bitmap_len: bit_len,
            known: previous.len(),
        });
    }

    let mut slots: Vec<Option<ValidatorData>> = previous.iter().cloned().map(Some).collect();
    for (index, slot) in slots.iter_mut().enumerate().take(bit_len) {
        if bitmap_bit(bitmap, index) {
            *slot = None;
        }
    }
    for (address, key) in extra
        .added_validators
        .iter()
        .zip(&extra.added_validators_public_keys)
    {
        slots.push(Some(ValidatorData {
            address: *address,
            bls_public_key: key.clone(),
        }));
    }
    Ok(slots.into_iter().flatten().collect())
}

/// 聚合验证者集合的 BLS12-377 G2 公钥，输出压缩编码
pub fn aggregate_public_keys(validators: &[ValidatorData]) -> Result<Bytes, ValidatorError> {
    if validators.is_empty() {
        return Err(ValidatorError::EmptyValidatorSet);
    }
    let mut acc = G2Projective::default();
    for (index, validator) in validators.iter().enumerate() {
        let key = G2Affine::deserialize_compressed(&validator.bls_public_key[..]).map_err(|e| {
            ValidatorError::InvalidPublicKey {
                index,
                reason: e.to_string(),
            }
        })?;
        acc += G2Projective::from(key);
    }
    let mut out = Vec::with_capacity(96);
    acc.into_affine()
        .serialize_compressed(&mut out)
        .map_err(|e| ValidatorError::InvalidPublicKey {
            index: validators.len(),
            reason: e.to_string(),
        })?;
    Ok(Bytes::from(out))
}

/// 大端位图的有效位数
fn bitmap_bit_len(bitmap: &[u8]) -> usize {
    match bitmap.iter().position(|b| *b != 0) {
        Some(first) => (bitmap.len() - first - 1) * 8 + (8 - bitmap[first].leading_zeros() as usize),
        None => 0,
    }
}

fn bitmap_bit(bitmap: &[u8], index: usize) -> bool {
    let byte = index / 8;
    if byte >= bitmap.len() {
        return false;
    }
    bitmap[bitmap.len() - 1 - byte] >> (index % 8) & 1 == 1
}

/// 存储键的命名空间前缀
pub(crate) fn chain_key(chain_id: ChainId, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(suffix.len() + 1);
    key.push(chain_id);
    key.extend_from_slice(suffix);
    key
}
