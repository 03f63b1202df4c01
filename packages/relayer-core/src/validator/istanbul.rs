use ethers::types::{Address, Bytes};
use ethers::utils::rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use super::ValidatorError;

/// extra data 前的 vanity 长度
pub const ISTANBUL_EXTRA_VANITY: usize = 32;

/// 聚合签名，Bitmap/Round 为大端整数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatedSeal {
    pub bitmap: Vec<u8>,
    pub signature: Bytes,
    pub round: Vec<u8>,
}

/// 区块头 extra data 中 vanity 之后的 istanbul 扩展数据
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IstanbulExtra {
    pub added_validators: Vec<Address>,
    pub added_validators_public_keys: Vec<Bytes>,
    /// 被移除验证者的下标位图（大端）
    pub removed_validators: Vec<u8>,
    pub seal: Bytes,
    pub aggregated_seal: AggregatedSeal,
    pub parent_aggregated_seal: AggregatedSeal,
}

impl IstanbulExtra {
    pub fn from_header_extra(extra_data: &[u8]) -> Result<Self, ValidatorError> {
        if extra_data.len() < ISTANBUL_EXTRA_VANITY {
            return Err(ValidatorError::InvalidExtra(format!(
                "extra data of {} bytes is shorter than the vanity",
                extra_data.len()
            )));
        }
        ethers::utils::rlp::decode(&extra_data[ISTANBUL_EXTRA_VANITY..])
            .map_err(|e| ValidatorError::InvalidExtra(e.to_string()))
    }

    /// 带 vanity 的完整 extra data 编码
    pub fn to_header_extra(&self, vanity: [u8; ISTANBUL_EXTRA_VANITY]) -> Vec<u8> {
        let mut out = vanity.to_vec();
        out.extend_from_slice(&ethers::utils::rlp::encode(self));
        out
    }

    pub fn has_diff(&self) -> bool {
        !self.added_validators.is_empty() || self.removed_validators.iter().any(|b| *b != 0)
    }

    /// 区块的验证者聚合签名
    pub fn block_signature(&self) -> &Bytes {
        &self.aggregated_seal.signature
    }
}

impl Decodable for AggregatedSeal {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            bitmap: rlp.val_at(0)?,
            signature: Bytes::from(rlp.val_at::<Vec<u8>>(1)?),
            round: rlp.val_at(2)?,
        })
    }
}

impl Encodable for AggregatedSeal {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.bitmap);
        s.append(&self.signature.to_vec());
        s.append(&self.round);
    }
}

impl Decodable for IstanbulExtra {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 6 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let added_validators = rlp
            .at(0)?
            .iter()
            .map(|item| item.as_val::<Address>())
            .collect::<Result<Vec<_>, _>>()?;
        let added_validators_public_keys = rlp
            .at(1)?
            .iter()
            .map(|item| item.data().map(|key| Bytes::from(key.to_vec())))
            .collect::<Result<Vec<_>, _>>()?;
        if added_validators.len() != added_validators_public_keys.len() {
            return Err(DecoderError::Custom("validator and public key counts differ"));
        }
        Ok(Self {
            added_validators,
            added_validators_public_keys,
            removed_validators: rlp.val_at(2)?,
            seal: Bytes::from(rlp.val_at::<Vec<u8>>(3)?),
            aggregated_seal: rlp.val_at(4)?,
            parent_aggregated_seal: rlp.val_at(5)?,
        })
    }
}

impl Encodable for IstanbulExtra {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(6);
        s.begin_list(self.added_validators.len());
        for address in &self.added_validators {
            s.append(address);
        }
        s.begin_list(self.added_validators_public_keys.len());
        for key in &self.added_validators_public_keys {
            s.append(&key.to_vec());
        }
        s.append(&self.removed_validators);
        s.append(&self.seal.to_vec());
        s.append(&self.aggregated_seal);
        s.append(&self.parent_aggregated_seal);
    }
}
