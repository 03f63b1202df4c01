use std::path::Path;

use ethers::types::{Address, Bytes};
use log::debug;
use serde::{Deserialize, Serialize};
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;

use super::chain_key;
use crate::types::{ChainId, ValidatorData, ValidatorSet};
use crate::{Error, Result};

const LATEST_KNOWN_BLOCK: &[u8] = b"latestKnownBlock";
const LATEST_KNOWN_VALIDATORS: &[u8] = b"latestKnownValidators";

/// 持久化格式
#[derive(Serialize, Deserialize)]
struct StoredValidator {
    address: [u8; 20],
    bls_public_key: Vec<u8>,
}

impl From<&ValidatorData> for StoredValidator {
    fn from(v: &ValidatorData) -> Self {
        Self {
            address: v.address.0,
            bls_public_key: v.bls_public_key.to_vec(),
        }
    }
}

impl From<StoredValidator> for ValidatorData {
    fn from(v: StoredValidator) -> Self {
        Self {
            address: Address::from(v.address),
            bls_public_key: Bytes::from(v.bls_public_key),
        }
    }
}

/// 按链 id 隔离的验证者集合存储
#[derive(Clone)]
pub struct ValidatorStore {
    db: sled::Db,
}

impl std::fmt::Debug for ValidatorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatorStore").finish()
    }
}

impl ValidatorStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::Config::new()
            .path(path)
            .mode(sled::Mode::HighThroughput)
            .open()?;
        Ok(Self { db })
    }

    /// 在同一个事务中写入区块快照、最新区块与最新验证者集合
    pub fn set_validators_for_block(
        &self,
        block: u64,
        validators: &[ValidatorData],
        chain_id: ChainId,
    ) -> Result<()> {
        let snapshots = self.db.open_tree("validators")?;
        let latest = self.db.open_tree("latest")?;

        let stored: Vec<StoredValidator> = validators.iter().map(StoredValidator::from).collect();
        let encoded = bcs::to_bytes(&stored)?;
        let block_key = chain_key(chain_id, &block.to_be_bytes());

        (&snapshots, &latest)
            .transaction(|(snapshots, latest)| {
                snapshots.insert(block_key.as_slice(), encoded.as_slice())?;
                latest.insert(chain_key(chain_id, LATEST_KNOWN_BLOCK), &block.to_be_bytes()[..])?;
                latest.insert(chain_key(chain_id, LATEST_KNOWN_VALIDATORS), encoded.as_slice())?;
                Ok::<_, ConflictableTransactionError<std::io::Error>>(())
            })
            .map_err(|e| Error::Storage(format!("failed to store validators for block {}: {}", block, e)))?;

        debug!(
            "Stored {} validators for block {} on chain {}",
            validators.len(),
            block,
            chain_id
        );
        Ok(())
    }

    pub fn latest_known_block(&self, chain_id: ChainId) -> Result<u64> {
        let latest = self.db.open_tree("latest")?;
        match latest.get(chain_key(chain_id, LATEST_KNOWN_BLOCK))? {
            Some(raw) => {
                let bytes: [u8; 8] = raw[..]
                    .try_into()
                    .map_err(|_| Error::Storage("corrupt latest known block".to_string()))?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    pub fn latest_known_validators(&self, chain_id: ChainId) -> Result<ValidatorSet> {
        let latest = self.db.open_tree("latest")?;
        decode_validators(latest.get(chain_key(chain_id, LATEST_KNOWN_VALIDATORS))?)
    }

    pub fn validators_for_block(&self, block: u64, chain_id: ChainId) -> Result<ValidatorSet> {
        let snapshots = self.db.open_tree("validators")?;
        decode_validators(snapshots.get(chain_key(chain_id, &block.to_be_bytes()))?)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_validators(raw: Option<sled::IVec>) -> Result<ValidatorSet> {
    match raw {
        Some(raw) => {
            let stored: Vec<StoredValidator> = bcs::from_bytes(&raw)?;
            Ok(stored.into_iter().map(ValidatorData::from).collect())
        }
        None => Ok(Vec::new()),
    }
}
