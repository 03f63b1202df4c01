use async_trait::async_trait;
use ethers::types::Bytes;
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{
    aggregate_public_keys, apply_diff, validators_block_for, IstanbulExtra, ValidatorStore,
    ValidatorsAggregator,
};
use crate::{
    chain_adapter::ChainClient,
    types::{ChainId, ValidatorData, ValidatorSet},
    Error, Result,
};

/// 区块尚未产生时的等待间隔
pub const HEADER_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// 沿纪元边界区块同步验证者集合，并为监听器提供聚合公钥
pub struct ValidatorSyncer {
    chain_id: ChainId,
    epoch_size: u64,
    client: Arc<dyn ChainClient>,
    store: ValidatorStore,
    retry_interval: Duration,
    retry_limit: u32,
}

impl ValidatorSyncer {
    pub fn new(
        chain_id: ChainId,
        epoch_size: u64,
        client: Arc<dyn ChainClient>,
        store: ValidatorStore,
        retry_limit: u32,
    ) -> Self {
        Self {
            chain_id,
            epoch_size,
            client,
            store,
            retry_interval: HEADER_RETRY_INTERVAL,
            retry_limit,
        }
    }

    /// 同步循环，直到被取消或遇到致命错误
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let latest = self.store.latest_known_block(self.chain_id)?;
        let (mut block, mut previous) = if latest == 0 {
            info!("Chain {}: syncing validators from block 0", self.chain_id);
            (0, Vec::new())
        } else {
            let known = self.store.validators_for_block(latest, self.chain_id)?;
            info!(
                "Chain {}: syncing validators from block {}",
                self.chain_id,
                latest + self.epoch_size
            );
            (latest + self.epoch_size, known)
        };

        let mut retry = self.retry_limit;
        while !cancel.is_cancelled() {
            match self.client.header_by_number(block).await {
                Ok(Some(header)) => {
                    previous = self.apply_epoch(block, &header.extra_data, &previous)?;
                    block += self.epoch_size;
                    retry = self.retry_limit;
                    continue;
                }
                Ok(None) => trace!("Chain {}: block {} not yet available", self.chain_id, block),
                Err(e) => {
                    if retry == 0 {
                        error!("Chain {}: giving up on header {}: {}", self.chain_id, block, e);
                        return Err(Error::FatalQuery);
                    }
                    retry -= 1;
                    warn!("Chain {}: failed to fetch header {}: {}", self.chain_id, block, e);
                }
            }
            if !crate::sleep_or_cancel(&cancel, self.retry_interval).await {
                break;
            }
        }
        info!("Chain {}: validator syncer stopped at block {}", self.chain_id, block);
        Ok(())
    }

    fn apply_epoch(&self, block: u64, extra_data: &[u8], previous: &[ValidatorData]) -> Result<ValidatorSet> {
        let extra = IstanbulExtra::from_header_extra(extra_data)?;
        let current = if extra.has_diff() {
            debug!(
                "Chain {}: block {} adds {} validators",
                self.chain_id,
                block,
                extra.added_validators.len()
            );
            apply_diff(&extra, previous)?
        } else {
            previous.to_vec()
        };
        self.store.set_validators_for_block(block, &current, self.chain_id)?;
        Ok(current)
    }
}

#[async_trait]
impl ValidatorsAggregator for ValidatorSyncer {
    async fn aggregate_public_key_for_block(&self, block: u64) -> Result<Bytes> {
        let needed = validators_block_for(block, self.epoch_size);
        if needed > self.store.latest_known_block(self.chain_id)? {
            return Err(Error::ValidatorsNotSynced(block));
        }
        let validators = self.store.validators_for_block(needed, self.chain_id)?;
        if validators.is_empty() {
            return Err(Error::ValidatorsNotSynced(block));
        }
        Ok(aggregate_public_keys(&validators)?)
    }
}
