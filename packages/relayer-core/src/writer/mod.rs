use async_trait::async_trait;
use ethers::types::{Bytes, Filter, Log, H256};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::{
    chain_adapter::{wait_for_block, BridgeContract, ChainClient, ExecuteProposalCall, TxOptsSource},
    router::MessageResolver,
    types::{ChainId, EventSig, Message, ProposalStatus},
    verify::{MessageVerifier, VerifierConfig},
    Error, FatalErrorSender,
};

pub mod proposal_data;

pub use proposal_data::{data_hash, proposal_data};

/// 等待提案通过事件的最大区块数
pub const EXECUTE_BLOCK_WATCH_LIMIT: u64 = 100;
pub const TX_RETRY_INTERVAL: Duration = Duration::from_secs(2);
pub const TX_RETRY_LIMIT: u32 = 10;
pub const BLOCK_RETRY_LIMIT: u32 = 5;
pub const BLOCK_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub chain_id: ChainId,
    pub allowed_source_chains: Vec<ChainId>,
    pub tx_retry_limit: u32,
    pub tx_retry_interval: Duration,
    pub execute_watch_limit: u64,
    pub block_retry_limit: u32,
    pub block_retry_interval: Duration,
}

impl WriterConfig {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            allowed_source_chains: Vec::new(),
            tx_retry_limit: TX_RETRY_LIMIT,
            tx_retry_interval: TX_RETRY_INTERVAL,
            execute_watch_limit: EXECUTE_BLOCK_WATCH_LIMIT,
            block_retry_limit: BLOCK_RETRY_LIMIT,
            block_retry_interval: BLOCK_RETRY_INTERVAL,
        }
    }
}

/// 节点拒绝交易的原因分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionFailure {
    NonceTooLow,
    Underpriced,
    Other,
}

impl SubmissionFailure {
    pub fn classify(err: &Error) -> Self {
        let message = err.to_string().to_lowercase();
        if message.contains("nonce too low") {
            SubmissionFailure::NonceTooLow
        } else if message.contains("replacement transaction underpriced") {
            SubmissionFailure::Underpriced
        } else {
            SubmissionFailure::Other
        }
    }

    /// 需要重新读取链上 nonce 的失败
    pub fn needs_refresh(self) -> bool {
        matches!(self, SubmissionFailure::NonceTooLow | SubmissionFailure::Underpriced)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Vote,
    Execute,
    Skip,
}

/// 一条消息在目标链上对应的提案
struct PendingProposal {
    message: Message,
    data: Bytes,
    data_hash: H256,
}

/// 目标链写入者：投票、等待提案通过、执行
pub struct Writer {
    config: WriterConfig,
    client: Arc<dyn ChainClient>,
    bridge: Arc<dyn BridgeContract>,
    tx_opts: Arc<dyn TxOptsSource>,
    verifier: MessageVerifier,
    sys_err: FatalErrorSender,
    cancel: CancellationToken,
}

impl Writer {
    pub fn new(
        config: WriterConfig,
        client: Arc<dyn ChainClient>,
        bridge: Arc<dyn BridgeContract>,
        tx_opts: Arc<dyn TxOptsSource>,
        sys_err: FatalErrorSender,
        cancel: CancellationToken,
    ) -> Self {
        let verifier = MessageVerifier::new(VerifierConfig {
            chain_id: config.chain_id,
            allowed_source_chains: config.allowed_source_chains.clone(),
        });
        Self {
            config,
            client,
            bridge,
            tx_opts,
            verifier,
            sys_err,
            cancel,
        }
    }

    async fn prepare(&self, message: Message) -> crate::Result<PendingProposal> {
        self.verifier.verify_message(&message)?;
        let handler = self
            .bridge
            .resource_id_to_handler_address(message.resource_id)
            .await?;
        let data = proposal_data(&message.payload);
        let data_hash = data_hash(&data, handler, &message.proof, &message.signature);
        debug!(
            "Chain {}: proposal for {} has data hash {:?}",
            self.config.chain_id, message, data_hash
        );
        Ok(PendingProposal {
            message,
            data,
            data_hash,
        })
    }

    async fn proposal_status(&self, p: &PendingProposal) -> Option<ProposalStatus> {
        let m = &p.message;
        match self.bridge.get_proposal(m.source, m.deposit_nonce, p.data_hash).await {
            Ok(proposal) => Some(proposal.status),
            Err(e) => {
                error!("Failed to check proposal existence for {}: {}", m, e);
                None
            }
        }
    }

    async fn proposal_is_complete(&self, p: &PendingProposal) -> bool {
        self.proposal_status(p).await.map_or(false, ProposalStatus::is_complete)
    }

    async fn proposal_is_finalized(&self, p: &PendingProposal) -> bool {
        self.proposal_status(p).await.map_or(false, ProposalStatus::is_finalized)
    }

    async fn should_vote(&self, p: &PendingProposal) -> Decision {
        let m = &p.message;
        match self.proposal_status(p).await {
            Some(ProposalStatus::Passed) => {
                info!("Proposal {} already passed, executing without vote", m);
                return Decision::Execute;
            }
            Some(status) if status.is_complete() => {
                info!("Proposal {} complete, not voting", m);
                return Decision::Skip;
            }
            _ => {}
        }

        match self
            .bridge
            .has_voted_on_proposal(m.source, m.deposit_nonce, p.data_hash, self.tx_opts.sender())
            .await
        {
            Ok(true) => {
                info!("Relayer has already voted on {}, not voting", m);
                Decision::Skip
            }
            Ok(false) => Decision::Vote,
            Err(e) => {
                error!("Failed to check vote for {}: {}", m, e);
                Decision::Vote
            }
        }
    }

    /// 处理失败的提交。未上链的交易不会消耗 nonce，任何失败后都丢弃本地缓存的 nonce
    async fn handle_submission_failure(&self, action: &str, attempt: u32, err: &Error) {
        let failure = SubmissionFailure::classify(err);
        if failure.needs_refresh() {
            debug!("{} attempt {} hit {:?}, refreshing nonce", action, attempt, failure);
        } else {
            warn!("{} attempt {} failed: {}", action, attempt, err);
        }
        if let Err(e) = self.tx_opts.refresh().await {
            warn!("Failed to refresh tx options: {}", e);
        }
    }

    async fn vote_proposal(&self, p: &PendingProposal) {
        let m = &p.message;
        for attempt in 1..=self.config.tx_retry_limit {
            if self.cancel.is_cancelled() {
                return;
            }
            if self.proposal_is_complete(p).await {
                info!("Proposal voting complete on chain for {}", m);
                return;
            }
            match self.tx_opts.next_opts().await {
                Ok(opts) => match self
                    .bridge
                    .vote_proposal(opts, m.source, m.deposit_nonce, m.resource_id, p.data_hash)
                    .await
                {
                    Ok(tx) => {
                        info!("Submitted proposal vote for {}, tx {:?}", m, tx);
                        return;
                    }
                    Err(e) => self.handle_submission_failure("Vote", attempt, &e).await,
                },
                Err(e) => error!("Failed to update tx opts: {}", e),
            }
            if !crate::sleep_or_cancel(&self.cancel, self.config.tx_retry_interval).await {
                return;
            }
        }
        error!("Submission of vote transaction failed for {}", m);
        self.report_fatal(Error::FatalTx);
    }

    async fn execute_proposal(&self, p: &PendingProposal) {
        let m = &p.message;
        for attempt in 1..=self.config.tx_retry_limit {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.tx_opts.next_opts().await {
                Ok(opts) => match self.bridge.execute_proposal(opts, self.execute_call(p)).await {
                    Ok(tx) => {
                        info!("Submitted proposal execution for {}, tx {:?}", m, tx);
                        return;
                    }
                    Err(e) => self.handle_submission_failure("Execute", attempt, &e).await,
                },
                Err(e) => error!("Failed to update tx opts: {}", e),
            }
            if !crate::sleep_or_cancel(&self.cancel, self.config.tx_retry_interval).await {
                return;
            }
            // 其他中继者可能已经执行
            if self.proposal_is_finalized(p).await {
                info!("Proposal {} finalized on chain", m);
                return;
            }
        }
        error!("Submission of execute transaction failed for {}", m);
        self.report_fatal(Error::FatalTx);
    }

    fn execute_call(&self, p: &PendingProposal) -> ExecuteProposalCall {
        let m = &p.message;
        ExecuteProposalCall {
            source: m.source,
            nonce: m.deposit_nonce,
            data: p.data.clone(),
            resource_id: m.resource_id,
            signature_header: m.signature.signature.clone(),
            aggregate_public_key: m.signature.aggregate_public_key.clone(),
            g1: Bytes::new(),
            hashed_message: m.signature.block_hash,
            root_hash: m.proof.tx_root_hash,
            key: m.proof.key.clone(),
            nodes: m.proof.nodes.clone(),
        }
    }

    fn is_passed_event(&self, p: &PendingProposal, log: &Log) -> bool {
        if log.topics.len() < 4 {
            return false;
        }
        let source = log.topics[1].to_low_u64_be();
        let nonce = log.topics[2].to_low_u64_be();
        let status = log.topics[3].to_low_u64_be();
        let matched = source == p.message.source as u64
            && nonce == p.message.deposit_nonce
            && status == ProposalStatus::Passed as u64;
        if !matched {
            trace!("Ignoring proposal event src={} nonce={} status={}", source, nonce, status);
        }
        matched
    }

    async fn proposal_logs(&self, block: u64) -> crate::Result<Vec<Log>> {
        let filter = Filter::new()
            .address(self.bridge.address())
            .topic0(EventSig::ProposalEvent.topic())
            .from_block(block)
            .to_block(block);
        let mut retries = self.config.block_retry_limit;
        loop {
            match self.client.filter_logs(&filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    if retries == 0 {
                        return Err(Error::FatalQuery);
                    }
                    retries -= 1;
                    warn!("Failed to fetch proposal logs at block {}: {}", block, e);
                }
            }
            if !crate::sleep_or_cancel(&self.cancel, self.config.block_retry_interval).await {
                return Err(Error::Cancelled);
            }
        }
    }

    /// 从 `block` 起逐块查找提案通过事件，找到后执行
    async fn watch_then_execute(&self, p: &PendingProposal, mut block: u64) {
        let m = &p.message;
        info!("Watching for finalization event of {}", m);
        for _ in 0..self.config.execute_watch_limit {
            match wait_for_block(
                self.client.as_ref(),
                block,
                self.config.block_retry_limit,
                self.config.block_retry_interval,
                &self.cancel,
            )
            .await
            {
                Ok(()) => {}
                Err(Error::Cancelled) => return,
                Err(e) => {
                    error!("Waiting for block {} retries exceeded, shutting down", block);
                    self.report_fatal(e);
                    return;
                }
            }

            let logs = match self.proposal_logs(block).await {
                Ok(logs) => logs,
                Err(Error::Cancelled) => return,
                Err(e) => {
                    error!("Fetching proposal logs at block {} retries exceeded, shutting down", block);
                    self.report_fatal(e);
                    return;
                }
            };

            if logs.iter().any(|log| self.is_passed_event(p, log)) {
                self.execute_proposal(p).await;
                return;
            }
            trace!("No finalization event for {} in block {}", m, block);
            block += 1;
        }
        warn!("Block watch limit exceeded for {}, skipping execution", m);
    }

    fn report_fatal(&self, err: Error) {
        error!("Chain {}: fatal writer error: {}", self.config.chain_id, err);
        if self.sys_err.send((self.config.chain_id, err)).is_err() {
            warn!("Chain {}: fatal error channel closed", self.config.chain_id);
        }
    }
}

#[async_trait]
impl MessageResolver for Writer {
    async fn resolve_message(&self, message: Message) -> bool {
        info!("Chain {}: attempting to resolve message {}", self.config.chain_id, message);
        let proposal = match self.prepare(message).await {
            Ok(p) => p,
            Err(e) => {
                error!("Chain {}: rejecting message: {}", self.config.chain_id, e);
                return false;
            }
        };

        match self.should_vote(&proposal).await {
            Decision::Skip => return false,
            Decision::Execute => {
                self.execute_proposal(&proposal).await;
                return true;
            }
            Decision::Vote => {}
        }

        // 从投票前的高度开始观察
        let latest = match self.client.latest_block().await {
            Ok(head) => head,
            Err(e) => {
                error!("Unable to fetch latest block: {}", e);
                return false;
            }
        };

        tokio::join!(
            self.vote_proposal(&proposal),
            self.watch_then_execute(&proposal, latest)
        );
        true
    }
}
