use log::{debug, warn};

use crate::{
    trie::verify_encoded_proof,
    types::{ChainId, Message},
    Error, Result,
};

/// 验证器配置
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// 本链 id，消息的目标链必须是它
    pub chain_id: ChainId,
    /// 允许的源链，为空时不限制
    pub allowed_source_chains: Vec<ChainId>,
}

impl VerifierConfig {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            allowed_source_chains: Vec::new(),
        }
    }
}

/// 写入者投票前对消息做的本地检查
#[derive(Debug, Clone)]
pub struct MessageVerifier {
    config: VerifierConfig,
}

impl MessageVerifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    /// 验证消息的基本属性
    fn validate_message_properties(&self, message: &Message) -> Result<()> {
        if message.source == message.destination {
            warn!("Message {} loops back to its source chain", message);
            return Err(Error::Chain(format!(
                "source and destination are both chain {}",
                message.source
            )));
        }
        if message.destination != self.config.chain_id {
            warn!("Message {} is not addressed to chain {}", message, self.config.chain_id);
            return Err(Error::Chain(format!(
                "message for chain {} delivered to chain {}",
                message.destination, self.config.chain_id
            )));
        }
        if !self.config.allowed_source_chains.is_empty()
            && !self.config.allowed_source_chains.contains(&message.source)
        {
            warn!("Invalid source chain: {}", message.source);
            return Err(Error::Chain(format!("unknown source chain {}", message.source)));
        }
        if message.signature.aggregate_public_key.is_empty() {
            return Err(Error::Chain("message carries no aggregate public key".to_string()));
        }
        Ok(())
    }

    /// 检查属性并重放包含性证明
    pub fn verify_message(&self, message: &Message) -> Result<()> {
        debug!("Verifying message {}", message);
        self.validate_message_properties(message)?;

        let proof = &message.proof;
        let value = verify_encoded_proof(proof.tx_root_hash, &proof.key, &proof.nodes)?;
        if value.is_empty() {
            return Err(Error::Chain("inclusion proof resolves to an empty transaction".to_string()));
        }
        Ok(())
    }
}
