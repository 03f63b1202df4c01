use async_trait::async_trait;
use ethers::types::{Address, U256};
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::{ChainClient, TxOptions, TxOptsSource};
use crate::{Error, Result};

enum Request {
    Next(oneshot::Sender<Result<TxOptions>>),
    Refresh(oneshot::Sender<()>),
}

/// gas 价格策略
#[derive(Debug, Clone, Copy)]
pub struct GasPolicy {
    pub gas_limit: U256,
    pub max_gas_price: U256,
    pub gas_multiplier: f64,
}

/// 拥有 nonce 与 gas 价格的后台任务句柄。
/// 所有修改都在该任务中串行完成，调用方只拿到一次性的交易参数。
#[derive(Clone)]
pub struct TxOptsManager {
    sender: Address,
    requests: mpsc::Sender<Request>,
}

impl TxOptsManager {
    pub fn spawn(client: Arc<dyn ChainClient>, sender: Address, policy: GasPolicy) -> Self {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(run(client, sender, policy, rx));
        Self {
            sender,
            requests: tx,
        }
    }
}

#[async_trait]
impl TxOptsSource for TxOptsManager {
    fn sender(&self) -> Address {
        self.sender
    }

    async fn next_opts(&self) -> Result<TxOptions> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Next(reply))
            .await
            .map_err(|_| Error::Transaction("tx options task stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Transaction("tx options task dropped request".to_string()))?
    }

    async fn refresh(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Refresh(reply))
            .await
            .map_err(|_| Error::Transaction("tx options task stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Transaction("tx options task dropped request".to_string()))
    }
}

async fn run(
    client: Arc<dyn ChainClient>,
    sender: Address,
    policy: GasPolicy,
    mut requests: mpsc::Receiver<Request>,
) {
    let mut next_nonce: Option<U256> = None;

    while let Some(request) = requests.recv().await {
        match request {
            Request::Next(reply) => {
                let opts = lease(client.as_ref(), sender, &policy, &mut next_nonce).await;
                if let Err(e) = &opts {
                    warn!("Failed to update tx opts for {:?}: {}", sender, e);
                }
                if reply.send(opts).is_err() {
                    // 租出的 nonce 没有被使用
                    debug!("Tx opts requester for {:?} went away, dropping cached nonce", sender);
                    next_nonce = None;
                }
            }
            Request::Refresh(reply) => {
                debug!("Dropping cached nonce for {:?}", sender);
                next_nonce = None;
                if reply.send(()).is_err() {
                    debug!("Refresh requester for {:?} went away", sender);
                }
            }
        }
    }
}

async fn lease(
    client: &dyn ChainClient,
    sender: Address,
    policy: &GasPolicy,
    next_nonce: &mut Option<U256>,
) -> Result<TxOptions> {
    let gas_price = gas_price(client.suggest_gas_price().await?, policy);
    let pending = client.pending_nonce_at(sender).await?;
    let nonce = match *next_nonce {
        Some(local) if local > pending => local,
        _ => pending,
    };
    *next_nonce = Some(nonce + 1);
    Ok(TxOptions {
        nonce,
        gas_price,
        gas_limit: policy.gas_limit,
    })
}

fn gas_price(suggested: U256, policy: &GasPolicy) -> U256 {
    let scaled = if (policy.gas_multiplier - 1.0).abs() < f64::EPSILON {
        suggested
    } else {
        // 以千分之一精度放大
        let factor = (policy.gas_multiplier * 1000.0).round() as u64;
        suggested * U256::from(factor) / U256::from(1000u64)
    };
    scaled.min(policy.max_gas_price)
}
