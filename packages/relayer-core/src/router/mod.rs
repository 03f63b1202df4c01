use async_trait::async_trait;
use log::{debug, error};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{types::ChainId, Error, Message, Result};

/// 目标链一侧消费消息的写入者
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageResolver: Send + Sync {
    /// 处理成功返回 true
    async fn resolve_message(&self, message: Message) -> bool;
}

/// 监听器向其投递消息的路由
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageRouter: Send + Sync {
    async fn send(&self, message: Message) -> Result<()>;
}

/// 按目标链 id 分发消息
#[derive(Default)]
pub struct Router {
    registry: RwLock<HashMap<ChainId, Arc<dyn MessageResolver>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: ChainId, resolver: Arc<dyn MessageResolver>) {
        debug!("Registering resolver for chain {}", id);
        self.registry.write().await.insert(id, resolver);
    }
}

#[async_trait]
impl MessageRouter for Router {
    /// 查找目标链的写入者并在后台处理，不等待结果
    async fn send(&self, message: Message) -> Result<()> {
        let resolver = self
            .registry
            .read()
            .await
            .get(&message.destination)
            .cloned()
            .ok_or(Error::UnknownDestination(message.destination))?;

        debug!("Routing message {}", message);
        tokio::spawn(async move {
            let description = message.to_string();
            if !resolver.resolve_message(message).await {
                error!("Failed to resolve message {}", description);
            }
        });
        Ok(())
    }
}
