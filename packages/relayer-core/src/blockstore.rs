use ethers::types::Address;
use log::info;
use std::path::{Path, PathBuf};

use crate::{types::ChainId, Error, Result};

/// 监听游标的持久化
#[cfg_attr(test, mockall::automock)]
pub trait Blockstore: Send + Sync {
    fn store_block(&self, block: u64) -> Result<()>;

    /// 从未写入过时返回 `None`
    fn try_load_latest_block(&self) -> Result<Option<u64>>;
}

/// 每条链、每个中继者一个文件，内容为十进制区块号
#[derive(Debug, Clone)]
pub struct FileBlockstore {
    path: PathBuf,
}

impl FileBlockstore {
    pub fn new<P: AsRef<Path>>(dir: P, chain_id: ChainId, relayer: Address) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::Storage(format!("Failed to create blockstore dir {:?}: {}", dir, e)))?;
        let path = dir.join(format!("{}-{:?}.block", chain_id, relayer));
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Blockstore for FileBlockstore {
    fn store_block(&self, block: u64) -> Result<()> {
        // 先写临时文件再重命名，避免中途崩溃留下半个数字
        let tmp = self.path.with_extension("block.tmp");
        std::fs::write(&tmp, block.to_string())
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| Error::Storage(format!("Failed to store block {}: {}", block, e)))
    }

    fn try_load_latest_block(&self) -> Result<Option<u64>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| Error::Storage(format!("Failed to read {:?}: {}", self.path, e)))?;
        raw.trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::Storage(format!("Corrupt blockstore {:?}: {}", self.path, e)))
    }
}

/// 决定监听的起始区块：除非 fresh_start，已处理过的区块之后继续
pub fn resolve_start_block(store: &dyn Blockstore, start_block: u64, fresh_start: bool) -> Result<u64> {
    if fresh_start {
        return Ok(start_block);
    }
    match store.try_load_latest_block()? {
        Some(last) if last + 1 > start_block => {
            info!("Resuming from stored block {}", last + 1);
            Ok(last + 1)
        }
        _ => Ok(start_block),
    }
}
