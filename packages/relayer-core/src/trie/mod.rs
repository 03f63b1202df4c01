//! 内存中的 Merkle-Patricia 交易树，用于生成和校验交易包含性证明。

use ethers::types::H256;
use ethers::utils::keccak256;
use ethers::utils::rlp::{self, Rlp, RlpStream};

mod node;

use node::{ChildRef, Node};

/// 空树的根哈希，即 keccak256(rlp(""))
pub const EMPTY_ROOT: H256 = H256([
    0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6, 0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0, 0xf8, 0x6e,
    0x5b, 0x48, 0xe0, 0x1b, 0x99, 0x6c, 0xad, 0xc0, 0x01, 0x62, 0x2f, 0xb5, 0xe3, 0x63, 0xb4, 0x21,
]);

#[derive(Debug, thiserror::Error)]
pub enum TrieError {
    #[error("transaction roots don't match: header {expected:?}, computed {actual:?}")]
    RootMismatch { expected: H256, actual: H256 },

    #[error("key 0x{0} not found in trie")]
    KeyNotFound(String),

    #[error("invalid proof: {0}")]
    InvalidProof(String),
}

impl From<rlp::DecoderError> for TrieError {
    fn from(e: rlp::DecoderError) -> Self {
        TrieError::InvalidProof(e.to_string())
    }
}

/// 某个键的证明：根到叶子路径上所有以哈希引用的节点编码
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    pub nodes: Vec<Vec<u8>>,
    /// 叶子键的半字节表示，不含终止符
    pub key_nibbles: Vec<u8>,
}

impl Proof {
    /// 将证明节点编码为 RLP 列表
    pub fn encode_nodes(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(self.nodes.len());
        for node in &self.nodes {
            stream.append_raw(node, 1);
        }
        stream.out().to_vec()
    }
}

#[derive(Debug, Default)]
pub struct Trie {
    root: Node,
}

impl Trie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &[u8], value: Vec<u8>) {
        let path = to_nibbles(key);
        let root = std::mem::take(&mut self.root);
        self.root = root.insert(&path, value);
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.root.get(&to_nibbles(key))
    }

    pub fn root_hash(&self) -> H256 {
        match self.root {
            Node::Empty => EMPTY_ROOT,
            ref node => H256(keccak256(node.encode())),
        }
    }

    pub fn prove(&self, key: &[u8]) -> Result<Proof, TrieError> {
        let path = to_nibbles(key);
        let mut nodes = Vec::new();
        if !self.root.collect_proof(&path, true, &mut nodes) {
            return Err(TrieError::KeyNotFound(hex::encode(key)));
        }
        Ok(Proof {
            nodes,
            key_nibbles: path,
        })
    }
}

/// 由区块交易构建的交易树。键为 rlp(下标)，值为交易的 RLP 编码。
#[derive(Debug)]
pub struct TxTrie {
    trie: Trie,
    root: H256,
}

impl TxTrie {
    /// 构建交易树并校验根哈希与区块头中的 transactions_root 一致
    pub fn build<T: AsRef<[u8]>>(expected_root: H256, transactions: &[T]) -> Result<Self, TrieError> {
        let mut trie = Trie::new();
        for (index, tx) in transactions.iter().enumerate() {
            trie.insert(&tx_key(index), tx.as_ref().to_vec());
        }
        let actual = trie.root_hash();
        if actual != expected_root {
            return Err(TrieError::RootMismatch {
                expected: expected_root,
                actual,
            });
        }
        Ok(Self {
            trie,
            root: actual,
        })
    }

    pub fn root(&self) -> H256 {
        self.root
    }

    pub fn prove_index(&self, index: usize) -> Result<(Vec<u8>, Proof), TrieError> {
        let key = tx_key(index);
        let proof = self.trie.prove(&key)?;
        Ok((key, proof))
    }
}

pub fn tx_key(index: usize) -> Vec<u8> {
    rlp::encode(&(index as u64)).to_vec()
}

/// 依据根哈希重放证明，成功时返回键对应的值
pub fn verify_proof<T: AsRef<[u8]>>(root: H256, key: &[u8], nodes: &[T]) -> Result<Vec<u8>, TrieError> {
    let path = to_nibbles(key);
    let mut pos = 0;
    let mut proof = nodes.iter();
    let mut next = ChildRef::Hash(root);

    loop {
        let encoded = match next {
            ChildRef::Hash(hash) => {
                let node: &[u8] = proof
                    .next()
                    .ok_or_else(|| TrieError::InvalidProof(format!("missing node {:?}", hash)))?
                    .as_ref();
                if H256(keccak256(node)) != hash {
                    return Err(TrieError::InvalidProof(format!("hash mismatch at {:?}", hash)));
                }
                node.to_vec()
            }
            ChildRef::Inline(raw) => raw,
            ChildRef::Empty => return Err(TrieError::KeyNotFound(hex::encode(key))),
        };

        let node = Rlp::new(&encoded);
        match node.item_count()? {
            2 => {
                let (segment, is_leaf) = decode_hex_prefix(node.at(0)?.data()?)?;
                let rest = &path[pos..];
                if is_leaf {
                    if rest != segment.as_slice() {
                        return Err(TrieError::KeyNotFound(hex::encode(key)));
                    }
                    return Ok(node.at(1)?.data()?.to_vec());
                }
                if !rest.starts_with(&segment) {
                    return Err(TrieError::KeyNotFound(hex::encode(key)));
                }
                pos += segment.len();
                next = ChildRef::decode(&node.at(1)?)?;
            }
            17 => {
                if pos == path.len() {
                    let value = node.at(16)?.data()?;
                    if value.is_empty() {
                        return Err(TrieError::KeyNotFound(hex::encode(key)));
                    }
                    return Ok(value.to_vec());
                }
                next = ChildRef::decode(&node.at(path[pos] as usize)?)?;
                pos += 1;
            }
            n => return Err(TrieError::InvalidProof(format!("node with {} items", n))),
        }
    }
}

/// 校验以 RLP 列表编码的证明（即 `MerkleProof.nodes` 字段）
pub fn verify_encoded_proof(root: H256, key: &[u8], encoded_nodes: &[u8]) -> Result<Vec<u8>, TrieError> {
    let list = Rlp::new(encoded_nodes);
    if !list.is_list() {
        return Err(TrieError::InvalidProof("proof is not an RLP list".to_string()));
    }
    let nodes: Vec<Vec<u8>> = list.iter().map(|item| item.as_raw().to_vec()).collect();
    verify_proof(root, key, &nodes)
}

pub(crate) fn to_nibbles(key: &[u8]) -> Vec<u8> {
    key.iter().flat_map(|b| [b >> 4, b & 0x0f]).collect()
}

pub(crate) fn encode_hex_prefix(nibbles: &[u8], is_leaf: bool) -> Vec<u8> {
    let flag = if is_leaf { 2 } else { 0 };
    let mut out = Vec::with_capacity(nibbles.len() / 2 + 1);
    let rest = if nibbles.len() % 2 == 1 {
        out.push(((flag + 1) << 4) | nibbles[0]);
        &nibbles[1..]
    } else {
        out.push(flag << 4);
        nibbles
    };
    for pair in rest.chunks(2) {
        out.push((pair[0] << 4) | pair[1]);
    }
    out
}

fn decode_hex_prefix(encoded: &[u8]) -> Result<(Vec<u8>, bool), TrieError> {
    let first = *encoded
        .first()
        .ok_or_else(|| TrieError::InvalidProof("empty node path".to_string()))?;
    let flag = first >> 4;
    if flag > 3 {
        return Err(TrieError::InvalidProof(format!("bad path flag {}", flag)));
    }
    let is_leaf = flag & 2 != 0;
    let mut nibbles = Vec::with_capacity(encoded.len() * 2);
    if flag & 1 != 0 {
        nibbles.push(first & 0x0f);
    } else if first & 0x0f != 0 {
        // 偶数长度路径的填充半字节必须为 0
        return Err(TrieError::InvalidProof(format!("bad path padding {:#04x}", first)));
    }
    nibbles.extend(to_nibbles(&encoded[1..]));
    Ok((nibbles, is_leaf))
}
