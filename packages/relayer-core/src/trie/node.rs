use ethers::types::H256;
use ethers::utils::keccak256;
use ethers::utils::rlp::{Rlp, RlpStream};

use super::{encode_hex_prefix, TrieError};

#[derive(Debug, Default)]
pub(super) enum Node {
    #[default]
    Empty,
    Leaf {
        path: Vec<u8>,
        value: Vec<u8>,
    },
    Extension {
        path: Vec<u8>,
        child: Box<Node>,
    },
    Branch {
        children: Box<[Node; 16]>,
        value: Option<Vec<u8>>,
    },
}

fn empty_children() -> Box<[Node; 16]> {
    Box::new(std::array::from_fn(|_| Node::Empty))
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// 前缀非空时在节点外包一层扩展节点
fn with_prefix(prefix: &[u8], node: Node) -> Node {
    if prefix.is_empty() {
        node
    } else {
        Node::Extension {
            path: prefix.to_vec(),
            child: Box::new(node),
        }
    }
}

/// 把一段剩余路径挂到分支节点上：路径为空时存为分支值，否则作为子节点
fn attach(children: &mut [Node; 16], branch_value: &mut Option<Vec<u8>>, rest: &[u8], node: Node) {
    match rest.split_first() {
        None => {
            if let Node::Leaf { value, .. } = node {
                *branch_value = Some(value);
            }
        }
        Some((index, _)) => children[*index as usize] = node,
    }
}

impl Node {
    pub(super) fn insert(self, path: &[u8], value: Vec<u8>) -> Node {
        match self {
            Node::Empty => Node::Leaf {
                path: path.to_vec(),
                value,
            },
            Node::Leaf {
                path: leaf_path,
                value: leaf_value,
            } => {
                let common = common_prefix(&leaf_path, path);
                if common == leaf_path.len() && common == path.len() {
                    return Node::Leaf {
                        path: leaf_path,
                        value,
                    };
                }
                let mut children = empty_children();
                let mut branch_value = None;
                let old_rest = &leaf_path[common..];
                attach(
                    &mut children,
                    &mut branch_value,
                    old_rest,
                    Node::Leaf {
                        path: old_rest.get(1..).unwrap_or_default().to_vec(),
                        value: leaf_value,
                    },
                );
                let new_rest = &path[common..];
                attach(
                    &mut children,
                    &mut branch_value,
                    new_rest,
                    Node::Leaf {
                        path: new_rest.get(1..).unwrap_or_default().to_vec(),
                        value,
                    },
                );
                with_prefix(
                    &path[..common],
                    Node::Branch {
                        children,
                        value: branch_value,
                    },
                )
            }
            Node::Extension {
                path: ext_path,
                child,
            } => {
                let common = common_prefix(&ext_path, path);
                if common == ext_path.len() {
                    return Node::Extension {
                        child: Box::new(child.insert(&path[common..], value)),
                        path: ext_path,
                    };
                }
                let mut children = empty_children();
                let mut branch_value = None;
                // common < ext_path.len()，扩展节点在分叉处至少还剩一个半字节
                let ext_rest = &ext_path[common + 1..];
                children[ext_path[common] as usize] = with_prefix(ext_rest, *child);
                let new_rest = &path[common..];
                attach(
                    &mut children,
                    &mut branch_value,
                    new_rest,
                    Node::Leaf {
                        path: new_rest.get(1..).unwrap_or_default().to_vec(),
                        value,
                    },
                );
                with_prefix(
                    &path[..common],
                    Node::Branch {
                        children,
                        value: branch_value,
                    },
                )
            }
            Node::Branch {
                mut children,
                value: branch_value,
            } => match path.split_first() {
                None => Node::Branch {
                    children,
                    value: Some(value),
                },
                Some((index, rest)) => {
                    let index = *index as usize;
                    let child = std::mem::take(&mut children[index]);
                    children[index] = child.insert(rest, value);
                    Node::Branch {
                        children,
                        value: branch_value,
                    }
                }
            },
        }
    }

    pub(super) fn get(&self, path: &[u8]) -> Option<&[u8]> {
        match self {
            Node::Empty => None,
            Node::Leaf { path: p, value } => (p.as_slice() == path).then_some(value.as_slice()),
            Node::Extension { path: p, child } => path
                .strip_prefix(p.as_slice())
                .and_then(|rest| child.get(rest)),
            Node::Branch { children, value } => match path.split_first() {
                None => value.as_deref(),
                Some((index, rest)) => children[*index as usize].get(rest),
            },
        }
    }

    pub(super) fn encode(&self) -> Vec<u8> {
        match self {
            Node::Empty => vec![0x80],
            Node::Leaf { path, value } => {
                let mut stream = RlpStream::new_list(2);
                stream.append(&encode_hex_prefix(path, true));
                stream.append(value);
                stream.out().to_vec()
            }
            Node::Extension { path, child } => {
                let mut stream = RlpStream::new_list(2);
                stream.append(&encode_hex_prefix(path, false));
                child.append_reference(&mut stream);
                stream.out().to_vec()
            }
            Node::Branch { children, value } => {
                let mut stream = RlpStream::new_list(17);
                for child in children.iter() {
                    child.append_reference(&mut stream);
                }
                match value {
                    Some(value) => stream.append(value),
                    None => stream.append_empty_data(),
                };
                stream.out().to_vec()
            }
        }
    }

    /// 父节点中的引用：编码不足 32 字节时直接内嵌，否则使用 keccak 哈希
    fn append_reference(&self, stream: &mut RlpStream) {
        if let Node::Empty = self {
            stream.append_empty_data();
            return;
        }
        let encoded = self.encode();
        if encoded.len() < 32 {
            stream.append_raw(&encoded, 1);
        } else {
            stream.append(&keccak256(&encoded).to_vec());
        }
    }

    pub(super) fn collect_proof(&self, path: &[u8], is_root: bool, nodes: &mut Vec<Vec<u8>>) -> bool {
        let encoded = self.encode();
        if is_root || encoded.len() >= 32 {
            nodes.push(encoded);
        }
        match self {
            Node::Empty => false,
            Node::Leaf { path: p, .. } => p.as_slice() == path,
            Node::Extension { path: p, child } => match path.strip_prefix(p.as_slice()) {
                Some(rest) => child.collect_proof(rest, false, nodes),
                None => false,
            },
            Node::Branch { children, value } => match path.split_first() {
                None => value.is_some(),
                Some((index, rest)) => children[*index as usize].collect_proof(rest, false, nodes),
            },
        }
    }
}

/// 证明校验时节点对子节点的引用
pub(super) enum ChildRef {
    Empty,
    Hash(H256),
    Inline(Vec<u8>),
}

impl ChildRef {
    pub(super) fn decode(item: &Rlp) -> Result<Self, TrieError> {
        if item.is_list() {
            return Ok(ChildRef::Inline(item.as_raw().to_vec()));
        }
        let data = item.data()?;
        match data.len() {
            0 => Ok(ChildRef::Empty),
            32 => Ok(ChildRef::Hash(H256::from_slice(data))),
            n => Err(TrieError::InvalidProof(format!("child reference of {} bytes", n))),
        }
    }
}
