//! Persistent sparse Merkle trie.
//!
//! Keys are placed along the bit path of `blake3(key)`. Subtrees holding a
//! single entry are compacted into one leaf, and deleting collapses branches
//! back into leaves, so the shape (and therefore the root) depends only on
//! the set of entries, never on insertion order.
//!
//! Nodes are content-addressed and immutable. Every update writes new nodes
//! through a [`NodeStore`]; an old root stays readable as long as its nodes
//! are kept. The empty trie has root [`ZERO_HASH`].

use std::collections::BTreeMap;

use crate::codec::{write_var_bytes, Codec, Reader};
use crate::crypto::hash_blake3;
use crate::error::{FatalError, FatalResult};
use crate::types::{Hash, ZERO_HASH};

/// Domain separator for leaf nodes.
const LEAF_PREFIX: u8 = 0x00;
/// Domain separator for branch nodes.
const BRANCH_PREFIX: u8 = 0x01;

/// Content-addressed node storage backing a trie.
pub trait NodeStore {
    fn get_node(&self, hash: &Hash) -> FatalResult<Option<Vec<u8>>>;

    fn put_node(&mut self, hash: Hash, bytes: Vec<u8>) -> FatalResult<()>;
}

impl NodeStore for BTreeMap<Hash, Vec<u8>> {
    fn get_node(&self, hash: &Hash) -> FatalResult<Option<Vec<u8>>> {
        Ok(self.get(hash).cloned())
    }

    fn put_node(&mut self, hash: Hash, bytes: Vec<u8>) -> FatalResult<()> {
        self.insert(hash, bytes);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Leaf { key: Vec<u8>, value: Vec<u8> },
    Branch { left: Hash, right: Hash },
}

impl Node {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Node::Leaf { key, value } => {
                buf.push(LEAF_PREFIX);
                write_var_bytes(&mut buf, key);
                write_var_bytes(&mut buf, value);
            }
            Node::Branch { left, right } => {
                buf.push(BRANCH_PREFIX);
                buf.extend_from_slice(left);
                buf.extend_from_slice(right);
            }
        }
        buf
    }

    fn decode(bytes: &[u8]) -> FatalResult<Self> {
        let mut r = Reader::new(bytes);
        let node = match r.read_u8()? {
            LEAF_PREFIX => Node::Leaf {
                key: r.read_var_bytes()?,
                value: r.read_var_bytes()?,
            },
            BRANCH_PREFIX => Node::Branch {
                left: r.read_hash()?,
                right: r.read_hash()?,
            },
            other => return Err(FatalError::invariant(format!("unknown trie node tag {other}"))),
        };
        Ok(node)
    }
}

fn path_bit(path: &Hash, depth: usize) -> bool {
    (path[depth / 8] >> (7 - depth % 8)) & 1 == 1
}

fn load<S: NodeStore + ?Sized>(store: &S, hash: &Hash) -> FatalResult<Node> {
    let bytes = store
        .get_node(hash)?
        .ok_or_else(|| FatalError::not_found(format!("trie node {}", hex::encode(hash))))?;
    Node::decode(&bytes)
}

fn save<S: NodeStore + ?Sized>(store: &mut S, node: Node) -> FatalResult<Hash> {
    let bytes = node.encode();
    let hash = hash_blake3(&bytes);
    store.put_node(hash, bytes)?;
    Ok(hash)
}

fn branch<S: NodeStore + ?Sized>(store: &mut S, left: Hash, right: Hash) -> FatalResult<Hash> {
    save(store, Node::Branch { left, right })
}

/// A trie identified by its root hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MerkleTrie {
    root: Hash,
}

impl MerkleTrie {
    pub fn new(root: Hash) -> Self {
        Self { root }
    }

    pub fn empty() -> Self {
        Self { root: ZERO_HASH }
    }

    pub fn root(&self) -> Hash {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root == ZERO_HASH
    }

    pub fn get<S: NodeStore + ?Sized>(&self, store: &S, key: &[u8]) -> FatalResult<Option<Vec<u8>>> {
        let path = hash_blake3(key);
        let mut current = self.root;
        let mut depth = 0;
        loop {
            if current == ZERO_HASH {
                return Ok(None);
            }
            match load(store, &current)? {
                Node::Leaf { key: k, value } => {
                    return Ok(if k == key { Some(value) } else { None });
                }
                Node::Branch { left, right } => {
                    current = if path_bit(&path, depth) { right } else { left };
                    depth += 1;
                }
            }
        }
    }

    pub fn contains<S: NodeStore + ?Sized>(&self, store: &S, key: &[u8]) -> FatalResult<bool> {
        Ok(self.get(store, key)?.is_some())
    }

    pub fn set<S: NodeStore + ?Sized>(&mut self, store: &mut S, key: &[u8], value: &[u8]) -> FatalResult<()> {
        let path = hash_blake3(key);
        self.root = insert(store, self.root, 0, &path, key, value)?;
        Ok(())
    }

    pub fn delete<S: NodeStore + ?Sized>(&mut self, store: &mut S, key: &[u8]) -> FatalResult<()> {
        let path = hash_blake3(key);
        self.root = remove(store, self.root, 0, &path, key)?;
        Ok(())
    }

    /// Typed read; the stored bytes must decode as `T`.
    pub fn get_value<T: Codec, S: NodeStore + ?Sized>(&self, store: &S, key: &[u8]) -> FatalResult<Option<T>> {
        match self.get(store, key)? {
            Some(bytes) => Ok(Some(T::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_value<T: Codec, S: NodeStore + ?Sized>(
        &mut self,
        store: &mut S,
        key: &[u8],
        value: &T,
    ) -> FatalResult<()> {
        self.set(store, key, &value.encode())
    }

    /// All entries, in trie path order.
    pub fn entries<S: NodeStore + ?Sized>(&self, store: &S) -> FatalResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(hash) = stack.pop() {
            if hash == ZERO_HASH {
                continue;
            }
            match load(store, &hash)? {
                Node::Leaf { key, value } => out.push((key, value)),
                Node::Branch { left, right } => {
                    stack.push(right);
                    stack.push(left);
                }
            }
        }
        Ok(out)
    }
}

fn insert<S: NodeStore + ?Sized>(
    store: &mut S,
    node: Hash,
    depth: usize,
    path: &Hash,
    key: &[u8],
    value: &[u8],
) -> FatalResult<Hash> {
    if node == ZERO_HASH {
        return save(store, Node::Leaf { key: key.to_vec(), value: value.to_vec() });
    }
    match load(store, &node)? {
        Node::Leaf { key: existing, .. } if existing == key => {
            save(store, Node::Leaf { key: key.to_vec(), value: value.to_vec() })
        }
        Node::Leaf { key: existing, .. } => {
            let new_leaf = save(store, Node::Leaf { key: key.to_vec(), value: value.to_vec() })?;
            let existing_path = hash_blake3(&existing);
            split(store, depth, new_leaf, path, node, &existing_path)
        }
        Node::Branch { left, right } => {
            if path_bit(path, depth) {
                let right = insert(store, right, depth + 1, path, key, value)?;
                branch(store, left, right)
            } else {
                let left = insert(store, left, depth + 1, path, key, value)?;
                branch(store, left, right)
            }
        }
    }
}

/// Build the branch chain separating two leaves whose paths agree up to `depth`.
fn split<S: NodeStore + ?Sized>(
    store: &mut S,
    depth: usize,
    a: Hash,
    a_path: &Hash,
    b: Hash,
    b_path: &Hash,
) -> FatalResult<Hash> {
    if depth >= 256 {
        return Err(FatalError::invariant("trie path collision"));
    }
    match (path_bit(a_path, depth), path_bit(b_path, depth)) {
        (false, true) => branch(store, a, b),
        (true, false) => branch(store, b, a),
        (false, false) => {
            let child = split(store, depth + 1, a, a_path, b, b_path)?;
            branch(store, child, ZERO_HASH)
        }
        (true, true) => {
            let child = split(store, depth + 1, a, a_path, b, b_path)?;
            branch(store, ZERO_HASH, child)
        }
    }
}

fn remove<S: NodeStore + ?Sized>(
    store: &mut S,
    node: Hash,
    depth: usize,
    path: &Hash,
    key: &[u8],
) -> FatalResult<Hash> {
    if node == ZERO_HASH {
        return Ok(ZERO_HASH);
    }
    match load(store, &node)? {
        Node::Leaf { key: existing, .. } => Ok(if existing == key { ZERO_HASH } else { node }),
        Node::Branch { left, right } => {
            let (new_left, new_right) = if path_bit(path, depth) {
                (left, remove(store, right, depth + 1, path, key)?)
            } else {
                (remove(store, left, depth + 1, path, key)?, right)
            };
            if (new_left, new_right) == (left, right) {
                return Ok(node);
            }
            // A lone leaf under a branch moves up.
            let lone = match (new_left == ZERO_HASH, new_right == ZERO_HASH) {
                (true, true) => return Ok(ZERO_HASH),
                (true, false) => Some(new_right),
                (false, true) => Some(new_left),
                (false, false) => None,
            };
            if let Some(child) = lone {
                if matches!(load(store, &child)?, Node::Leaf { .. }) {
                    return Ok(child);
                }
            }
            branch(store, new_left, new_right)
        }
    }
}
