//! Prolly tree nodes.
//!
//! A node carries an ordered sequence of entries. Leaves (level 0) hold
//! `(key, value)` pairs; internal nodes hold `(high_key, child_hash)`
//! pairs where `high_key` is the largest key in the child subtree.

use crate::chunk::{Chunk, ChunkType};
use crate::hash::Hash;
use crate::store::{ChunkStore, StoreError};
use borsh::{BorshDeserialize, BorshSerialize};

#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct Node {
    pub level: u8,
    pub keys: Vec<Vec<u8>>,
    /// Leaf payloads; empty for internal nodes.
    pub values: Vec<Vec<u8>>,
    /// Child hashes; empty for leaves.
    pub children: Vec<Hash>,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn to_chunk(&self) -> Chunk {
        Chunk::new(ChunkType::Node, borsh::to_vec(self).expect("borsh"))
    }

    pub fn from_chunk(chunk: &Chunk) -> Result<Node, StoreError> {
        if chunk.ty() != ChunkType::Node {
            return Err(StoreError::CorruptChunk(
                chunk.hash(),
                format!("expected tree node, found {:?}", chunk.ty()),
            ));
        }
        let node = Node::try_from_slice(chunk.payload())
            .map_err(|e| StoreError::CorruptChunk(chunk.hash(), e.to_string()))?;
        let payloads = if node.is_leaf() {
            node.values.len()
        } else {
            node.children.len()
        };
        if payloads != node.keys.len() {
            return Err(StoreError::CorruptChunk(
                chunk.hash(),
                "entry arity mismatch".to_string(),
            ));
        }
        Ok(node)
    }

    pub fn load(store: &dyn ChunkStore, hash: &Hash) -> Result<Node, StoreError> {
        Node::from_chunk(&store.get(hash)?)
    }
}
