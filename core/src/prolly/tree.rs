//! The Prolly tree: an ordered, persistent key→value map stored as a
//! Merkle B-tree with content-defined node boundaries.
//!
//! Mutations produce a new root and never touch existing chunks. The tree
//! for a given key-value set is unique: node boundaries depend only on
//! entry content, so the root hash is independent of edit history and
//! structurally equal subranges share chunks across histories.

use crate::hash::Hash;
use crate::store::{ChunkStore, StoreError};
use crate::value::codec::{compare_encoded, TupleKey};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::chunker::{is_boundary, MAX_NODE_SIZE};
use super::node::Node;

#[derive(Clone)]
pub struct ProllyTree {
    store: Arc<dyn ChunkStore>,
    root: Option<Hash>,
}

impl ProllyTree {
    pub fn new(store: Arc<dyn ChunkStore>, root: Option<Hash>) -> ProllyTree {
        ProllyTree { store, root }
    }

    pub fn empty(store: Arc<dyn ChunkStore>) -> ProllyTree {
        ProllyTree { store, root: None }
    }

    pub fn root_hash(&self) -> Option<Hash> {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn store(&self) -> Arc<dyn ChunkStore> {
        self.store.clone()
    }

    /// Point lookup.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let mut hash = match self.root {
            Some(h) => h,
            None => return Ok(None),
        };
        loop {
            let node = Node::load(&*self.store, &hash)?;
            if node.is_leaf() {
                return Ok(match node.keys.binary_search_by(|k| compare_encoded(k, key)) {
                    Ok(i) => Some(node.values[i].clone()),
                    Err(_) => None,
                });
            }
            let idx = node
                .keys
                .partition_point(|k| compare_encoded(k, key) == Ordering::Less);
            if idx == node.len() {
                return Ok(None);
            }
            hash = node.children[idx];
        }
    }

    /// Cursor over all entries in key order.
    pub fn cursor(&self) -> Result<TreeCursor, StoreError> {
        TreeCursor::start(self.store.clone(), self.root)
    }

    /// Ordered scan over `[lo, hi]` (either bound optional, inclusive).
    pub fn scan(
        &self,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut cursor = match lo {
            Some(lo) => TreeCursor::seek(self.store.clone(), self.root, lo)?,
            None => self.cursor()?,
        };
        let mut out = Vec::new();
        while let Some((key, value)) = cursor.peek_cloned() {
            if let Some(hi) = hi {
                if compare_encoded(&key, hi) == Ordering::Greater {
                    break;
                }
            }
            out.push((key, value));
            cursor.advance()?;
        }
        Ok(out)
    }

    /// Number of entries.
    pub fn count(&self) -> Result<u64, StoreError> {
        let mut cursor = self.cursor()?;
        let mut n = 0;
        while cursor.peek().is_some() {
            n += 1;
            cursor.advance()?;
        }
        Ok(n)
    }

    /// Apply a batch of inserts (`Some(value)`) and deletes (`None`),
    /// producing a new tree. The old tree remains valid.
    pub fn apply_edits(
        &self,
        edits: &BTreeMap<TupleKey, Option<Vec<u8>>>,
    ) -> Result<ProllyTree, StoreError> {
        if edits.is_empty() {
            return Ok(self.clone());
        }
        let mut builder = TreeBuilder::new(self.store.clone());
        let mut cursor = self.cursor()?;
        let mut edit_iter = edits.iter().peekable();

        loop {
            let entry = cursor.peek_cloned();
            match (entry, edit_iter.peek()) {
                (None, None) => break,
                (Some((key, value)), None) => {
                    builder.push(key, value)?;
                    cursor.advance()?;
                }
                (None, Some((key, edit))) => {
                    if let Some(value) = edit {
                        builder.push(key.0.clone(), value.clone())?;
                    }
                    edit_iter.next();
                }
                (Some((key, value)), Some((edit_key, edit))) => {
                    match compare_encoded(&key, &edit_key.0) {
                        Ordering::Less => {
                            builder.push(key, value)?;
                            cursor.advance()?;
                        }
                        Ordering::Greater => {
                            if let Some(new_value) = edit {
                                builder.push(edit_key.0.clone(), new_value.clone())?;
                            }
                            edit_iter.next();
                        }
                        Ordering::Equal => {
                            if let Some(new_value) = edit {
                                builder.push(edit_key.0.clone(), new_value.clone())?;
                            }
                            cursor.advance()?;
                            edit_iter.next();
                        }
                    }
                }
            }
        }

        let root = builder.finish()?;
        Ok(ProllyTree {
            store: self.store.clone(),
            root,
        })
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<ProllyTree, StoreError> {
        let mut edits = BTreeMap::new();
        edits.insert(TupleKey(key), Some(value));
        self.apply_edits(&edits)
    }

    pub fn delete(&self, key: &[u8]) -> Result<ProllyTree, StoreError> {
        let mut edits = BTreeMap::new();
        edits.insert(TupleKey(key.to_vec()), None);
        self.apply_edits(&edits)
    }
}

struct Frame {
    node: Node,
    hash: Hash,
    index: usize,
}

/// Depth-first cursor positioned at leaf entries.
pub struct TreeCursor {
    store: Arc<dyn ChunkStore>,
    stack: Vec<Frame>,
}

impl TreeCursor {
    pub fn start(store: Arc<dyn ChunkStore>, root: Option<Hash>) -> Result<TreeCursor, StoreError> {
        let mut cursor = TreeCursor {
            store,
            stack: Vec::new(),
        };
        if let Some(hash) = root {
            cursor.push_descend(hash)?;
            cursor.normalize()?;
        }
        Ok(cursor)
    }

    /// Cursor positioned at the first entry whose key is `>= key`.
    pub fn seek(
        store: Arc<dyn ChunkStore>,
        root: Option<Hash>,
        key: &[u8],
    ) -> Result<TreeCursor, StoreError> {
        let mut cursor = TreeCursor {
            store,
            stack: Vec::new(),
        };
        let mut hash = match root {
            Some(h) => h,
            None => return Ok(cursor),
        };
        loop {
            let node = Node::load(&*cursor.store, &hash)?;
            let idx = node
                .keys
                .partition_point(|k| compare_encoded(k, key) == Ordering::Less);
            let is_leaf = node.is_leaf();
            let at_end = idx == node.len();
            let child = if !is_leaf && !at_end {
                Some(node.children[idx])
            } else {
                None
            };
            cursor.stack.push(Frame {
                node,
                hash,
                index: idx,
            });
            match child {
                Some(next) if !is_leaf => hash = next,
                _ => break,
            }
        }
        cursor.normalize()?;
        Ok(cursor)
    }

    fn push_descend(&mut self, mut hash: Hash) -> Result<(), StoreError> {
        loop {
            let node = Node::load(&*self.store, &hash)?;
            let is_leaf = node.is_leaf();
            let first_child = node.children.first().copied();
            self.stack.push(Frame {
                node,
                hash,
                index: 0,
            });
            if is_leaf {
                return Ok(());
            }
            match first_child {
                Some(next) => hash = next,
                None => return Ok(()),
            }
        }
    }

    /// Restore the invariant: the stack top is a leaf with entries left,
    /// or the stack is empty (cursor exhausted).
    fn normalize(&mut self) -> Result<(), StoreError> {
        enum Step {
            Done,
            Descend(Hash),
            Pop,
        }
        loop {
            let step = match self.stack.last() {
                None => Step::Done,
                Some(top) if top.index < top.node.len() => {
                    if top.node.is_leaf() {
                        Step::Done
                    } else {
                        Step::Descend(top.node.children[top.index])
                    }
                }
                _ => Step::Pop,
            };
            match step {
                Step::Done => return Ok(()),
                Step::Descend(child) => self.push_descend(child)?,
                Step::Pop => {
                    self.stack.pop();
                    if let Some(parent) = self.stack.last_mut() {
                        parent.index += 1;
                    }
                }
            }
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.stack.is_empty()
    }

    /// Borrow the current entry without advancing.
    pub fn peek(&self) -> Option<(&[u8], &[u8])> {
        let top = self.stack.last()?;
        Some((
            top.node.keys[top.index].as_slice(),
            top.node.values[top.index].as_slice(),
        ))
    }

    pub fn peek_cloned(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.peek().map(|(k, v)| (k.to_vec(), v.to_vec()))
    }

    pub fn advance(&mut self) -> Result<(), StoreError> {
        if let Some(top) = self.stack.last_mut() {
            top.index += 1;
        }
        self.normalize()
    }

    /// Whether the cursor sits at the first entry of its current leaf.
    pub fn at_leaf_start(&self) -> bool {
        self.stack
            .last()
            .map_or(false, |f| f.node.is_leaf() && f.index == 0)
    }

    /// Hash of the leaf node the cursor is positioned in.
    pub fn current_leaf_hash(&self) -> Option<Hash> {
        self.stack
            .last()
            .filter(|f| f.node.is_leaf())
            .map(|f| f.hash)
    }

    /// Jump past every remaining entry of the current leaf.
    pub fn skip_current_leaf(&mut self) -> Result<(), StoreError> {
        if let Some(top) = self.stack.last_mut() {
            top.index = top.node.len();
        }
        self.normalize()
    }
}

impl Iterator for TreeCursor {
    type Item = Result<(Vec<u8>, Vec<u8>), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.peek_cloned()?;
        match self.advance() {
            Ok(()) => Some(Ok(entry)),
            Err(e) => Some(Err(e)),
        }
    }
}

enum Payload {
    Value(Vec<u8>),
    Child(Hash),
}

#[derive(Default)]
struct LevelAcc {
    keys: Vec<Vec<u8>>,
    values: Vec<Vec<u8>>,
    children: Vec<Hash>,
    bytes: usize,
}

impl LevelAcc {
    fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Builds a tree bottom-up from entries streamed in key order.
pub struct TreeBuilder {
    store: Arc<dyn ChunkStore>,
    levels: Vec<LevelAcc>,
}

impl TreeBuilder {
    pub fn new(store: Arc<dyn ChunkStore>) -> TreeBuilder {
        TreeBuilder {
            store,
            levels: vec![LevelAcc::default()],
        }
    }

    pub fn push(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError> {
        self.push_at(0, key, Payload::Value(value))
    }

    fn push_at(&mut self, level: usize, key: Vec<u8>, payload: Payload) -> Result<(), StoreError> {
        while self.levels.len() <= level {
            self.levels.push(LevelAcc::default());
        }
        let boundary = match &payload {
            Payload::Value(v) => is_boundary(level as u8, &key, v),
            Payload::Child(h) => is_boundary(level as u8, &key, h.as_bytes()),
        };
        let acc = &mut self.levels[level];
        match &payload {
            Payload::Value(v) => acc.bytes += key.len() + v.len(),
            Payload::Child(_) => acc.bytes += key.len() + crate::hash::HASH_LEN,
        }
        acc.keys.push(key);
        match payload {
            Payload::Value(v) => acc.values.push(v),
            Payload::Child(h) => acc.children.push(h),
        }
        let full = acc.bytes >= MAX_NODE_SIZE;
        if boundary || full {
            self.cut(level)?;
        }
        Ok(())
    }

    fn cut(&mut self, level: usize) -> Result<(), StoreError> {
        let acc = std::mem::take(&mut self.levels[level]);
        if acc.is_empty() {
            return Ok(());
        }
        let node = Node {
            level: level as u8,
            keys: acc.keys,
            values: acc.values,
            children: acc.children,
        };
        let high_key = node.keys.last().expect("non-empty node").clone();
        let chunk = node.to_chunk();
        let hash = chunk.hash();
        self.store.put(chunk)?;
        self.push_at(level + 1, high_key, Payload::Child(hash))
    }

    /// Flush all partial nodes and return the root hash (`None` for an
    /// empty tree).
    pub fn finish(mut self) -> Result<Option<Hash>, StoreError> {
        let mut level = 0;
        loop {
            let is_top = level + 1 == self.levels.len();
            if is_top {
                let acc = &self.levels[level];
                if acc.is_empty() {
                    return Ok(None);
                }
                if level > 0 && acc.children.len() == 1 {
                    return Ok(Some(acc.children[0]));
                }
                self.cut(level)?;
            } else if !self.levels[level].is_empty() {
                self.cut(level)?;
            }
            level += 1;
        }
    }
}
