//! Commits, signatures, tags, and commit-graph walks.

use crate::chunk::{Chunk, ChunkType};
use crate::hash::Hash;
use crate::store::ChunkStore;
use borsh::{BorshDeserialize, BorshSerialize};
use chrono::{DateTime, Utc};
use std::collections::{BinaryHeap, HashMap, HashSet};

use super::ModelError;

/// Author or committer identity with its timestamp.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// Milliseconds since the Unix epoch, UTC.
    pub millis: i64,
}

impl Signature {
    pub fn new(name: &str, email: &str, at: DateTime<Utc>) -> Signature {
        Signature {
            name: name.to_string(),
            email: email.to_string(),
            millis: at.timestamp_millis(),
        }
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis).unwrap_or_default()
    }
}

/// A commit: root snapshot + ordered parent list + metadata. With two
/// parents, parent[0] is "ours" and parent[1] is "theirs". The stored
/// height equals `1 + max(parent heights)`, `0` for an initial commit.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct Commit {
    pub root: Hash,
    pub parents: Vec<Hash>,
    pub height: u64,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

impl Commit {
    /// Build a commit over `parents`, computing its height from theirs.
    pub fn build(
        store: &dyn ChunkStore,
        root: Hash,
        parents: Vec<Hash>,
        author: Signature,
        committer: Signature,
        message: String,
    ) -> Result<Commit, ModelError> {
        let mut height = 0;
        for parent in &parents {
            let parent_commit = Commit::load(store, parent)?;
            height = height.max(parent_commit.height + 1);
        }
        Ok(Commit {
            root,
            parents,
            height,
            author,
            committer,
            message,
        })
    }

    pub fn to_chunk(&self) -> Chunk {
        Chunk::new(ChunkType::Commit, borsh::to_vec(self).expect("borsh"))
    }

    pub fn from_chunk(chunk: &Chunk) -> Result<Commit, ModelError> {
        if chunk.ty() != ChunkType::Commit {
            return Err(ModelError::Corrupt(format!(
                "expected commit chunk, found {:?}",
                chunk.ty()
            )));
        }
        Commit::try_from_slice(chunk.payload()).map_err(|e| ModelError::Corrupt(e.to_string()))
    }

    pub fn load(store: &dyn ChunkStore, hash: &Hash) -> Result<Commit, ModelError> {
        Commit::from_chunk(&store.get(hash)?)
    }

    pub fn store(&self, store: &dyn ChunkStore) -> Result<Hash, ModelError> {
        let chunk = self.to_chunk();
        let hash = chunk.hash();
        store.put(chunk)?;
        Ok(hash)
    }
}

/// Annotated tag metadata. The tag ref points at this chunk, which points
/// at the tagged commit.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct TagMeta {
    pub commit: Hash,
    pub name: String,
    pub message: String,
    pub tagger: Signature,
}

impl TagMeta {
    pub fn to_chunk(&self) -> Chunk {
        Chunk::new(ChunkType::Tag, borsh::to_vec(self).expect("borsh"))
    }

    pub fn from_chunk(chunk: &Chunk) -> Result<TagMeta, ModelError> {
        if chunk.ty() != ChunkType::Tag {
            return Err(ModelError::Corrupt(format!(
                "expected tag chunk, found {:?}",
                chunk.ty()
            )));
        }
        TagMeta::try_from_slice(chunk.payload()).map_err(|e| ModelError::Corrupt(e.to_string()))
    }

    pub fn load(store: &dyn ChunkStore, hash: &Hash) -> Result<TagMeta, ModelError> {
        TagMeta::from_chunk(&store.get(hash)?)
    }

    pub fn store(&self, store: &dyn ChunkStore) -> Result<Hash, ModelError> {
        let chunk = self.to_chunk();
        let hash = chunk.hash();
        store.put(chunk)?;
        Ok(hash)
    }
}

#[derive(PartialEq, Eq)]
struct WalkItem {
    height: u64,
    hash: Hash,
}

impl Ord for WalkItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Height-major so parents never surface before descendants;
        // hash tie-break keeps the order deterministic.
        (self.height, self.hash).cmp(&(other.height, other.hash))
    }
}

impl PartialOrd for WalkItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Walks a commit graph from one or more heads in descending height
/// order, deduplicating commits reachable along multiple paths.
pub struct CommitWalk<'a> {
    store: &'a dyn ChunkStore,
    heap: BinaryHeap<WalkItem>,
    seen: HashSet<Hash>,
}

impl<'a> CommitWalk<'a> {
    pub fn from_heads(
        store: &'a dyn ChunkStore,
        heads: &[Hash],
    ) -> Result<CommitWalk<'a>, ModelError> {
        let mut walk = CommitWalk {
            store,
            heap: BinaryHeap::new(),
            seen: HashSet::new(),
        };
        for head in heads {
            walk.push(*head)?;
        }
        Ok(walk)
    }

    fn push(&mut self, hash: Hash) -> Result<(), ModelError> {
        if self.seen.insert(hash) {
            let commit = Commit::load(self.store, &hash)?;
            self.heap.push(WalkItem {
                height: commit.height,
                hash,
            });
        }
        Ok(())
    }

    pub fn next_commit(&mut self) -> Result<Option<(Hash, Commit)>, ModelError> {
        let item = match self.heap.pop() {
            Some(item) => item,
            None => return Ok(None),
        };
        let commit = Commit::load(self.store, &item.hash)?;
        for parent in &commit.parents {
            self.push(*parent)?;
        }
        Ok(Some((item.hash, commit)))
    }
}

/// Whether `ancestor` is reachable from `descendant` (inclusive).
pub fn is_ancestor(
    store: &dyn ChunkStore,
    ancestor: &Hash,
    descendant: &Hash,
) -> Result<bool, ModelError> {
    if ancestor == descendant {
        return Ok(true);
    }
    let target_height = Commit::load(store, ancestor)?.height;
    let mut frontier = vec![*descendant];
    let mut seen = HashSet::new();
    while let Some(hash) = frontier.pop() {
        if !seen.insert(hash) {
            continue;
        }
        if hash == *ancestor {
            return Ok(true);
        }
        let commit = Commit::load(store, &hash)?;
        if commit.height <= target_height {
            continue;
        }
        frontier.extend(commit.parents.iter().copied());
    }
    Ok(false)
}

fn ancestor_set(store: &dyn ChunkStore, head: &Hash) -> Result<HashMap<Hash, u64>, ModelError> {
    let mut set = HashMap::new();
    let mut frontier = vec![*head];
    while let Some(hash) = frontier.pop() {
        if set.contains_key(&hash) {
            continue;
        }
        let commit = Commit::load(store, &hash)?;
        set.insert(hash, commit.height);
        frontier.extend(commit.parents.iter().copied());
    }
    Ok(set)
}

/// All maximal common ancestors of `a` and `b`: common ancestors that are
/// not themselves ancestors of another common ancestor. More than one
/// candidate means a criss-cross history that needs a recursive virtual
/// base.
pub fn merge_base_candidates(
    store: &dyn ChunkStore,
    a: &Hash,
    b: &Hash,
) -> Result<Vec<Hash>, ModelError> {
    let of_a = ancestor_set(store, a)?;
    let of_b = ancestor_set(store, b)?;

    let mut common: Vec<(u64, Hash)> = of_a
        .iter()
        .filter(|(hash, _)| of_b.contains_key(*hash))
        .map(|(hash, height)| (*height, *hash))
        .collect();
    // Height-descending, hash tie-break: symmetric in (a, b).
    common.sort_by(|x, y| y.cmp(x));

    let mut kept: Vec<Hash> = Vec::new();
    for (_, candidate) in common {
        let mut dominated = false;
        for existing in &kept {
            if is_ancestor(store, &candidate, existing)? {
                dominated = true;
                break;
            }
        }
        if !dominated {
            kept.push(candidate);
        }
    }
    Ok(kept)
}

/// The merge base chosen by commit height; `None` for unrelated histories.
/// Criss-cross candidates resolve to the highest (then smallest-hash)
/// candidate here; the merge engine recurses over the full candidate set.
pub fn merge_base(store: &dyn ChunkStore, a: &Hash, b: &Hash) -> Result<Option<Hash>, ModelError> {
    Ok(merge_base_candidates(store, a, b)?.into_iter().next())
}
