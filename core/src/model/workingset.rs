//! Working sets: per-branch uncommitted state.

use crate::chunk::{Chunk, ChunkType};
use crate::hash::Hash;
use crate::store::ChunkStore;
use borsh::{BorshDeserialize, BorshSerialize};

use super::ModelError;

/// Set while a merge with conflicts or violations is in flight. Holds
/// what `--abort` needs: the commit being merged and the working root as
/// it stood before the merge ran.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct MergeState {
    /// The commit being merged in ("theirs").
    pub source: Hash,
    /// Working root before the merge started.
    pub pre_working: Hash,
}

/// Per-branch working and staged roots, plus merge state while merging.
/// Tracked by a `refs/working/<branch>` ref; exists iff the branch does.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct WorkingSet {
    pub working: Hash,
    pub staged: Hash,
    pub merge: Option<MergeState>,
}

impl WorkingSet {
    /// A clean working set where everything equals the commit root.
    pub fn clean(root: Hash) -> WorkingSet {
        WorkingSet {
            working: root,
            staged: root,
            merge: None,
        }
    }

    pub fn is_merging(&self) -> bool {
        self.merge.is_some()
    }

    pub fn to_chunk(&self) -> Chunk {
        Chunk::new(ChunkType::WorkingSet, borsh::to_vec(self).expect("borsh"))
    }

    pub fn from_chunk(chunk: &Chunk) -> Result<WorkingSet, ModelError> {
        if chunk.ty() != ChunkType::WorkingSet {
            return Err(ModelError::Corrupt(format!(
                "expected working set chunk, found {:?}",
                chunk.ty()
            )));
        }
        WorkingSet::try_from_slice(chunk.payload()).map_err(|e| ModelError::Corrupt(e.to_string()))
    }

    pub fn load(store: &dyn ChunkStore, hash: &Hash) -> Result<WorkingSet, ModelError> {
        WorkingSet::from_chunk(&store.get(hash)?)
    }

    pub fn store(&self, store: &dyn ChunkStore) -> Result<Hash, ModelError> {
        let chunk = self.to_chunk();
        let hash = chunk.hash();
        store.put(chunk)?;
        Ok(hash)
    }
}
