//! Garbage collection: copy every chunk reachable from a live ref into
//! fresh table files and drop the rest.

use crate::cancel::Cancel;
use crate::chunk::{Chunk, ChunkType};
use crate::hash::Hash;
use crate::model::{Commit, RootValue, Table, TagMeta, WorkingSet};
use crate::prolly::Node;
use crate::value::codec::{blob_list_refs, blob_refs_in_tuple};
use borsh::BorshDeserialize;
use std::collections::HashSet;
use std::sync::Arc;

use super::table_file::{write_table_file, TableFileReader};
use super::{ChunkStore, FsStore, StoreError, TableFileEntry};

const GC_ATTEMPTS: u32 = 3;

/// Outgoing content-hash references of a chunk, by type tag.
pub fn references_of(chunk: &Chunk) -> Result<Vec<Hash>, StoreError> {
    let corrupt = |e: String| StoreError::CorruptChunk(chunk.hash(), e);
    let mut refs = Vec::new();
    match chunk.ty() {
        ChunkType::Blob | ChunkType::Schema => {}
        ChunkType::BlobList => {
            refs.extend(blob_list_refs(chunk.payload()).map_err(|e| corrupt(e.to_string()))?);
        }
        ChunkType::Node => {
            let node =
                Node::try_from_slice(chunk.payload()).map_err(|e| corrupt(e.to_string()))?;
            refs.extend(node.children.iter().copied());
            if node.level == 0 {
                for value in &node.values {
                    // Artifact trees hold non-tuple payloads; only valid
                    // tuples can carry out-of-line references.
                    if let Ok(blob_refs) = blob_refs_in_tuple(value) {
                        refs.extend(blob_refs);
                    }
                }
            }
        }
        ChunkType::Table => {
            let table =
                Table::try_from_slice(chunk.payload()).map_err(|e| corrupt(e.to_string()))?;
            refs.push(table.schema);
            refs.extend(table.primary);
            refs.extend(table.secondary.iter().filter_map(|(_, root)| *root));
            if let Some(conflicts) = &table.conflicts {
                refs.push(conflicts.base_schema);
                refs.push(conflicts.ours_schema);
                refs.push(conflicts.theirs_schema);
                refs.push(conflicts.tree);
            }
            refs.extend(table.violations);
        }
        ChunkType::Root => {
            let root =
                RootValue::try_from_slice(chunk.payload()).map_err(|e| corrupt(e.to_string()))?;
            refs.extend(root.tables.values().copied());
        }
        ChunkType::Commit => {
            let commit =
                Commit::try_from_slice(chunk.payload()).map_err(|e| corrupt(e.to_string()))?;
            refs.push(commit.root);
            refs.extend(commit.parents.iter().copied());
        }
        ChunkType::WorkingSet => {
            let ws =
                WorkingSet::try_from_slice(chunk.payload()).map_err(|e| corrupt(e.to_string()))?;
            refs.push(ws.working);
            refs.push(ws.staged);
            if let Some(merge) = &ws.merge {
                refs.push(merge.source);
                refs.push(merge.pre_working);
            }
        }
        ChunkType::Tag => {
            let tag =
                TagMeta::try_from_slice(chunk.payload()).map_err(|e| corrupt(e.to_string()))?;
            refs.push(tag.commit);
        }
    }
    Ok(refs)
}

/// All chunk hashes transitively reachable from `roots` within `store`.
pub fn reachable_set(
    store: &dyn ChunkStore,
    roots: &[Hash],
    cancel: &Cancel,
) -> Result<HashSet<Hash>, StoreError> {
    let mut live = HashSet::new();
    let mut frontier: Vec<Hash> = roots.to_vec();
    while let Some(hash) = frontier.pop() {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        if !live.insert(hash) {
            continue;
        }
        let chunk = store.get(&hash)?;
        frontier.extend(references_of(&chunk)?);
    }
    Ok(live)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub live_chunks: u64,
    pub files_before: usize,
    pub files_after: usize,
}

impl FsStore {
    /// Collect garbage: everything unreachable from the current ref set.
    /// Concurrent ref updates force a bounded number of retries.
    pub fn gc(&self, cancel: &Cancel) -> Result<GcStats, StoreError> {
        self.flush()?;

        for _ in 0..GC_ATTEMPTS {
            let snapshot = self.read_manifest()?;
            let roots: Vec<Hash> = snapshot.refs.values().map(|entry| entry.hash).collect();
            let live = reachable_set(self, &roots, cancel)?;

            let mut ordered: Vec<Hash> = live.iter().copied().collect();
            ordered.sort();
            let mut chunks = Vec::with_capacity(ordered.len());
            for hash in &ordered {
                chunks.push(self.get(hash)?);
            }

            let new_files = if chunks.is_empty() {
                Vec::new()
            } else {
                let (id, count) = write_table_file(self.dir(), &chunks)?;
                vec![TableFileEntry {
                    id,
                    chunk_count: count,
                }]
            };

            let mut next = snapshot.clone();
            let files_before = next.table_files.len();
            let old_files: Vec<String> = next.table_files.iter().map(|t| t.id.clone()).collect();
            next.table_files = new_files.clone();
            match self.write_manifest(snapshot.generation, next) {
                Ok(_) => {
                    let mut readers = Vec::new();
                    for entry in new_files.iter().rev() {
                        readers.push(Arc::new(TableFileReader::open(self.dir(), &entry.id)?));
                    }
                    self.replace_tables(readers);
                    for id in old_files {
                        if !new_files.iter().any(|t| t.id == id) {
                            let _ = std::fs::remove_file(self.dir().join(&id));
                        }
                    }
                    tracing::info!(
                        live = live.len(),
                        files_before,
                        files_after = new_files.len(),
                        "gc complete"
                    );
                    return Ok(GcStats {
                        live_chunks: live.len() as u64,
                        files_before,
                        files_after: new_files.len(),
                    });
                }
                Err(StoreError::Optimistic) => {
                    // Refs moved underneath us; recompute reachability.
                    if let Some(entry) = new_files.first() {
                        let _ = std::fs::remove_file(self.dir().join(&entry.id));
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Optimistic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Signature;
    use crate::store::{RefEntry, RefKind};
    use tempfile::tempdir;

    fn sig() -> Signature {
        Signature {
            name: "gc".into(),
            email: "gc@example.com".into(),
            millis: 0,
        }
    }

    #[test]
    fn gc_keeps_reachable_and_drops_garbage() {
        let dir = tempdir().unwrap();
        let store = FsStore::create(dir.path()).unwrap();

        // A live commit chain: commit -> root (no tables).
        let root = RootValue::new(1).store(&store).unwrap();
        let commit = Commit::build(&store, root, vec![], sig(), sig(), "live".into())
            .unwrap()
            .store(&store)
            .unwrap();

        // Garbage chunks with no ref naming them.
        let garbage = Chunk::new(ChunkType::Blob, b"orphaned bytes".to_vec());
        let garbage_hash = garbage.hash();
        store.put(garbage).unwrap();
        store.flush().unwrap();

        // Point a branch at the commit.
        loop {
            let current = store.read_manifest().unwrap();
            let mut next = current.clone();
            next.refs.insert(
                "refs/heads/main".into(),
                RefEntry {
                    kind: RefKind::Branch,
                    hash: commit,
                },
            );
            if store.write_manifest(current.generation, next).is_ok() {
                break;
            }
        }

        let stats = store.gc(&Cancel::new()).unwrap();
        assert_eq!(stats.live_chunks, 2);
        assert_eq!(stats.files_after, 1);

        // Live chunks still read; garbage is gone.
        assert!(store.try_get(&commit).unwrap().is_some());
        assert!(store.try_get(&root).unwrap().is_some());
        assert!(store.try_get(&garbage_hash).unwrap().is_none());

        // And the same holds after reopening from disk.
        drop(store);
        let reopened = FsStore::open(dir.path()).unwrap();
        assert!(reopened.try_get(&commit).unwrap().is_some());
        assert!(reopened.try_get(&garbage_hash).unwrap().is_none());
    }

    #[test]
    fn cancelled_gc_leaves_state_alone() {
        let dir = tempdir().unwrap();
        let store = FsStore::create(dir.path()).unwrap();
        let root = RootValue::new(1).store(&store).unwrap();
        let commit = Commit::build(&store, root, vec![], sig(), sig(), "c".into())
            .unwrap()
            .store(&store)
            .unwrap();
        store.flush().unwrap();
        loop {
            let current = store.read_manifest().unwrap();
            let mut next = current.clone();
            next.refs.insert(
                "refs/heads/main".into(),
                RefEntry {
                    kind: RefKind::Branch,
                    hash: commit,
                },
            );
            if store.write_manifest(current.generation, next).is_ok() {
                break;
            }
        }

        let cancel = Cancel::new();
        cancel.cancel();
        assert!(matches!(store.gc(&cancel), Err(StoreError::Cancelled)));
        assert!(store.try_get(&commit).unwrap().is_some());
    }
}
