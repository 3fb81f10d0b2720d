//! The chunk store: a content-addressed persistent map from 20-byte hash
//! to immutable chunk.
//!
//! Chunks are packed into append-only table files; the manifest names the
//! set of live table files and the current refs. `put` writes to an
//! in-memory buffer, `flush` atomically promotes the buffer into a new
//! table file and updates the manifest.

pub mod cache;
pub mod gc;
pub mod manifest;
pub mod table_file;

use crate::chunk::Chunk;
use crate::hash::Hash;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

pub use cache::{ChunkCache, DEFAULT_CACHE_BYTES};
pub use manifest::{Manifest, ManifestFile, RefEntry, RefKind, TableFileEntry};
pub use table_file::{write_table_file, TableFileReader};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunk not found: {0}")]
    NotFound(Hash),
    #[error("corrupt chunk {0}: {1}")]
    CorruptChunk(Hash, String),
    #[error("corrupt table file {0}: {1}")]
    CorruptTableFile(String, String),
    #[error("corrupt manifest: {0}")]
    CorruptManifest(String),
    #[error("no manifest in {0}; not a database directory")]
    NoManifest(PathBuf),
    #[error("database already initialized at {0}")]
    AlreadyInitialized(PathBuf),
    #[error("manifest changed concurrently")]
    Optimistic,
    #[error("could not acquire manifest lock {0}")]
    ManifestLocked(PathBuf),
    #[error("operation cancelled")]
    Cancelled,
}

/// Capability interface of a chunk store backend.
pub trait ChunkStore: Send + Sync {
    /// Fetch a chunk, or `None` when absent.
    fn try_get(&self, hash: &Hash) -> Result<Option<Chunk>, StoreError>;

    /// The subset of `hashes` present in this store.
    fn has_many(&self, hashes: &[Hash]) -> Result<HashSet<Hash>, StoreError>;

    /// Buffer a chunk for the next flush. Idempotent: re-putting a stored
    /// chunk is a no-op.
    fn put(&self, chunk: Chunk) -> Result<(), StoreError>;

    /// Atomically promote buffered chunks into a new table file and record
    /// it in the manifest.
    fn flush(&self) -> Result<(), StoreError>;

    /// Snapshot the manifest.
    fn read_manifest(&self) -> Result<Manifest, StoreError>;

    /// CAS the manifest against its generation counter. Fails with
    /// `StoreError::Optimistic` when `expected_generation` is stale.
    fn write_manifest(
        &self,
        expected_generation: u64,
        new: Manifest,
    ) -> Result<Manifest, StoreError>;

    /// Fetch a chunk that must exist.
    fn get(&self, hash: &Hash) -> Result<Chunk, StoreError> {
        self.try_get(hash)?.ok_or(StoreError::NotFound(*hash))
    }

    fn has(&self, hash: &Hash) -> Result<bool, StoreError> {
        Ok(!self.has_many(std::slice::from_ref(hash))?.is_empty())
    }
}

/// In-memory store for tests and scratch work.
pub struct MemoryStore {
    chunks: Mutex<HashMap<Hash, Chunk>>,
    manifest: Mutex<Manifest>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            chunks: Mutex::new(HashMap::new()),
            manifest: Mutex::new(Manifest::empty()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkStore for MemoryStore {
    fn try_get(&self, hash: &Hash) -> Result<Option<Chunk>, StoreError> {
        Ok(self.chunks.lock().unwrap().get(hash).cloned())
    }

    fn has_many(&self, hashes: &[Hash]) -> Result<HashSet<Hash>, StoreError> {
        let chunks = self.chunks.lock().unwrap();
        Ok(hashes
            .iter()
            .filter(|h| chunks.contains_key(h))
            .copied()
            .collect())
    }

    fn put(&self, chunk: Chunk) -> Result<(), StoreError> {
        self.chunks.lock().unwrap().insert(chunk.hash(), chunk);
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn read_manifest(&self) -> Result<Manifest, StoreError> {
        Ok(self.manifest.lock().unwrap().clone())
    }

    fn write_manifest(
        &self,
        expected_generation: u64,
        mut new: Manifest,
    ) -> Result<Manifest, StoreError> {
        let mut current = self.manifest.lock().unwrap();
        if current.generation != expected_generation {
            return Err(StoreError::Optimistic);
        }
        new.generation = expected_generation + 1;
        *current = new.clone();
        Ok(new)
    }
}

/// File-backed store over a `.dolt/noms` directory.
pub struct FsStore {
    dir: PathBuf,
    manifest: ManifestFile,
    tables: RwLock<Vec<Arc<TableFileReader>>>,
    pending: Mutex<HashMap<Hash, Chunk>>,
    cache: ChunkCache,
}

impl FsStore {
    /// Initialize a fresh store directory with an empty manifest.
    pub fn create(dir: &Path) -> Result<FsStore, StoreError> {
        std::fs::create_dir_all(dir)?;
        let manifest = ManifestFile::new(dir);
        manifest.create()?;
        Self::open(dir)
    }

    /// Open an existing store, loading the manifest and the table-file
    /// indexes it names. Stray temporary files from dead writers are
    /// removed.
    pub fn open(dir: &Path) -> Result<FsStore, StoreError> {
        let manifest_file = ManifestFile::new(dir);
        let manifest = manifest_file.load()?;

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().ends_with(".tmp") {
                tracing::warn!(file = %entry.path().display(), "removing partial table file");
                let _ = std::fs::remove_file(entry.path());
            }
        }

        let mut tables = Vec::new();
        for tf in manifest.table_files.iter().rev() {
            tables.push(Arc::new(TableFileReader::open(dir, &tf.id)?));
        }

        Ok(FsStore {
            dir: dir.to_path_buf(),
            manifest: manifest_file,
            tables: RwLock::new(tables),
            pending: Mutex::new(HashMap::new()),
            cache: ChunkCache::new(DEFAULT_CACHE_BYTES),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn table_snapshot(&self) -> Vec<Arc<TableFileReader>> {
        self.tables.read().unwrap().clone()
    }

    pub(crate) fn replace_tables(&self, readers: Vec<Arc<TableFileReader>>) {
        *self.tables.write().unwrap() = readers;
    }

    /// Re-read the manifest and open table files other writers added
    /// (another process pushing into this store, or a compaction).
    fn refresh_tables(&self) -> Result<(), StoreError> {
        let manifest = self.manifest.load()?;
        let mut tables = self.tables.write().unwrap();
        for entry in manifest.table_files.iter().rev() {
            if !tables.iter().any(|t| t.id() == entry.id) {
                tables.insert(0, Arc::new(TableFileReader::open(&self.dir, &entry.id)?));
            }
        }
        tables.retain(|t| manifest.table_files.iter().any(|e| e.id == t.id()));
        Ok(())
    }

    /// Append a freshly written table file to the manifest, retrying the
    /// CAS against concurrent manifest writers.
    fn record_table_file(&self, id: String, chunk_count: u32) -> Result<(), StoreError> {
        loop {
            let current = self.manifest.load()?;
            let mut next = current.clone();
            next.table_files.push(TableFileEntry {
                id: id.clone(),
                chunk_count,
            });
            match self.manifest.swap(current.generation, next) {
                Ok(_) => return Ok(()),
                Err(StoreError::Optimistic) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl ChunkStore for FsStore {
    fn try_get(&self, hash: &Hash) -> Result<Option<Chunk>, StoreError> {
        if let Some(chunk) = self.pending.lock().unwrap().get(hash) {
            return Ok(Some(chunk.clone()));
        }
        if let Some(chunk) = self.cache.get(hash) {
            return Ok(Some(chunk));
        }
        for table in self.table_snapshot() {
            if let Some(chunk) = table.get(hash)? {
                self.cache.insert(chunk.clone());
                return Ok(Some(chunk));
            }
        }
        // Miss: another writer may have landed a table file since this
        // handle last looked at the manifest.
        self.refresh_tables()?;
        for table in self.table_snapshot() {
            if let Some(chunk) = table.get(hash)? {
                self.cache.insert(chunk.clone());
                return Ok(Some(chunk));
            }
        }
        Ok(None)
    }

    fn has_many(&self, hashes: &[Hash]) -> Result<HashSet<Hash>, StoreError> {
        let mut present = HashSet::new();
        let pending = self.pending.lock().unwrap();
        let tables = self.table_snapshot();
        for hash in hashes {
            if pending.contains_key(hash) || tables.iter().any(|t| t.has(hash)) {
                present.insert(*hash);
            }
        }
        Ok(present)
    }

    fn put(&self, chunk: Chunk) -> Result<(), StoreError> {
        let mut pending = self.pending.lock().unwrap();
        pending.entry(chunk.hash()).or_insert(chunk);
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        let staged: Vec<Chunk> = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return Ok(());
            }
            // Skip chunks that already landed in a table file.
            let tables = self.table_snapshot();
            pending
                .drain()
                .map(|(_, c)| c)
                .filter(|c| !tables.iter().any(|t| t.has(&c.hash())))
                .collect()
        };
        if staged.is_empty() {
            return Ok(());
        }

        let (id, count) = write_table_file(&self.dir, &staged)?;
        self.record_table_file(id.clone(), count)?;

        let reader = Arc::new(TableFileReader::open(&self.dir, &id)?);
        self.tables.write().unwrap().insert(0, reader);
        for chunk in staged {
            self.cache.insert(chunk);
        }
        Ok(())
    }

    fn read_manifest(&self) -> Result<Manifest, StoreError> {
        self.manifest.load()
    }

    fn write_manifest(
        &self,
        expected_generation: u64,
        new: Manifest,
    ) -> Result<Manifest, StoreError> {
        self.manifest.swap(expected_generation, new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkType;
    use tempfile::tempdir;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        let chunk = Chunk::new(ChunkType::Blob, b"contents".to_vec());
        let hash = chunk.hash();
        assert!(store.try_get(&hash).unwrap().is_none());
        store.put(chunk.clone()).unwrap();
        assert_eq!(store.get(&hash).unwrap(), chunk);
        assert!(matches!(
            store.get(&Hash::of(b"missing")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn fs_store_put_flush_get() {
        let dir = tempdir().unwrap();
        let store = FsStore::create(dir.path()).unwrap();

        let chunks: Vec<Chunk> = (0..32u32)
            .map(|i| Chunk::new(ChunkType::Blob, format!("chunk {i}").into_bytes()))
            .collect();
        for c in &chunks {
            store.put(c.clone()).unwrap();
        }
        // Buffered chunks are visible before the flush.
        assert_eq!(store.get(&chunks[0].hash()).unwrap(), chunks[0]);

        store.flush().unwrap();
        drop(store);

        // And survive a reopen.
        let reopened = FsStore::open(dir.path()).unwrap();
        for c in &chunks {
            assert_eq!(reopened.get(&c.hash()).unwrap(), *c);
        }
        let present = reopened
            .has_many(&[chunks[0].hash(), Hash::of(b"absent")])
            .unwrap();
        assert_eq!(present.len(), 1);
        assert!(present.contains(&chunks[0].hash()));
    }

    #[test]
    fn put_is_idempotent_across_flushes() {
        let dir = tempdir().unwrap();
        let store = FsStore::create(dir.path()).unwrap();
        let chunk = Chunk::new(ChunkType::Blob, b"same".to_vec());

        store.put(chunk.clone()).unwrap();
        store.flush().unwrap();
        store.put(chunk.clone()).unwrap();
        store.flush().unwrap();

        // The second flush found nothing new to write.
        let manifest = store.read_manifest().unwrap();
        assert_eq!(manifest.table_files.len(), 1);
    }

    #[test]
    fn flush_with_nothing_pending_is_a_no_op() {
        let dir = tempdir().unwrap();
        let store = FsStore::create(dir.path()).unwrap();
        store.flush().unwrap();
        assert!(store.read_manifest().unwrap().table_files.is_empty());
    }
}
