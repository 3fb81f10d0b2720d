//! The chunk-exchange boundary.
//!
//! Everything below this trait (HTTPS, S3, ...) is out of scope for the
//! core; a filesystem transport is provided for local remotes, clones on
//! the same machine, and tests.

use crate::chunk::Chunk;
use crate::hash::Hash;
use crate::store::{ChunkStore, FsStore, RefEntry, RefKind, StoreError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::RemoteError;

#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Branch and tag refs on the remote: full ref path → hash.
    async fn list_refs(&self) -> Result<BTreeMap<String, Hash>, RemoteError>;

    /// Fetch chunks by hash. Implementations return every requested chunk
    /// or fail; callers verify content hashes on receipt.
    async fn get_chunks(&self, hashes: &[Hash]) -> Result<Vec<Chunk>, RemoteError>;

    /// The subset of `hashes` the remote already has.
    async fn has_chunks(&self, hashes: &[Hash]) -> Result<HashSet<Hash>, RemoteError>;

    /// Upload chunks. Durable once the call returns.
    async fn put_chunks(&self, chunks: Vec<Chunk>) -> Result<(), RemoteError>;

    /// CAS a ref on the remote. `expected = None` forces the update.
    async fn cas_ref(
        &self,
        path: &str,
        expected: Option<Hash>,
        new: Hash,
    ) -> Result<(), RemoteError>;

    /// The remote's default branch, when it advertises one.
    async fn default_branch(&self) -> Result<Option<String>, RemoteError>;
}

/// Transport over another database directory on the local filesystem.
/// Accepts a plain path or a `file://` URL.
pub struct FileTransport {
    db_dir: PathBuf,
    store: Arc<FsStore>,
}

impl FileTransport {
    pub fn open(url: &str) -> Result<FileTransport, RemoteError> {
        let path = url.strip_prefix("file://").unwrap_or(url);
        let db_dir = Path::new(path).to_path_buf();
        let noms = db_dir.join(".dolt").join("noms");
        let store = FsStore::open(&noms).map_err(|e| match e {
            StoreError::NoManifest(_) => RemoteError::UnsupportedUrl(url.to_string()),
            other => RemoteError::Store(other),
        })?;
        Ok(FileTransport {
            db_dir,
            store: Arc::new(store),
        })
    }

    /// Whether a URL names something this transport can serve.
    pub fn handles(url: &str) -> bool {
        url.starts_with("file://") || !url.contains("://")
    }
}

#[async_trait]
impl ChunkTransport for FileTransport {
    async fn list_refs(&self) -> Result<BTreeMap<String, Hash>, RemoteError> {
        let manifest = self.store.read_manifest()?;
        Ok(manifest
            .refs
            .iter()
            .filter(|(_, entry)| matches!(entry.kind, RefKind::Branch | RefKind::Tag))
            .map(|(path, entry)| (path.clone(), entry.hash))
            .collect())
    }

    async fn get_chunks(&self, hashes: &[Hash]) -> Result<Vec<Chunk>, RemoteError> {
        let mut chunks = Vec::with_capacity(hashes.len());
        for hash in hashes {
            match self.store.try_get(hash)? {
                Some(chunk) => chunks.push(chunk),
                None => {
                    return Err(RemoteError::Transport(format!(
                        "remote is missing chunk {hash}"
                    )))
                }
            }
        }
        Ok(chunks)
    }

    async fn has_chunks(&self, hashes: &[Hash]) -> Result<HashSet<Hash>, RemoteError> {
        Ok(self.store.has_many(hashes)?)
    }

    async fn put_chunks(&self, chunks: Vec<Chunk>) -> Result<(), RemoteError> {
        for chunk in chunks {
            self.store.put(chunk)?;
        }
        self.store.flush()?;
        Ok(())
    }

    async fn cas_ref(
        &self,
        path: &str,
        expected: Option<Hash>,
        new: Hash,
    ) -> Result<(), RemoteError> {
        let kind = crate::refs::RefName::parse(path)
            .map(|r| r.kind)
            .unwrap_or(RefKind::Branch);
        loop {
            let current = self.store.read_manifest()?;
            let mut next = current.clone();
            let actual = next.refs.get(path).map(|entry| entry.hash);
            if let Some(expected) = expected {
                if actual != Some(expected) {
                    return Err(RemoteError::NonFastForward(path.to_string()));
                }
            }
            next.refs
                .insert(path.to_string(), RefEntry { kind, hash: new });
            match self.store.write_manifest(current.generation, next) {
                Ok(_) => return Ok(()),
                Err(StoreError::Optimistic) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn default_branch(&self) -> Result<Option<String>, RemoteError> {
        // The remote's repo_state names its checked-out branch.
        let state_path = self.db_dir.join(".dolt").join("repo_state.json");
        if let Ok(bytes) = std::fs::read(&state_path) {
            if let Ok(state) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                if let Some(head) = state.get("head").and_then(|v| v.as_str()) {
                    return Ok(Some(head.to_string()));
                }
            }
        }
        // Fall back to `main`, then to any branch.
        let refs = self.list_refs().await?;
        if refs.contains_key("refs/heads/main") {
            return Ok(Some("main".to_string()));
        }
        Ok(refs
            .keys()
            .find_map(|path| path.strip_prefix("refs/heads/").map(str::to_string)))
    }
}
