//! The per-directory database shell.
//!
//! Owns the store under `.dolt/noms`, the ref manager, the
//! `repo_state.json` sidecar (checked-out branch, remotes), and the
//! registry that gives each branch's working set to at most one session.

use crate::cancel::Cancel;
use crate::hash::Hash;
use crate::model::{Commit, ModelError, RootValue, Signature, TagMeta, WorkingSet};
use crate::refs::{validate_ref_name, RefError, RefManager, RefName};
use crate::remote::{self, FetchOptions, Remote, RemoteError};
use crate::store::{ChunkStore, FsStore, RefKind, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

const DOLT_DIR: &str = ".dolt";
const NOMS_DIR: &str = "noms";
const STATE_FILE: &str = "repo_state.json";

pub const DEFAULT_BRANCH: &str = "main";
pub const INITIAL_COMMIT_MESSAGE: &str = "initialize data repository";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Ref(#[from] RefError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("corrupt repository state: {0}")]
    CorruptState(String),
    #[error("branch '{0}' is checked out by another session")]
    BranchInUse(String),
    #[error("unknown revision: '{0}'")]
    UnknownRevision(String),
    #[error("remote '{0}' already exists")]
    RemoteExists(String),
}

/// `repo_state.json`: the active branch and configured remotes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepoState {
    pub head: String,
    #[serde(default)]
    pub remotes: BTreeMap<String, Remote>,
}

pub struct Database {
    dir: PathBuf,
    store: Arc<FsStore>,
    refs: RefManager,
    state: Mutex<RepoState>,
    checkouts: Mutex<HashSet<String>>,
    feature_version: u32,
}

impl Database {
    /// Initialize a fresh database: empty root, initial commit on the
    /// default branch, clean working set.
    pub fn init(dir: &Path, identity: &Signature) -> Result<Database, DbError> {
        Self::init_with_feature_version(dir, identity, crate::FEATURE_VERSION)
    }

    pub fn init_with_feature_version(
        dir: &Path,
        identity: &Signature,
        feature_version: u32,
    ) -> Result<Database, DbError> {
        let store = Arc::new(FsStore::create(&dir.join(DOLT_DIR).join(NOMS_DIR))?);
        let chunk_store: Arc<dyn ChunkStore> = store.clone();
        let refs = RefManager::new(chunk_store);

        let root = RootValue::new(feature_version).store(&*store)?;
        let commit = Commit::build(
            &*store,
            root,
            Vec::new(),
            identity.clone(),
            identity.clone(),
            INITIAL_COMMIT_MESSAGE.to_string(),
        )?
        .store(&*store)?;
        store.flush()?;

        refs.create(&RefName::branch(DEFAULT_BRANCH), commit)?;
        let ws = WorkingSet::clean(root).store(&*store)?;
        store.flush()?;
        refs.force_update(&RefName::working_set(DEFAULT_BRANCH), ws)?;

        let db = Database {
            dir: dir.to_path_buf(),
            store,
            refs,
            state: Mutex::new(RepoState {
                head: DEFAULT_BRANCH.to_string(),
                remotes: BTreeMap::new(),
            }),
            checkouts: Mutex::new(HashSet::new()),
            feature_version,
        };
        db.save_state()?;
        tracing::info!(dir = %dir.display(), "initialized database");
        Ok(db)
    }

    pub fn open(dir: &Path) -> Result<Database, DbError> {
        Self::open_with_feature_version(dir, crate::FEATURE_VERSION)
    }

    pub fn open_with_feature_version(
        dir: &Path,
        feature_version: u32,
    ) -> Result<Database, DbError> {
        let store = Arc::new(FsStore::open(&dir.join(DOLT_DIR).join(NOMS_DIR))?);
        let chunk_store: Arc<dyn ChunkStore> = store.clone();
        let refs = RefManager::new(chunk_store);

        let state_path = dir.join(DOLT_DIR).join(STATE_FILE);
        let state: RepoState = match std::fs::read(&state_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| DbError::CorruptState(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RepoState {
                head: DEFAULT_BRANCH.to_string(),
                remotes: BTreeMap::new(),
            },
            Err(e) => return Err(e.into()),
        };

        Ok(Database {
            dir: dir.to_path_buf(),
            store,
            refs,
            state: Mutex::new(state),
            checkouts: Mutex::new(HashSet::new()),
            feature_version,
        })
    }

    /// Clone: fetch a remote into a fresh store, then create a local
    /// branch tracking the remote's default branch.
    pub async fn clone(
        dir: &Path,
        remote_name: &str,
        url: &str,
        feature_version: u32,
        cancel: &Cancel,
    ) -> Result<Database, DbError> {
        let store = Arc::new(FsStore::create(&dir.join(DOLT_DIR).join(NOMS_DIR))?);
        let chunk_store: Arc<dyn ChunkStore> = store.clone();
        let refs = RefManager::new(chunk_store.clone());

        let remote = Remote::new(remote_name, url);
        let transport = remote.transport()?;
        remote::fetch(
            &chunk_store,
            &refs,
            feature_version,
            &remote,
            &*transport,
            &[],
            FetchOptions::default(),
            cancel,
        )
        .await?;

        let default_branch = transport
            .default_branch()
            .await?
            .ok_or_else(|| RemoteError::Transport("remote has no branches".to_string()))?;
        let head = refs.resolve(&RefName::remote_tracking(remote_name, &default_branch))?;
        refs.create(&RefName::branch(&default_branch), head)?;
        let root = Commit::load(&*store, &head)?.root;
        let ws = WorkingSet::clean(root).store(&*store)?;
        store.flush()?;
        refs.force_update(&RefName::working_set(&default_branch), ws)?;

        let mut remotes = BTreeMap::new();
        remotes.insert(remote_name.to_string(), remote);
        let db = Database {
            dir: dir.to_path_buf(),
            store,
            refs,
            state: Mutex::new(RepoState {
                head: default_branch,
                remotes,
            }),
            checkouts: Mutex::new(HashSet::new()),
            feature_version,
        };
        db.save_state()?;
        Ok(db)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn store(&self) -> Arc<dyn ChunkStore> {
        self.store.clone()
    }

    pub fn fs_store(&self) -> &FsStore {
        &self.store
    }

    pub fn refs(&self) -> &RefManager {
        &self.refs
    }

    pub fn feature_version(&self) -> u32 {
        self.feature_version
    }

    fn save_state(&self) -> Result<(), DbError> {
        let state = self.state.lock().unwrap().clone();
        let path = self.dir.join(DOLT_DIR).join(STATE_FILE);
        let tmp = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(&state).expect("state serializes"))?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Branches, tags, revisions
    // ------------------------------------------------------------------

    /// The branch named in `repo_state.json`.
    pub fn current_branch(&self) -> String {
        self.state.lock().unwrap().head.clone()
    }

    pub fn set_current_branch(&self, branch: &str) -> Result<(), DbError> {
        self.refs.resolve(&RefName::branch(branch))?;
        self.state.lock().unwrap().head = branch.to_string();
        self.save_state()
    }

    pub fn branches(&self) -> Result<Vec<(String, Hash)>, DbError> {
        Ok(self
            .refs
            .list(Some(RefKind::Branch))?
            .into_iter()
            .map(|(name, hash)| (name.name, hash))
            .collect())
    }

    pub fn create_branch(&self, name: &str, at: Hash) -> Result<(), DbError> {
        validate_ref_name(name)?;
        self.refs.create(&RefName::branch(name), at)?;
        let root = Commit::load(&*self.store, &at)?.root;
        let ws = WorkingSet::clean(root).store(&*self.store)?;
        self.store.flush()?;
        self.refs.force_update(&RefName::working_set(name), ws)?;
        Ok(())
    }

    pub fn delete_branch(&self, name: &str) -> Result<(), DbError> {
        if self.checkouts.lock().unwrap().contains(name) || self.current_branch() == name {
            return Err(DbError::BranchInUse(name.to_string()));
        }
        self.refs.delete(&RefName::branch(name))?;
        Ok(())
    }

    pub fn create_tag(
        &self,
        name: &str,
        commit: Hash,
        message: &str,
        tagger: Signature,
    ) -> Result<(), DbError> {
        validate_ref_name(name)?;
        let meta = TagMeta {
            commit,
            name: name.to_string(),
            message: message.to_string(),
            tagger,
        };
        let hash = meta.store(&*self.store)?;
        self.store.flush()?;
        self.refs.create(&RefName::tag(name), hash)?;
        Ok(())
    }

    pub fn delete_tag(&self, name: &str) -> Result<(), DbError> {
        self.refs.delete(&RefName::tag(name))
            .map_err(DbError::from)
    }

    /// Resolve a revision spec: branch, tag, remote-tracking ref, full
    /// ref path, or commit hash. Returns a commit hash.
    pub fn resolve_revision(&self, spec: &str) -> Result<Hash, DbError> {
        if let Some(hash) = self.refs.try_resolve(&RefName::branch(spec))? {
            return Ok(hash);
        }
        if let Some(hash) = self.refs.try_resolve(&RefName::tag(spec))? {
            let meta = TagMeta::load(&*self.store, &hash)?;
            return Ok(meta.commit);
        }
        let tracking = spec.strip_prefix("remotes/").unwrap_or(spec);
        if tracking.contains('/') {
            let name = RefName {
                kind: RefKind::RemoteTracking,
                name: tracking.to_string(),
            };
            if let Some(hash) = self.refs.try_resolve(&name)? {
                return Ok(hash);
            }
        }
        if let Some(name) = RefName::parse(spec) {
            if let Some(hash) = self.refs.try_resolve(&name)? {
                return match name.kind {
                    RefKind::Tag => Ok(TagMeta::load(&*self.store, &hash)?.commit),
                    _ => Ok(hash),
                };
            }
        }
        if let Some(hash) = Hash::from_hex(spec) {
            if self.store.has(&hash)? {
                return Ok(hash);
            }
        }
        Err(DbError::UnknownRevision(spec.to_string()))
    }

    pub fn head_commit(&self, branch: &str) -> Result<(Hash, Commit), DbError> {
        let hash = self.refs.resolve(&RefName::branch(branch))?;
        Ok((hash, Commit::load(&*self.store, &hash)?))
    }

    // ------------------------------------------------------------------
    // Working sets
    // ------------------------------------------------------------------

    /// The branch's working set; a clean one over HEAD when none is
    /// recorded yet.
    pub fn working_set(&self, branch: &str) -> Result<WorkingSet, DbError> {
        match self.refs.try_resolve(&RefName::working_set(branch))? {
            Some(hash) => Ok(WorkingSet::load(&*self.store, &hash)?),
            None => {
                let (_, commit) = self.head_commit(branch)?;
                Ok(WorkingSet::clean(commit.root))
            }
        }
    }

    pub fn update_working_set(&self, branch: &str, ws: &WorkingSet) -> Result<(), DbError> {
        let hash = ws.store(&*self.store)?;
        self.store.flush()?;
        self.refs.force_update(&RefName::working_set(branch), hash)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commits
    // ------------------------------------------------------------------

    /// Create a commit on `branch` whose first parent must still be the
    /// branch head (CAS). `extra_parent` makes it a merge commit.
    #[allow(clippy::too_many_arguments)]
    pub fn create_commit(
        &self,
        branch: &str,
        expected_head: Hash,
        root: Hash,
        extra_parent: Option<Hash>,
        author: Signature,
        committer: Signature,
        message: &str,
    ) -> Result<Hash, DbError> {
        let mut parents = vec![expected_head];
        parents.extend(extra_parent);
        let commit = Commit::build(
            &*self.store,
            root,
            parents,
            author,
            committer,
            message.to_string(),
        )?;
        let hash = commit.store(&*self.store)?;
        // Flush + ref CAS is the single atomic commit point.
        self.store.flush()?;
        self.refs
            .update(&RefName::branch(branch), expected_head, hash)?;
        tracing::info!(branch, commit = %hash, "created commit");
        Ok(hash)
    }

    // ------------------------------------------------------------------
    // Checkout registry
    // ------------------------------------------------------------------

    /// Claim a branch's working set for one session. A second claim of
    /// the same branch is refused.
    pub fn acquire_branch(&self, branch: &str) -> Result<(), DbError> {
        let mut checkouts = self.checkouts.lock().unwrap();
        if !checkouts.insert(branch.to_string()) {
            return Err(DbError::BranchInUse(branch.to_string()));
        }
        Ok(())
    }

    pub fn release_branch(&self, branch: &str) {
        self.checkouts.lock().unwrap().remove(branch);
    }

    // ------------------------------------------------------------------
    // Remotes
    // ------------------------------------------------------------------

    pub fn remotes(&self) -> Vec<Remote> {
        self.state.lock().unwrap().remotes.values().cloned().collect()
    }

    pub fn remote(&self, name: &str) -> Result<Remote, DbError> {
        self.state
            .lock()
            .unwrap()
            .remotes
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::Remote(RemoteError::UnknownRemote(name.to_string())))
    }

    pub fn add_remote(&self, remote: Remote) -> Result<(), DbError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.remotes.contains_key(&remote.name) {
                return Err(DbError::RemoteExists(remote.name));
            }
            state.remotes.insert(remote.name.clone(), remote);
        }
        self.save_state()
    }

    pub fn remove_remote(&self, name: &str) -> Result<(), DbError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.remotes.remove(name).is_none() {
                return Err(DbError::Remote(RemoteError::UnknownRemote(name.to_string())));
            }
        }
        self.save_state()?;
        // Drop the remote's tracking refs with it.
        let prefix = format!("{name}/");
        for (ref_name, _) in self.refs.list(Some(RefKind::RemoteTracking))? {
            if ref_name.name.starts_with(&prefix) {
                self.refs.delete(&ref_name)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    pub fn gc(&self, cancel: &Cancel) -> Result<crate::store::gc::GcStats, DbError> {
        Ok(self.store.gc(cancel)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn sig() -> Signature {
        Signature::new("Ada", "ada@example.com", Utc::now())
    }

    #[test]
    fn init_creates_initial_commit_and_working_set() {
        let dir = tempdir().unwrap();
        let db = Database::init(dir.path(), &sig()).unwrap();

        let (head, commit) = db.head_commit(DEFAULT_BRANCH).unwrap();
        assert_eq!(commit.height, 0);
        assert!(commit.parents.is_empty());
        assert_eq!(db.resolve_revision("main").unwrap(), head);

        let ws = db.working_set(DEFAULT_BRANCH).unwrap();
        assert_eq!(ws.working, commit.root);
        assert_eq!(ws.staged, commit.root);
        assert!(!ws.is_merging());
    }

    #[test]
    fn reopen_preserves_state() {
        let dir = tempdir().unwrap();
        let head = {
            let db = Database::init(dir.path(), &sig()).unwrap();
            db.head_commit(DEFAULT_BRANCH).unwrap().0
        };
        let db = Database::open(dir.path()).unwrap();
        assert_eq!(db.current_branch(), DEFAULT_BRANCH);
        assert_eq!(db.head_commit(DEFAULT_BRANCH).unwrap().0, head);
    }

    #[test]
    fn branch_lifecycle() {
        let dir = tempdir().unwrap();
        let db = Database::init(dir.path(), &sig()).unwrap();
        let (head, _) = db.head_commit(DEFAULT_BRANCH).unwrap();

        db.create_branch("feature", head).unwrap();
        assert_eq!(db.resolve_revision("feature").unwrap(), head);
        assert_eq!(db.branches().unwrap().len(), 2);

        // A checked-out branch cannot be deleted.
        db.acquire_branch("feature").unwrap();
        assert!(matches!(
            db.delete_branch("feature"),
            Err(DbError::BranchInUse(_))
        ));
        db.release_branch("feature");
        db.delete_branch("feature").unwrap();
        assert!(db
            .refs()
            .try_resolve(&RefName::working_set("feature"))
            .unwrap()
            .is_none());

        // The current branch is always in use.
        assert!(matches!(
            db.delete_branch(DEFAULT_BRANCH),
            Err(DbError::BranchInUse(_))
        ));
    }

    #[test]
    fn second_checkout_of_same_branch_is_refused() {
        let dir = tempdir().unwrap();
        let db = Database::init(dir.path(), &sig()).unwrap();
        db.acquire_branch(DEFAULT_BRANCH).unwrap();
        assert!(matches!(
            db.acquire_branch(DEFAULT_BRANCH),
            Err(DbError::BranchInUse(_))
        ));
        db.release_branch(DEFAULT_BRANCH);
        db.acquire_branch(DEFAULT_BRANCH).unwrap();
    }

    #[test]
    fn tags_resolve_to_their_commit() {
        let dir = tempdir().unwrap();
        let db = Database::init(dir.path(), &sig()).unwrap();
        let (head, _) = db.head_commit(DEFAULT_BRANCH).unwrap();

        db.create_tag("v1", head, "first release", sig()).unwrap();
        assert_eq!(db.resolve_revision("v1").unwrap(), head);
        db.delete_tag("v1").unwrap();
        assert!(db.resolve_revision("v1").is_err());
    }

    #[test]
    fn commit_cas_detects_stale_head() {
        let dir = tempdir().unwrap();
        let db = Database::init(dir.path(), &sig()).unwrap();
        let (head, commit) = db.head_commit(DEFAULT_BRANCH).unwrap();

        let first = db
            .create_commit(
                DEFAULT_BRANCH,
                head,
                commit.root,
                None,
                sig(),
                sig(),
                "advance",
            )
            .unwrap();
        assert_ne!(first, head);

        // A second writer still holding the old head loses.
        let err = db
            .create_commit(
                DEFAULT_BRANCH,
                head,
                commit.root,
                None,
                sig(),
                sig(),
                "stale",
            )
            .unwrap_err();
        assert!(matches!(err, DbError::Ref(RefError::Stale { .. })));
    }

    #[test]
    fn remotes_persist() {
        let dir = tempdir().unwrap();
        {
            let db = Database::init(dir.path(), &sig()).unwrap();
            db.add_remote(Remote::new("origin", "file:///tmp/elsewhere"))
                .unwrap();
            assert!(matches!(
                db.add_remote(Remote::new("origin", "file:///tmp/other")),
                Err(DbError::RemoteExists(_))
            ));
        }
        let db = Database::open(dir.path()).unwrap();
        assert_eq!(db.remotes().len(), 1);
        assert_eq!(db.remote("origin").unwrap().url, "file:///tmp/elsewhere");
        db.remove_remote("origin").unwrap();
        assert!(db.remote("origin").is_err());
    }

    #[tokio::test]
    async fn clone_tracks_the_default_branch() {
        let origin_dir = tempdir().unwrap();
        let origin = Database::init(origin_dir.path(), &sig()).unwrap();
        let origin_head = origin.head_commit(DEFAULT_BRANCH).unwrap().0;

        let clone_dir = tempdir().unwrap();
        let db = Database::clone(
            clone_dir.path(),
            "origin",
            origin_dir.path().to_str().unwrap(),
            crate::FEATURE_VERSION,
            &Cancel::new(),
        )
        .await
        .unwrap();

        assert_eq!(db.current_branch(), DEFAULT_BRANCH);
        assert_eq!(db.head_commit(DEFAULT_BRANCH).unwrap().0, origin_head);
        assert_eq!(db.remotes().len(), 1);
        let ws = db.working_set(DEFAULT_BRANCH).unwrap();
        let root = Commit::load(&*db.store(), &origin_head).unwrap().root;
        assert_eq!(ws.working, root);
    }
}
