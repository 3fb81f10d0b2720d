//! The manifest: the single mutable point of a database.
//!
//! A small JSON file naming the live table files and the current ref set.
//! Readers take snapshots; writers update it by compare-and-set against the
//! generation counter, serialized by an OS lock file plus an in-process
//! mutex, and land the new contents with a write-temp + atomic rename.

use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use super::StoreError;

pub const MANIFEST_FILE: &str = "manifest";
const LOCK_FILE: &str = "LOCK";

/// Manifest format version.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;
/// Binary-format marker for the chunk payload encoding.
pub const NBF_MARKER: &str = "tnbf/1";

const CAS_ATTEMPTS: u32 = 8;

/// Kind of a named ref.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefKind {
    Branch,
    Tag,
    WorkingSet,
    RemoteTracking,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefEntry {
    pub kind: RefKind,
    pub hash: Hash,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableFileEntry {
    /// Hex identity of the table file (also its file name).
    pub id: String,
    /// Number of chunks recorded in the file.
    pub chunk_count: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    /// Noms-binary-format marker of the chunk payload encoding.
    pub nbf: String,
    /// Monotonic counter; every successful write increments it.
    pub generation: u64,
    /// Ordered list of live table files, oldest first.
    pub table_files: Vec<TableFileEntry>,
    /// Full ref path (e.g. `refs/heads/main`) to its target.
    pub refs: BTreeMap<String, RefEntry>,
}

impl Manifest {
    pub fn empty() -> Manifest {
        Manifest {
            format_version: MANIFEST_FORMAT_VERSION,
            nbf: NBF_MARKER.to_string(),
            generation: 0,
            table_files: Vec::new(),
            refs: BTreeMap::new(),
        }
    }
}

/// On-disk manifest with CAS semantics.
pub struct ManifestFile {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl ManifestFile {
    pub fn new(dir: &Path) -> ManifestFile {
        ManifestFile {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Create the manifest file for a fresh database. Fails if one exists.
    pub fn create(&self) -> Result<Manifest, StoreError> {
        let path = self.manifest_path();
        if path.exists() {
            return Err(StoreError::AlreadyInitialized(self.dir.clone()));
        }
        let manifest = Manifest::empty();
        self.write_file(&manifest)?;
        Ok(manifest)
    }

    /// Snapshot the current manifest. Readers never see torn updates
    /// because writes land by rename.
    pub fn load(&self) -> Result<Manifest, StoreError> {
        let bytes = fs::read(self.manifest_path()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NoManifest(self.dir.clone())
            } else {
                StoreError::Io(e)
            }
        })?;
        let manifest: Manifest =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::CorruptManifest(e.to_string()))?;
        if manifest.format_version != MANIFEST_FORMAT_VERSION {
            return Err(StoreError::CorruptManifest(format!(
                "unsupported manifest format version {}",
                manifest.format_version
            )));
        }
        Ok(manifest)
    }

    /// Compare-and-set: replace the manifest iff its generation still equals
    /// `expected_generation`. Returns the stored manifest (with the bumped
    /// generation) or `StoreError::Optimistic` when the caller lost the race.
    pub fn swap(&self, expected_generation: u64, mut new: Manifest) -> Result<Manifest, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _file_lock = FileLock::acquire(&self.dir.join(LOCK_FILE))?;

        let current = self.load()?;
        if current.generation != expected_generation {
            return Err(StoreError::Optimistic);
        }
        new.generation = expected_generation + 1;
        self.write_file(&new)?;
        tracing::debug!(generation = new.generation, "manifest updated");
        Ok(new)
    }

    fn write_file(&self, manifest: &Manifest) -> Result<(), StoreError> {
        let path = self.manifest_path();
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(manifest).expect("manifest serializes"))?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// An OS-level lock file. Held for the duration of a manifest swap and
/// removed on drop. Acquisition retries with bounded exponential backoff.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<FileLock, StoreError> {
        let mut delay = Duration::from_millis(1);
        for attempt in 0..CAS_ATTEMPTS {
            match fs::OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => {
                    return Ok(FileLock {
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if attempt + 1 == CAS_ATTEMPTS {
                        break;
                    }
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                Err(e) => return Err(StoreError::Io(e)),
            }
        }
        Err(StoreError::ManifestLocked(path.to_path_buf()))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_load_swap() {
        let dir = tempdir().unwrap();
        let mf = ManifestFile::new(dir.path());
        let initial = mf.create().unwrap();
        assert_eq!(initial.generation, 0);

        let mut next = mf.load().unwrap();
        next.refs.insert(
            "refs/heads/main".to_string(),
            RefEntry {
                kind: RefKind::Branch,
                hash: Hash::of(b"commit"),
            },
        );
        let stored = mf.swap(0, next).unwrap();
        assert_eq!(stored.generation, 1);

        let reread = mf.load().unwrap();
        assert_eq!(reread, stored);
    }

    #[test]
    fn swap_detects_stale_generation() {
        let dir = tempdir().unwrap();
        let mf = ManifestFile::new(dir.path());
        mf.create().unwrap();

        let snapshot = mf.load().unwrap();
        mf.swap(0, snapshot.clone()).unwrap();

        // A second writer holding the old snapshot loses.
        match mf.swap(0, snapshot) {
            Err(StoreError::Optimistic) => {}
            other => panic!("expected Optimistic, got {:?}", other.map(|m| m.generation)),
        }
    }

    #[test]
    fn double_create_fails() {
        let dir = tempdir().unwrap();
        let mf = ManifestFile::new(dir.path());
        mf.create().unwrap();
        assert!(matches!(
            mf.create(),
            Err(StoreError::AlreadyInitialized(_))
        ));
    }
}
