//! The ref manager: named roots updated by guarded CAS through the
//! manifest.
//!
//! Ref updates race only at the manifest swap; losers re-read the new
//! manifest, re-verify their expectation, and either retry or report
//! `Stale`.

use crate::hash::Hash;
use crate::store::{ChunkStore, RefEntry, RefKind, StoreError};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RefError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown ref: {0}")]
    UnknownRef(String),
    #[error("ref {name} moved concurrently (expected {expected}, found {actual})")]
    Stale {
        name: String,
        expected: Hash,
        actual: Hash,
    },
    #[error("ref already exists: {0}")]
    AlreadyExists(String),
    #[error("ref is protected: {0}")]
    Protected(String),
    #[error("invalid ref name: {0}")]
    InvalidName(String),
}

/// A typed ref name. `path()` renders the full on-manifest form.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RefName {
    pub kind: RefKind,
    /// Short name: branch/tag name, or `<remote>/<branch>` for
    /// remote-tracking refs.
    pub name: String,
}

impl RefName {
    pub fn branch(name: &str) -> RefName {
        RefName {
            kind: RefKind::Branch,
            name: name.to_string(),
        }
    }

    pub fn tag(name: &str) -> RefName {
        RefName {
            kind: RefKind::Tag,
            name: name.to_string(),
        }
    }

    pub fn working_set(branch: &str) -> RefName {
        RefName {
            kind: RefKind::WorkingSet,
            name: branch.to_string(),
        }
    }

    pub fn remote_tracking(remote: &str, branch: &str) -> RefName {
        RefName {
            kind: RefKind::RemoteTracking,
            name: format!("{remote}/{branch}"),
        }
    }

    pub fn path(&self) -> String {
        match self.kind {
            RefKind::Branch => format!("refs/heads/{}", self.name),
            RefKind::Tag => format!("refs/tags/{}", self.name),
            RefKind::WorkingSet => format!("refs/working/{}", self.name),
            RefKind::RemoteTracking => format!("refs/remotes/{}", self.name),
        }
    }

    pub fn parse(path: &str) -> Option<RefName> {
        let (kind, rest) = if let Some(rest) = path.strip_prefix("refs/heads/") {
            (RefKind::Branch, rest)
        } else if let Some(rest) = path.strip_prefix("refs/tags/") {
            (RefKind::Tag, rest)
        } else if let Some(rest) = path.strip_prefix("refs/working/") {
            (RefKind::WorkingSet, rest)
        } else if let Some(rest) = path.strip_prefix("refs/remotes/") {
            (RefKind::RemoteTracking, rest)
        } else {
            return None;
        };
        if rest.is_empty() {
            return None;
        }
        Some(RefName {
            kind,
            name: rest.to_string(),
        })
    }
}

impl std::fmt::Display for RefName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path())
    }
}

/// Validate a user-supplied branch or tag name.
pub fn validate_ref_name(name: &str) -> Result<(), RefError> {
    let ok = !name.is_empty()
        && !name.starts_with('-')
        && !name.ends_with('/')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.'));
    if ok {
        Ok(())
    } else {
        Err(RefError::InvalidName(name.to_string()))
    }
}

pub struct RefManager {
    store: Arc<dyn ChunkStore>,
}

impl RefManager {
    pub fn new(store: Arc<dyn ChunkStore>) -> RefManager {
        RefManager { store }
    }

    pub fn try_resolve(&self, name: &RefName) -> Result<Option<Hash>, RefError> {
        let manifest = self.store.read_manifest()?;
        Ok(manifest.refs.get(&name.path()).map(|entry| entry.hash))
    }

    pub fn resolve(&self, name: &RefName) -> Result<Hash, RefError> {
        self.try_resolve(name)?
            .ok_or_else(|| RefError::UnknownRef(name.path()))
    }

    /// All refs, optionally filtered by kind, in path order.
    pub fn list(&self, kind: Option<RefKind>) -> Result<Vec<(RefName, Hash)>, RefError> {
        let manifest = self.store.read_manifest()?;
        Ok(manifest
            .refs
            .iter()
            .filter(|(_, entry)| kind.map_or(true, |k| entry.kind == k))
            .filter_map(|(path, entry)| RefName::parse(path).map(|r| (r, entry.hash)))
            .collect())
    }

    /// Run `mutate` against a copy of the ref set and CAS it in, retrying
    /// while other writers advance the manifest. `mutate` re-runs on every
    /// attempt, so its own expectations are re-verified after each race.
    fn transact<F>(&self, mutate: F) -> Result<(), RefError>
    where
        F: Fn(&mut BTreeMap<String, RefEntry>) -> Result<(), RefError>,
    {
        loop {
            let current = self.store.read_manifest()?;
            let mut next = current.clone();
            mutate(&mut next.refs)?;
            match self.store.write_manifest(current.generation, next) {
                Ok(_) => return Ok(()),
                Err(StoreError::Optimistic) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn create(&self, name: &RefName, hash: Hash) -> Result<(), RefError> {
        let path = name.path();
        let kind = name.kind;
        self.transact(move |refs| {
            if refs.contains_key(&path) {
                return Err(RefError::AlreadyExists(path.clone()));
            }
            refs.insert(path.clone(), RefEntry { kind, hash });
            Ok(())
        })
    }

    /// Guarded update: old-hash → new-hash CAS.
    pub fn update(&self, name: &RefName, expected: Hash, new: Hash) -> Result<(), RefError> {
        let path = name.path();
        let kind = name.kind;
        self.transact(move |refs| {
            let entry = refs
                .get_mut(&path)
                .ok_or_else(|| RefError::UnknownRef(path.clone()))?;
            if entry.hash != expected {
                return Err(RefError::Stale {
                    name: path.clone(),
                    expected,
                    actual: entry.hash,
                });
            }
            entry.kind = kind;
            entry.hash = new;
            Ok(())
        })
    }

    /// Unconditional update, creating the ref when absent. Working-set
    /// refs are always updated this way by their owning session.
    pub fn force_update(&self, name: &RefName, new: Hash) -> Result<(), RefError> {
        let path = name.path();
        let kind = name.kind;
        self.transact(move |refs| {
            refs.insert(path.clone(), RefEntry { kind, hash: new });
            Ok(())
        })
    }

    /// Delete a ref. The last branch of a database is protected; deleting
    /// a branch also deletes its working set.
    pub fn delete(&self, name: &RefName) -> Result<(), RefError> {
        let path = name.path();
        let kind = name.kind;
        let working_path = if kind == RefKind::Branch {
            Some(RefName::working_set(&name.name).path())
        } else {
            None
        };
        self.transact(move |refs| {
            if !refs.contains_key(&path) {
                return Err(RefError::UnknownRef(path.clone()));
            }
            if kind == RefKind::Branch {
                let branches = refs
                    .values()
                    .filter(|entry| entry.kind == RefKind::Branch)
                    .count();
                if branches <= 1 {
                    return Err(RefError::Protected(path.clone()));
                }
            }
            refs.remove(&path);
            if let Some(ws) = &working_path {
                refs.remove(ws);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> RefManager {
        RefManager::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn ref_name_paths() {
        assert_eq!(RefName::branch("main").path(), "refs/heads/main");
        assert_eq!(RefName::tag("v1").path(), "refs/tags/v1");
        assert_eq!(RefName::working_set("main").path(), "refs/working/main");
        assert_eq!(
            RefName::remote_tracking("origin", "main").path(),
            "refs/remotes/origin/main"
        );
        assert_eq!(
            RefName::parse("refs/remotes/origin/main"),
            Some(RefName::remote_tracking("origin", "main"))
        );
        assert_eq!(RefName::parse("heads/main"), None);
    }

    #[test]
    fn create_resolve_update() {
        let refs = manager();
        let main = RefName::branch("main");
        let first = Hash::of(b"c1");
        let second = Hash::of(b"c2");

        refs.create(&main, first).unwrap();
        assert!(matches!(
            refs.create(&main, first),
            Err(RefError::AlreadyExists(_))
        ));
        assert_eq!(refs.resolve(&main).unwrap(), first);

        refs.update(&main, first, second).unwrap();
        assert_eq!(refs.resolve(&main).unwrap(), second);

        // A writer still expecting `first` loses.
        assert!(matches!(
            refs.update(&main, first, Hash::of(b"c3")),
            Err(RefError::Stale { .. })
        ));
        assert!(matches!(
            refs.resolve(&RefName::branch("absent")),
            Err(RefError::UnknownRef(_))
        ));
    }

    #[test]
    fn delete_protects_last_branch() {
        let refs = manager();
        let main = RefName::branch("main");
        refs.create(&main, Hash::of(b"c1")).unwrap();
        assert!(matches!(refs.delete(&main), Err(RefError::Protected(_))));

        let feature = RefName::branch("feature");
        refs.create(&feature, Hash::of(b"c2")).unwrap();
        refs.force_update(&RefName::working_set("feature"), Hash::of(b"ws"))
            .unwrap();
        refs.delete(&feature).unwrap();
        // The branch's working set went with it.
        assert_eq!(
            refs.try_resolve(&RefName::working_set("feature")).unwrap(),
            None
        );
    }

    #[test]
    fn list_filters_by_kind() {
        let refs = manager();
        refs.create(&RefName::branch("main"), Hash::of(b"c")).unwrap();
        refs.create(&RefName::tag("v1"), Hash::of(b"t")).unwrap();
        assert_eq!(refs.list(Some(RefKind::Branch)).unwrap().len(), 1);
        assert_eq!(refs.list(None).unwrap().len(), 2);
    }

    #[test]
    fn name_validation() {
        assert!(validate_ref_name("feature/x-1").is_ok());
        assert!(validate_ref_name("").is_err());
        assert!(validate_ref_name("-flag").is_err());
        assert!(validate_ref_name("a..b").is_err());
        assert!(validate_ref_name("spa ce").is_err());
    }
}
