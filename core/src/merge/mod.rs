//! The three-way merge engine.
//!
//! Given two commits, finds the merge base (recursively building a
//! virtual base for criss-cross histories), merges schemas by column tag
//! and rows over the structural three-way diff, re-verifies constraints
//! against the merged root, and captures conflicts and violations in
//! per-table artifacts.

pub mod rows;
pub mod schema_merge;
pub mod violations;

use crate::cancel::Cancel;
use crate::hash::Hash;
use crate::model::{
    self, Commit, ConflictsRef, ModelError, RootValue, Schema, Table,
};
use crate::store::{ChunkStore, StoreError};
use crate::value::ValueError;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

pub use rows::{merge_table_rows, ConflictRow, RowMergeOutput};
pub use schema_merge::merge_schemas;
pub use violations::{
    verify_constraints, AcceptAllChecks, CheckEvaluator, ViolationKind, ViolationRow,
};

/// Depth bound for recursive virtual-base construction.
const MAX_BASE_RECURSION: u32 = 8;

#[derive(Error, Debug)]
pub enum MergeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error("schema conflict in table '{table}': {reason}")]
    SchemaConflict { table: String, reason: String },
    #[error("corrupt merge artifact: {0}")]
    CorruptArtifact(String),
    #[error("no common ancestor between {0} and {1}")]
    NoCommonAncestor(Hash, Hash),
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableMergeStats {
    pub table: String,
    pub adds: u64,
    pub modifications: u64,
    pub deletes: u64,
    pub conflicts: u64,
}

#[derive(Clone, Debug)]
pub struct RootMergeOutcome {
    pub root: Hash,
    pub conflicts: u64,
    pub violations: u64,
    pub stats: Vec<TableMergeStats>,
}

#[derive(Clone, Debug)]
pub enum MergeResult {
    /// Theirs is already reachable from ours; nothing to do.
    AlreadyUpToDate,
    /// Ours is an ancestor of theirs: the merge is a pointer move.
    FastForward { head: Hash, root: Hash },
    /// A real three-way merge happened.
    Merged {
        /// The merge base commit, when it was a single real commit.
        base: Option<Hash>,
        outcome: RootMergeOutcome,
    },
}

/// Merge `theirs` into `ours` (both commit hashes).
pub fn merge_commits(
    store: &Arc<dyn ChunkStore>,
    feature_version: u32,
    ours: &Hash,
    theirs: &Hash,
    cancel: &Cancel,
    checks: &dyn CheckEvaluator,
) -> Result<MergeResult, MergeError> {
    if model::is_ancestor(&**store, theirs, ours)? {
        return Ok(MergeResult::AlreadyUpToDate);
    }
    if model::is_ancestor(&**store, ours, theirs)? {
        let their_commit = Commit::load(&**store, theirs)?;
        return Ok(MergeResult::FastForward {
            head: *theirs,
            root: their_commit.root,
        });
    }

    let candidates = model::merge_base_candidates(&**store, ours, theirs)?;
    let (base_root, base_commit) = match candidates.as_slice() {
        [] => return Err(MergeError::NoCommonAncestor(*ours, *theirs)),
        [single] => (Commit::load(&**store, single)?.root, Some(*single)),
        _ => (
            virtual_base_root(store, feature_version, &candidates, cancel, checks, 0)?,
            None,
        ),
    };

    let our_commit = Commit::load(&**store, ours)?;
    let their_commit = Commit::load(&**store, theirs)?;
    let outcome = merge_roots(
        store,
        feature_version,
        &base_root,
        &our_commit.root,
        &their_commit.root,
        true,
        cancel,
        checks,
    )?;
    Ok(MergeResult::Merged {
        base: base_commit,
        outcome,
    })
}

/// Fold multiple merge-base candidates into a virtual base root
/// ("recursive" strategy). Divergent rows inside the virtual base resolve
/// to the first side; conflicts are not recorded at this level.
fn virtual_base_root(
    store: &Arc<dyn ChunkStore>,
    feature_version: u32,
    candidates: &[Hash],
    cancel: &Cancel,
    checks: &dyn CheckEvaluator,
    depth: u32,
) -> Result<Hash, MergeError> {
    let first = Commit::load(&**store, &candidates[0])?;
    if depth >= MAX_BASE_RECURSION {
        return Ok(first.root);
    }
    let mut current = candidates[0];
    let mut current_root = first.root;
    for other in &candidates[1..] {
        let inner = model::merge_base_candidates(&**store, &current, other)?;
        let inner_base_root = match inner.as_slice() {
            [] => return Err(MergeError::NoCommonAncestor(current, *other)),
            [single] => Commit::load(&**store, single)?.root,
            _ => virtual_base_root(store, feature_version, &inner, cancel, checks, depth + 1)?,
        };
        let other_root = Commit::load(&**store, other)?.root;
        let outcome = merge_roots(
            store,
            feature_version,
            &inner_base_root,
            &current_root,
            &other_root,
            false,
            cancel,
            checks,
        )?;
        current_root = outcome.root;
        current = *other;
    }
    Ok(current_root)
}

/// Three-way merge of two roots over a base root.
#[allow(clippy::too_many_arguments)]
pub fn merge_roots(
    store: &Arc<dyn ChunkStore>,
    feature_version: u32,
    base: &Hash,
    ours: &Hash,
    theirs: &Hash,
    record_conflicts: bool,
    cancel: &Cancel,
    checks: &dyn CheckEvaluator,
) -> Result<RootMergeOutcome, MergeError> {
    if ours == theirs {
        return Ok(RootMergeOutcome {
            root: *ours,
            conflicts: 0,
            violations: 0,
            stats: Vec::new(),
        });
    }

    let base_root = RootValue::load(&**store, base, feature_version)?;
    let our_root = RootValue::load(&**store, ours, feature_version)?;
    let their_root = RootValue::load(&**store, theirs, feature_version)?;

    let mut merged = RootValue::new(feature_version);
    merged.schemas = merge_maps(&base_root.schemas, &our_root.schemas, &their_root.schemas);
    merged.procedures = merge_maps(
        &base_root.procedures,
        &our_root.procedures,
        &their_root.procedures,
    );
    merged.foreign_keys = {
        let to_map = |fks: &[crate::model::ForeignKeyDef]| {
            fks.iter()
                .map(|fk| (fk.name.clone(), fk.clone()))
                .collect::<BTreeMap<_, _>>()
        };
        merge_maps(
            &to_map(&base_root.foreign_keys),
            &to_map(&our_root.foreign_keys),
            &to_map(&their_root.foreign_keys),
        )
        .into_values()
        .collect()
    };

    let mut names: Vec<String> = our_root.table_names();
    for name in their_root.table_names() {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names.sort();

    let mut stats = Vec::new();
    let mut conflicts = 0;
    for name in &names {
        if cancel.is_cancelled() {
            return Err(MergeError::Cancelled);
        }
        let b = base_root.tables.get(name).copied();
        let o = our_root.tables.get(name).copied();
        let t = their_root.tables.get(name).copied();

        let chosen: Option<Hash> = if o == t {
            o
        } else if o == b {
            t
        } else if t == b {
            o
        } else {
            match (o, t) {
                // Modify/drop at table granularity keeps the modified side.
                (Some(o), None) => Some(o),
                (None, Some(t)) => Some(t),
                (Some(our_hash), Some(their_hash)) => {
                    let (table_hash, table_stats) = merge_one_table(
                        store,
                        name,
                        b,
                        our_hash,
                        their_hash,
                        record_conflicts,
                    )?;
                    conflicts += table_stats.conflicts;
                    stats.push(table_stats);
                    Some(table_hash)
                }
                (None, None) => None,
            }
        };
        if let Some(hash) = chosen {
            merged.tables.insert(name.clone(), hash);
        }
    }

    let violations = verify_constraints(store, &mut merged, &names, checks)?;
    let root = merged.store(&**store)?;
    tracing::debug!(%root, conflicts, violations, "merged roots");
    Ok(RootMergeOutcome {
        root,
        conflicts,
        violations,
        stats,
    })
}

fn merge_one_table(
    store: &Arc<dyn ChunkStore>,
    name: &str,
    base: Option<Hash>,
    ours: Hash,
    theirs: Hash,
    record_conflicts: bool,
) -> Result<(Hash, TableMergeStats), MergeError> {
    let our_table = Table::load(&**store, &ours)?;
    let their_table = Table::load(&**store, &theirs)?;
    let base_table = base.map(|h| Table::load(&**store, &h)).transpose()?;

    let our_schema = our_table.load_schema(&**store)?;
    let their_schema = their_table.load_schema(&**store)?;

    let (base_schema, base_primary) = match &base_table {
        Some(table) => (table.load_schema(&**store)?, table.primary),
        // Added on both sides: no base rows, and the sides must agree on
        // the schema.
        None => {
            if our_schema != their_schema {
                return Err(MergeError::SchemaConflict {
                    table: name.to_string(),
                    reason: "table created differently on both sides".into(),
                });
            }
            (our_schema.clone(), None)
        }
    };

    let merged_schema = if base_table.is_some() {
        merge_schemas(name, &base_schema, &our_schema, &their_schema)?
    } else {
        our_schema.clone()
    };

    let rows = merge_table_rows(
        store.clone(),
        &merged_schema,
        (&base_schema, base_primary),
        (&our_schema, our_table.primary),
        (&their_schema, their_table.primary),
        record_conflicts,
    )?;

    let mut merged_table = Table::create(&**store, &merged_schema)?;
    merged_table.primary = rows.primary;
    merged_table.auto_increment = match (our_table.auto_increment, their_table.auto_increment) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    merged_table.rebuild_secondary_indexes(store.clone(), &merged_schema)?;
    if let Some(conflict_tree) = rows.conflicts {
        merged_table.conflicts = Some(ConflictsRef {
            base_schema: base_schema.store(&**store)?,
            ours_schema: our_schema.store(&**store)?,
            theirs_schema: their_schema.store(&**store)?,
            tree: conflict_tree,
        });
    }

    let hash = merged_table.store(&**store)?;
    Ok((
        hash,
        TableMergeStats {
            table: name.to_string(),
            adds: rows.adds,
            modifications: rows.modifications,
            deletes: rows.deletes,
            conflicts: rows.conflict_count,
        },
    ))
}

/// Three-way merge of keyed definitions. One-sided changes win; a
/// divergent double edit keeps ours.
fn merge_maps<K: Ord + Clone, V: Clone + PartialEq>(
    base: &BTreeMap<K, V>,
    ours: &BTreeMap<K, V>,
    theirs: &BTreeMap<K, V>,
) -> BTreeMap<K, V> {
    let mut keys: Vec<&K> = ours.keys().chain(theirs.keys()).collect();
    keys.sort();
    keys.dedup();

    let mut merged = BTreeMap::new();
    for key in keys {
        let b = base.get(key);
        let o = ours.get(key);
        let t = theirs.get(key);
        let winner = if o == t {
            o
        } else if o == b {
            t
        } else if t == b {
            o
        } else {
            o
        };
        if let Some(value) = winner {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}
