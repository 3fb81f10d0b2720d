//! Structural diff of Prolly trees.
//!
//! Two cursors walk the trees in key order; whenever both sit at the
//! start of leaves with equal hashes, the whole leaf is skipped on both
//! sides, so unchanged shared subranges cost one hash comparison instead
//! of an entry-by-entry walk.

use crate::hash::Hash;
use crate::store::{ChunkStore, StoreError};
use crate::value::codec::{compare_encoded, TupleKey};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::tree::TreeCursor;

/// One changed key between two trees.
#[derive(Clone, Debug, PartialEq)]
pub struct DiffEntry {
    pub key: Vec<u8>,
    /// Value in the `from` tree; `None` when the key was added.
    pub from: Option<Vec<u8>>,
    /// Value in the `to` tree; `None` when the key was removed.
    pub to: Option<Vec<u8>>,
}

/// Streaming diff iterator. Yields changed keys in key order.
pub struct TreeDiffer {
    from: TreeCursor,
    to: TreeCursor,
}

impl TreeDiffer {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        from_root: Option<Hash>,
        to_root: Option<Hash>,
    ) -> Result<TreeDiffer, StoreError> {
        // Identical roots diff to nothing; start both cursors exhausted.
        let (from_root, to_root) = if from_root == to_root {
            (None, None)
        } else {
            (from_root, to_root)
        };
        Ok(TreeDiffer {
            from: TreeCursor::start(store.clone(), from_root)?,
            to: TreeCursor::start(store, to_root)?,
        })
    }

    fn step(&mut self) -> Result<Option<DiffEntry>, StoreError> {
        loop {
            // Shared leaf: skip it wholesale on both sides.
            if self.from.at_leaf_start()
                && self.to.at_leaf_start()
                && self.from.current_leaf_hash() == self.to.current_leaf_hash()
            {
                self.from.skip_current_leaf()?;
                self.to.skip_current_leaf()?;
                continue;
            }

            let from_entry = self.from.peek_cloned();
            let to_entry = self.to.peek_cloned();
            match (from_entry, to_entry) {
                (None, None) => return Ok(None),
                (Some((key, value)), None) => {
                    self.from.advance()?;
                    return Ok(Some(DiffEntry {
                        key,
                        from: Some(value),
                        to: None,
                    }));
                }
                (None, Some((key, value))) => {
                    self.to.advance()?;
                    return Ok(Some(DiffEntry {
                        key,
                        from: None,
                        to: Some(value),
                    }));
                }
                (Some((from_key, from_value)), Some((to_key, to_value))) => {
                    match compare_encoded(&from_key, &to_key) {
                        Ordering::Less => {
                            self.from.advance()?;
                            return Ok(Some(DiffEntry {
                                key: from_key,
                                from: Some(from_value),
                                to: None,
                            }));
                        }
                        Ordering::Greater => {
                            self.to.advance()?;
                            return Ok(Some(DiffEntry {
                                key: to_key,
                                from: None,
                                to: Some(to_value),
                            }));
                        }
                        Ordering::Equal => {
                            self.from.advance()?;
                            self.to.advance()?;
                            if from_value != to_value {
                                return Ok(Some(DiffEntry {
                                    key: to_key,
                                    from: Some(from_value),
                                    to: Some(to_value),
                                }));
                            }
                        }
                    }
                }
            }
        }
    }
}

impl Iterator for TreeDiffer {
    type Item = Result<DiffEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}

/// Collect the full diff between two roots.
pub fn diff(
    store: Arc<dyn ChunkStore>,
    from_root: Option<Hash>,
    to_root: Option<Hash>,
) -> Result<Vec<DiffEntry>, StoreError> {
    TreeDiffer::new(store, from_root, to_root)?.collect()
}

/// One key in a three-way comparison.
#[derive(Clone, Debug)]
pub struct ThreeWayEntry {
    pub key: Vec<u8>,
    pub base: Option<Vec<u8>>,
    pub ours: Option<Vec<u8>>,
    pub theirs: Option<Vec<u8>>,
    pub ours_changed: bool,
    pub theirs_changed: bool,
}

/// Three-way diff: every key changed on either side relative to `base`,
/// with the value all three trees hold for it.
pub fn three_way_diff(
    store: Arc<dyn ChunkStore>,
    base: Option<Hash>,
    ours: Option<Hash>,
    theirs: Option<Hash>,
) -> Result<Vec<ThreeWayEntry>, StoreError> {
    let our_diff = diff(store.clone(), base, ours)?;
    let their_diff = diff(store, base, theirs)?;

    let mut merged: BTreeMap<TupleKey, ThreeWayEntry> = BTreeMap::new();
    for entry in our_diff {
        merged.insert(
            TupleKey(entry.key.clone()),
            ThreeWayEntry {
                key: entry.key,
                base: entry.from.clone(),
                ours: entry.to,
                // Until the other side reports a change, it still holds the
                // base value.
                theirs: entry.from,
                ours_changed: true,
                theirs_changed: false,
            },
        );
    }
    for entry in their_diff {
        match merged.get_mut(&TupleKey(entry.key.clone())) {
            Some(existing) => {
                existing.theirs = entry.to;
                existing.theirs_changed = true;
            }
            None => {
                merged.insert(
                    TupleKey(entry.key.clone()),
                    ThreeWayEntry {
                        key: entry.key,
                        base: entry.from.clone(),
                        ours: entry.from,
                        theirs: entry.to,
                        ours_changed: false,
                        theirs_changed: true,
                    },
                );
            }
        }
    }
    Ok(merged.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prolly::tree::ProllyTree;
    use crate::store::MemoryStore;
    use crate::value::codec::encode_key;
    use crate::value::Value;

    fn key(i: i64) -> Vec<u8> {
        encode_key(1, &[Value::Int(i)]).unwrap()
    }

    fn val(s: &str) -> Vec<u8> {
        encode_key(1, &[Value::Text(s.into())]).unwrap()
    }

    fn store() -> Arc<dyn ChunkStore> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn diff_reports_adds_removes_modifications() {
        let store = store();
        let mut edits = BTreeMap::new();
        for i in 0..500 {
            edits.insert(TupleKey(key(i)), Some(val("same")));
        }
        let a = ProllyTree::empty(store.clone()).apply_edits(&edits).unwrap();
        let b = a
            .put(key(1000), val("added"))
            .unwrap()
            .delete(&key(3))
            .unwrap()
            .put(key(7), val("changed"))
            .unwrap();

        let changes = diff(store, a.root_hash(), b.root_hash()).unwrap();
        assert_eq!(changes.len(), 3);

        assert_eq!(changes[0].key, key(3));
        assert_eq!(changes[0].from, Some(val("same")));
        assert_eq!(changes[0].to, None);

        assert_eq!(changes[1].key, key(7));
        assert_eq!(changes[1].from, Some(val("same")));
        assert_eq!(changes[1].to, Some(val("changed")));

        assert_eq!(changes[2].key, key(1000));
        assert_eq!(changes[2].from, None);
        assert_eq!(changes[2].to, Some(val("added")));
    }

    #[test]
    fn identical_trees_diff_empty() {
        let store = store();
        let mut edits = BTreeMap::new();
        for i in 0..100 {
            edits.insert(TupleKey(key(i)), Some(val("v")));
        }
        let a = ProllyTree::empty(store.clone()).apply_edits(&edits).unwrap();
        let b = ProllyTree::empty(store.clone()).apply_edits(&edits).unwrap();
        assert_eq!(a.root_hash(), b.root_hash());
        assert!(diff(store, a.root_hash(), b.root_hash()).unwrap().is_empty());
    }

    #[test]
    fn diff_against_empty_tree() {
        let store = store();
        let tree = ProllyTree::empty(store.clone())
            .put(key(1), val("x"))
            .unwrap();
        let added = diff(store.clone(), None, tree.root_hash()).unwrap();
        assert_eq!(added.len(), 1);
        assert!(added[0].from.is_none());

        let removed = diff(store, tree.root_hash(), None).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].to.is_none());
    }

    #[test]
    fn three_way_classifies_sides() {
        let store = store();
        let mut edits = BTreeMap::new();
        for i in 0..10 {
            edits.insert(TupleKey(key(i)), Some(val("base")));
        }
        let base = ProllyTree::empty(store.clone()).apply_edits(&edits).unwrap();
        // Ours: change 1, delete 2. Theirs: change 1 differently, change 3.
        let ours = base
            .put(key(1), val("ours"))
            .unwrap()
            .delete(&key(2))
            .unwrap();
        let theirs = base
            .put(key(1), val("theirs"))
            .unwrap()
            .put(key(3), val("theirs-3"))
            .unwrap();

        let entries = three_way_diff(
            store,
            base.root_hash(),
            ours.root_hash(),
            theirs.root_hash(),
        )
        .unwrap();
        assert_eq!(entries.len(), 3);

        let by_key: BTreeMap<Vec<u8>, &ThreeWayEntry> =
            entries.iter().map(|e| (e.key.clone(), e)).collect();

        let both = by_key[&key(1)];
        assert!(both.ours_changed && both.theirs_changed);
        assert_eq!(both.ours, Some(val("ours")));
        assert_eq!(both.theirs, Some(val("theirs")));
        assert_eq!(both.base, Some(val("base")));

        let deleted = by_key[&key(2)];
        assert!(deleted.ours_changed && !deleted.theirs_changed);
        assert_eq!(deleted.ours, None);
        assert_eq!(deleted.theirs, Some(val("base")));

        let theirs_only = by_key[&key(3)];
        assert!(!theirs_only.ours_changed && theirs_only.theirs_changed);
        assert_eq!(theirs_only.ours, Some(val("base")));
    }
}
