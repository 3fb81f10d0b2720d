//! Three-way row merge for one table.
//!
//! When all three sides share a schema, the merge streams the structural
//! three-way diff and only touches changed keys. When schemas diverged,
//! each side's rows are first mapped into the merged schema by column tag
//! and the merge runs over the mapped sets.

use crate::hash::Hash;
use crate::model::Schema;
use crate::prolly::{three_way_diff, ProllyTree};
use crate::store::ChunkStore;
use crate::value::codec::{decode_key, decode_row, encode_key, encode_row, TupleKey};
use crate::value::Value;
use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::MergeError;

/// One unresolved row conflict: the row as each of the three sides sees
/// it, already mapped into the merged schema. `None` marks a deletion on
/// that side (a modify/delete conflict keeps one side `None`).
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct ConflictRow {
    pub base: Option<Vec<Value>>,
    pub ours: Option<Vec<Value>>,
    pub theirs: Option<Vec<Value>>,
}

impl ConflictRow {
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("borsh")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<ConflictRow, MergeError> {
        ConflictRow::try_from_slice(bytes)
            .map_err(|e| MergeError::CorruptArtifact(e.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct RowMergeOutput {
    pub primary: Option<Hash>,
    pub conflicts: Option<Hash>,
    pub adds: u64,
    pub modifications: u64,
    pub deletes: u64,
    pub conflict_count: u64,
}

#[allow(clippy::too_many_arguments)]
pub fn merge_table_rows(
    store: Arc<dyn ChunkStore>,
    merged_schema: &Schema,
    base: (&Schema, Option<Hash>),
    ours: (&Schema, Option<Hash>),
    theirs: (&Schema, Option<Hash>),
    record_conflicts: bool,
) -> Result<RowMergeOutput, MergeError> {
    let same_schema =
        base.0 == merged_schema && ours.0 == merged_schema && theirs.0 == merged_schema;
    if same_schema {
        merge_same_schema(store, merged_schema, base.1, ours.1, theirs.1, record_conflicts)
    } else {
        merge_mapped(store, merged_schema, base, ours, theirs, record_conflicts)
    }
}

fn decode_full_row(
    store: &dyn ChunkStore,
    schema: &Schema,
    key_bytes: &[u8],
    value_bytes: &[u8],
) -> Result<Vec<Value>, MergeError> {
    let (_, key_values) = decode_key(key_bytes)?;
    let (_, value_values) = decode_row(store, value_bytes)?;
    Ok(schema.join_row(&key_values, &value_values))
}

fn count_change(out: &mut RowMergeOutput, before: bool, after: bool) {
    match (before, after) {
        (false, true) => out.adds += 1,
        (true, true) => out.modifications += 1,
        (true, false) => out.deletes += 1,
        (false, false) => {}
    }
}

fn merge_same_schema(
    store: Arc<dyn ChunkStore>,
    schema: &Schema,
    base: Option<Hash>,
    ours: Option<Hash>,
    theirs: Option<Hash>,
    record_conflicts: bool,
) -> Result<RowMergeOutput, MergeError> {
    let mut out = RowMergeOutput::default();
    let mut edits: BTreeMap<TupleKey, Option<Vec<u8>>> = BTreeMap::new();
    let mut conflicts: BTreeMap<TupleKey, Option<Vec<u8>>> = BTreeMap::new();

    for entry in three_way_diff(store.clone(), base, ours, theirs)? {
        match (entry.ours_changed, entry.theirs_changed) {
            // Only we changed it; the working side already holds it.
            (_, false) => {}
            // Only they changed it: take their side.
            (false, true) => {
                count_change(&mut out, entry.base.is_some(), entry.theirs.is_some());
                edits.insert(TupleKey(entry.key.clone()), entry.theirs.clone());
            }
            (true, true) => {
                if entry.ours == entry.theirs {
                    // Convergent edit.
                    continue;
                }
                out.conflict_count += 1;
                if record_conflicts {
                    let decode = |bytes: &Option<Vec<u8>>| -> Result<Option<Vec<Value>>, MergeError> {
                        bytes
                            .as_ref()
                            .map(|v| decode_full_row(&*store, schema, &entry.key, v))
                            .transpose()
                    };
                    let row = ConflictRow {
                        base: decode(&entry.base)?,
                        ours: decode(&entry.ours)?,
                        theirs: decode(&entry.theirs)?,
                    };
                    conflicts.insert(TupleKey(entry.key.clone()), Some(row.to_bytes()));
                }
            }
        }
    }

    let primary = ProllyTree::new(store.clone(), ours).apply_edits(&edits)?;
    out.primary = primary.root_hash();
    if !conflicts.is_empty() {
        let tree = ProllyTree::empty(store).apply_edits(&conflicts)?;
        out.conflicts = tree.root_hash();
    }
    Ok(out)
}

/// Materialize one side into `pk key -> full row`, mapped into the merged
/// schema by tag.
fn materialize(
    store: &Arc<dyn ChunkStore>,
    merged: &Schema,
    side: (&Schema, Option<Hash>),
) -> Result<BTreeMap<TupleKey, Vec<Value>>, MergeError> {
    let (side_schema, root) = side;
    let merged_id = merged.schema_id();
    let mut rows = BTreeMap::new();
    let tree = ProllyTree::new(store.clone(), root);
    let mut cursor = tree.cursor()?;
    while let Some((key_bytes, value_bytes)) = cursor.peek_cloned() {
        cursor.advance()?;
        let side_row = decode_full_row(&**store, side_schema, &key_bytes, &value_bytes)?;
        let mapped = merged.map_row_from(side_schema, &side_row);
        let (pk, _) = merged.split_row(&mapped);
        rows.insert(TupleKey(encode_key(merged_id, &pk)?), mapped);
    }
    Ok(rows)
}

fn merge_mapped(
    store: Arc<dyn ChunkStore>,
    merged_schema: &Schema,
    base: (&Schema, Option<Hash>),
    ours: (&Schema, Option<Hash>),
    theirs: (&Schema, Option<Hash>),
    record_conflicts: bool,
) -> Result<RowMergeOutput, MergeError> {
    let merged_id = merged_schema.schema_id();
    let base_rows = materialize(&store, merged_schema, base)?;
    let our_rows = materialize(&store, merged_schema, ours)?;
    let their_rows = materialize(&store, merged_schema, theirs)?;

    let mut keys: Vec<TupleKey> = Vec::new();
    for key in base_rows
        .keys()
        .chain(our_rows.keys())
        .chain(their_rows.keys())
    {
        if !keys.contains(key) {
            keys.push(key.clone());
        }
    }
    keys.sort();

    let mut out = RowMergeOutput::default();
    let mut merged_rows: BTreeMap<TupleKey, Option<Vec<u8>>> = BTreeMap::new();
    let mut conflicts: BTreeMap<TupleKey, Option<Vec<u8>>> = BTreeMap::new();

    for key in keys {
        let b = base_rows.get(&key);
        let o = our_rows.get(&key);
        let t = their_rows.get(&key);
        let ours_changed = o != b;
        let theirs_changed = t != b;

        let winner = match (ours_changed, theirs_changed) {
            (_, false) => o,
            (false, true) => {
                count_change(&mut out, b.is_some(), t.is_some());
                t
            }
            (true, true) => {
                if o == t {
                    o
                } else {
                    out.conflict_count += 1;
                    if record_conflicts {
                        let row = ConflictRow {
                            base: b.cloned(),
                            ours: o.cloned(),
                            theirs: t.cloned(),
                        };
                        conflicts.insert(key.clone(), Some(row.to_bytes()));
                    }
                    // The working side keeps ours until resolved.
                    o
                }
            }
        };

        if let Some(row) = winner {
            let (pk, value) = merged_schema.split_row(row);
            let encoded_key = encode_key(merged_id, &pk)?;
            let encoded_value = encode_row(&*store, merged_id, &value)?;
            merged_rows.insert(TupleKey(encoded_key), Some(encoded_value));
        }
    }

    let primary = ProllyTree::empty(store.clone()).apply_edits(&merged_rows)?;
    out.primary = primary.root_hash();
    if !conflicts.is_empty() {
        let tree = ProllyTree::empty(store).apply_edits(&conflicts)?;
        out.conflicts = tree.root_hash();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, Schema};
    use crate::store::MemoryStore;
    use crate::value::SqlType;

    fn schema() -> Schema {
        Schema::new(
            vec![
                Column {
                    name: "pk".into(),
                    ty: SqlType::Int,
                    nullable: false,
                    default: None,
                    comment: String::new(),
                    tag: 1,
                },
                Column {
                    name: "v".into(),
                    ty: SqlType::Int,
                    nullable: true,
                    default: None,
                    comment: String::new(),
                    tag: 2,
                },
            ],
            vec![1],
        )
    }

    fn tree_of(
        store: &Arc<dyn ChunkStore>,
        schema: &Schema,
        rows: &[(i64, i64)],
    ) -> Option<Hash> {
        let id = schema.schema_id();
        let mut edits = BTreeMap::new();
        for (pk, v) in rows {
            let key = encode_key(id, &[Value::Int(*pk)]).unwrap();
            let value = encode_row(&**store, id, &[Value::Int(*v)]).unwrap();
            edits.insert(TupleKey(key), Some(value));
        }
        ProllyTree::empty(store.clone())
            .apply_edits(&edits)
            .unwrap()
            .root_hash()
    }

    fn rows_of(store: &Arc<dyn ChunkStore>, schema: &Schema, root: Option<Hash>) -> Vec<(i64, i64)> {
        let tree = ProllyTree::new(store.clone(), root);
        tree.scan(None, None)
            .unwrap()
            .into_iter()
            .map(|(k, v)| {
                let row = decode_full_row(&**store, schema, &k, &v).unwrap();
                match (&row[0], &row[1]) {
                    (Value::Int(a), Value::Int(b)) => (*a, *b),
                    other => panic!("unexpected row {other:?}"),
                }
            })
            .collect()
    }

    #[test]
    fn one_sided_changes_apply_cleanly() {
        let store: Arc<dyn ChunkStore> = Arc::new(MemoryStore::new());
        let schema = schema();
        let base = tree_of(&store, &schema, &[(1, 1), (2, 2), (3, 3)]);
        // Ours: update row 1. Theirs: delete row 2, add row 4.
        let ours = tree_of(&store, &schema, &[(1, 100), (2, 2), (3, 3)]);
        let theirs = tree_of(&store, &schema, &[(1, 1), (3, 3), (4, 4)]);

        let out = merge_table_rows(
            store.clone(),
            &schema,
            (&schema, base),
            (&schema, ours),
            (&schema, theirs),
            true,
        )
        .unwrap();

        assert_eq!(out.conflict_count, 0);
        assert!(out.conflicts.is_none());
        assert_eq!(out.adds, 1);
        assert_eq!(out.deletes, 1);
        assert_eq!(
            rows_of(&store, &schema, out.primary),
            vec![(1, 100), (3, 3), (4, 4)]
        );
    }

    #[test]
    fn divergent_edit_is_a_conflict() {
        let store: Arc<dyn ChunkStore> = Arc::new(MemoryStore::new());
        let schema = schema();
        let base = tree_of(&store, &schema, &[(1, 1)]);
        let ours = tree_of(&store, &schema, &[(1, 2)]);
        let theirs = tree_of(&store, &schema, &[(1, 3)]);

        let out = merge_table_rows(
            store.clone(),
            &schema,
            (&schema, base),
            (&schema, ours),
            (&schema, theirs),
            true,
        )
        .unwrap();

        assert_eq!(out.conflict_count, 1);
        // Working keeps ours until resolved.
        assert_eq!(rows_of(&store, &schema, out.primary), vec![(1, 2)]);

        let tree = ProllyTree::new(store.clone(), out.conflicts);
        let entries = tree.scan(None, None).unwrap();
        assert_eq!(entries.len(), 1);
        let conflict = ConflictRow::from_bytes(&entries[0].1).unwrap();
        assert_eq!(conflict.base, Some(vec![Value::Int(1), Value::Int(1)]));
        assert_eq!(conflict.ours, Some(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(conflict.theirs, Some(vec![Value::Int(1), Value::Int(3)]));
    }

    #[test]
    fn modify_delete_is_a_conflict() {
        let store: Arc<dyn ChunkStore> = Arc::new(MemoryStore::new());
        let schema = schema();
        let base = tree_of(&store, &schema, &[(1, 1)]);
        let ours = tree_of(&store, &schema, &[(1, 5)]);
        let theirs = tree_of(&store, &schema, &[]);

        let out = merge_table_rows(
            store.clone(),
            &schema,
            (&schema, base),
            (&schema, ours),
            (&schema, theirs),
            true,
        )
        .unwrap();

        assert_eq!(out.conflict_count, 1);
        let tree = ProllyTree::new(store, out.conflicts);
        let entries = tree.scan(None, None).unwrap();
        let conflict = ConflictRow::from_bytes(&entries[0].1).unwrap();
        assert!(conflict.theirs.is_none());
        assert_eq!(conflict.ours, Some(vec![Value::Int(1), Value::Int(5)]));
    }

    #[test]
    fn convergent_edits_are_not_conflicts() {
        let store: Arc<dyn ChunkStore> = Arc::new(MemoryStore::new());
        let schema = schema();
        let base = tree_of(&store, &schema, &[(1, 1)]);
        let ours = tree_of(&store, &schema, &[(1, 9)]);
        let theirs = tree_of(&store, &schema, &[(1, 9)]);

        let out = merge_table_rows(
            store.clone(),
            &schema,
            (&schema, base),
            (&schema, ours),
            (&schema, theirs),
            true,
        )
        .unwrap();
        assert_eq!(out.conflict_count, 0);
        assert_eq!(rows_of(&store, &schema, out.primary), vec![(1, 9)]);
    }

    #[test]
    fn schema_divergence_takes_the_mapped_path() {
        let store: Arc<dyn ChunkStore> = Arc::new(MemoryStore::new());
        let base_schema = schema();
        // Theirs added a column with a default.
        let mut their_schema = base_schema.clone();
        their_schema.columns.push(Column {
            name: "extra".into(),
            ty: SqlType::Int,
            nullable: true,
            default: Some("0".into()),
            comment: String::new(),
            tag: 3,
        });
        let merged_schema = their_schema.clone();

        let base = tree_of(&store, &base_schema, &[(1, 1)]);
        let ours = tree_of(&store, &base_schema, &[(1, 1), (2, 2)]);
        // Their tree is written under their schema.
        let their_id = their_schema.schema_id();
        let mut edits = BTreeMap::new();
        let key = encode_key(their_id, &[Value::Int(1)]).unwrap();
        let value =
            encode_row(&*store, their_id, &[Value::Int(1), Value::Int(42)]).unwrap();
        edits.insert(TupleKey(key), Some(value));
        let theirs = ProllyTree::empty(store.clone())
            .apply_edits(&edits)
            .unwrap()
            .root_hash();

        let out = merge_table_rows(
            store.clone(),
            &merged_schema,
            (&base_schema, base),
            (&base_schema, ours),
            (&their_schema, theirs),
            true,
        )
        .unwrap();

        assert_eq!(out.conflict_count, 0);
        let tree = ProllyTree::new(store.clone(), out.primary);
        let entries = tree.scan(None, None).unwrap();
        assert_eq!(entries.len(), 2);
        let first = decode_full_row(&*store, &merged_schema, &entries[0].0, &entries[0].1).unwrap();
        assert_eq!(first, vec![Value::Int(1), Value::Int(1), Value::Int(42)]);
        let second = decode_full_row(&*store, &merged_schema, &entries[1].0, &entries[1].1).unwrap();
        // Our row gains the new column's default.
        assert_eq!(second, vec![Value::Int(2), Value::Int(2), Value::Int(0)]);
    }
}
