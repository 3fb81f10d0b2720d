//! Post-merge constraint verification.
//!
//! After non-conflicting row changes are applied, unique indexes, check
//! constraints, and foreign keys are re-verified against the merged root.
//! Violations land in the per-table constraint-violations artifact; they
//! do not block the merge itself, only a clean merge commit.

use crate::model::{RootValue, Schema};
use crate::prolly::ProllyTree;
use crate::store::ChunkStore;
use crate::value::codec::{decode_key, decode_row, encode_key, TupleKey};
use crate::value::Value;
use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::MergeError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ViolationKind {
    UniqueIndex,
    ForeignKey,
    Check,
    NotNull,
}

impl ViolationKind {
    pub fn name(&self) -> &'static str {
        match self {
            ViolationKind::UniqueIndex => "unique index",
            ViolationKind::ForeignKey => "foreign key",
            ViolationKind::Check => "check constraint",
            ViolationKind::NotNull => "not null",
        }
    }
}

/// One recorded constraint violation.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct ViolationRow {
    pub kind: ViolationKind,
    /// Name of the violated constraint or index.
    pub constraint: String,
    pub message: String,
    pub row: Vec<Value>,
}

impl ViolationRow {
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("borsh")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<ViolationRow, MergeError> {
        ViolationRow::try_from_slice(bytes)
            .map_err(|e| MergeError::CorruptArtifact(e.to_string()))
    }
}

/// Seam for check-constraint evaluation: expression evaluation lives in
/// the SQL engine, not the storage core.
pub trait CheckEvaluator: Send + Sync {
    fn evaluate(
        &self,
        schema: &Schema,
        expression: &str,
        row: &[Value],
    ) -> Result<bool, MergeError>;
}

/// Default evaluator: accepts every row.
pub struct AcceptAllChecks;

impl CheckEvaluator for AcceptAllChecks {
    fn evaluate(&self, _: &Schema, _: &str, _: &[Value]) -> Result<bool, MergeError> {
        Ok(true)
    }
}

/// Verify constraints on `tables` against `root`, recording violations in
/// each table's artifact. Returns the number of violations recorded.
pub fn verify_constraints(
    store: &Arc<dyn ChunkStore>,
    root: &mut RootValue,
    tables: &[String],
    checks: &dyn CheckEvaluator,
) -> Result<u64, MergeError> {
    let mut total = 0;
    for name in tables {
        let Some(mut table) = root.table(&**store, name)? else {
            continue;
        };
        let schema = table.load_schema(&**store)?;
        let schema_id = schema.schema_id();

        let mut found: Vec<(Vec<Value>, ViolationRow)> = Vec::new();
        collect_row_violations(store, &schema, table.primary, checks, &mut found)?;
        collect_unique_violations(store, &schema, &table, &mut found)?;
        collect_foreign_key_violations(store, root, name, &schema, table.primary, &mut found)?;

        if found.is_empty() {
            if table.violations.is_some() {
                table.violations = None;
                root.put_table(&**store, name, &table)?;
            }
            continue;
        }

        total += found.len() as u64;
        let mut entries: BTreeMap<TupleKey, Option<Vec<u8>>> = BTreeMap::new();
        for (pk, violation) in found {
            let mut key_values = pk;
            key_values.push(Value::Text(violation.constraint.clone()));
            key_values.push(Value::Text(violation.kind.name().to_string()));
            let key = encode_key(schema_id, &key_values)?;
            entries.insert(TupleKey(key), Some(violation.to_bytes()));
        }
        let tree = ProllyTree::empty(store.clone()).apply_edits(&entries)?;
        table.violations = tree.root_hash();
        root.put_table(&**store, name, &table)?;
        tracing::warn!(table = %name, count = entries.len(), "constraint violations recorded");
    }
    Ok(total)
}

fn full_rows(
    store: &Arc<dyn ChunkStore>,
    schema: &Schema,
    primary: Option<crate::hash::Hash>,
) -> Result<Vec<(Vec<Value>, Vec<Value>)>, MergeError> {
    let tree = ProllyTree::new(store.clone(), primary);
    let mut rows = Vec::new();
    let mut cursor = tree.cursor()?;
    while let Some((key_bytes, value_bytes)) = cursor.peek_cloned() {
        cursor.advance()?;
        let (_, pk) = decode_key(&key_bytes)?;
        let (_, values) = decode_row(&**store, &value_bytes)?;
        let row = schema.join_row(&pk, &values);
        rows.push((pk, row));
    }
    Ok(rows)
}

fn collect_row_violations(
    store: &Arc<dyn ChunkStore>,
    schema: &Schema,
    primary: Option<crate::hash::Hash>,
    checks: &dyn CheckEvaluator,
    out: &mut Vec<(Vec<Value>, ViolationRow)>,
) -> Result<(), MergeError> {
    for (pk, row) in full_rows(store, schema, primary)? {
        for (i, col) in schema.columns.iter().enumerate() {
            if !col.nullable && row[i].is_null() {
                out.push((
                    pk.clone(),
                    ViolationRow {
                        kind: ViolationKind::NotNull,
                        constraint: col.name.clone(),
                        message: format!("column '{}' cannot be null", col.name),
                        row: row.clone(),
                    },
                ));
            }
        }
        for check in &schema.checks {
            if !check.enforced {
                continue;
            }
            if !checks.evaluate(schema, &check.expression, &row)? {
                out.push((
                    pk.clone(),
                    ViolationRow {
                        kind: ViolationKind::Check,
                        constraint: check.name.clone(),
                        message: format!("check constraint '{}' failed", check.name),
                        row: row.clone(),
                    },
                ));
            }
        }
    }
    Ok(())
}

fn collect_unique_violations(
    store: &Arc<dyn ChunkStore>,
    schema: &Schema,
    table: &crate::model::Table,
    out: &mut Vec<(Vec<Value>, ViolationRow)>,
) -> Result<(), MergeError> {
    let pk_len = schema.pk_tags.len();
    for index in schema.indexes.iter().filter(|idx| idx.unique) {
        let root = table
            .secondary
            .iter()
            .find(|(name, _)| *name == index.name)
            .and_then(|(_, root)| *root);
        let tree = ProllyTree::new(store.clone(), root);

        let mut previous: Option<(Vec<Value>, Vec<Value>)> = None;
        let mut previous_reported = false;
        let mut cursor = tree.cursor()?;
        while let Some((key_bytes, _)) = cursor.peek_cloned() {
            cursor.advance()?;
            let (_, covering) = decode_key(&key_bytes)?;
            let indexed = covering[..covering.len() - pk_len].to_vec();
            let pk = covering[covering.len() - pk_len..].to_vec();

            let duplicate = previous
                .as_ref()
                .map(|(prev_indexed, _)| {
                    prev_indexed == &indexed && !indexed.iter().any(Value::is_null)
                })
                .unwrap_or(false);
            if duplicate {
                let (_, prev_pk) = previous.clone().expect("duplicate implies previous");
                if !previous_reported {
                    push_unique_violation(store, schema, table, index, &prev_pk, out)?;
                }
                push_unique_violation(store, schema, table, index, &pk, out)?;
                previous_reported = true;
            } else {
                previous_reported = false;
            }
            previous = Some((indexed, pk));
        }
    }
    Ok(())
}

fn push_unique_violation(
    store: &Arc<dyn ChunkStore>,
    schema: &Schema,
    table: &crate::model::Table,
    index: &crate::model::IndexDef,
    pk: &[Value],
    out: &mut Vec<(Vec<Value>, ViolationRow)>,
) -> Result<(), MergeError> {
    let schema_id = schema.schema_id();
    let key = encode_key(schema_id, pk)?;
    let primary = ProllyTree::new(store.clone(), table.primary);
    let row = match primary.get(&key)? {
        Some(value_bytes) => {
            let (_, values) = decode_row(&**store, &value_bytes)?;
            schema.join_row(pk, &values)
        }
        None => pk.to_vec(),
    };
    out.push((
        pk.to_vec(),
        ViolationRow {
            kind: ViolationKind::UniqueIndex,
            constraint: index.name.clone(),
            message: format!("duplicate entry for unique index '{}'", index.name),
            row,
        },
    ));
    Ok(())
}

fn collect_foreign_key_violations(
    store: &Arc<dyn ChunkStore>,
    root: &RootValue,
    table_name: &str,
    schema: &Schema,
    primary: Option<crate::hash::Hash>,
    out: &mut Vec<(Vec<Value>, ViolationRow)>,
) -> Result<(), MergeError> {
    for fk in root.foreign_keys_on(table_name) {
        let Some(parent) = root.table(&**store, &fk.parent_table)? else {
            continue;
        };
        let parent_schema = parent.load_schema(&**store)?;
        let parent_rows = full_rows(store, &parent_schema, parent.primary)?;

        for (pk, row) in full_rows(store, schema, primary)? {
            let child_values: Vec<Value> = fk
                .columns
                .iter()
                .filter_map(|tag| schema.column_by_tag(*tag).map(|(i, _)| row[i].clone()))
                .collect();
            if child_values.iter().any(Value::is_null) {
                continue;
            }

            let matched = if fk.parent_columns == parent_schema.pk_tags {
                let key = encode_key(parent_schema.schema_id(), &child_values)?;
                ProllyTree::new(store.clone(), parent.primary)
                    .get(&key)?
                    .is_some()
            } else {
                parent_rows.iter().any(|(_, parent_row)| {
                    fk.parent_columns
                        .iter()
                        .filter_map(|tag| {
                            parent_schema.column_by_tag(*tag).map(|(i, _)| &parent_row[i])
                        })
                        .zip(child_values.iter())
                        .all(|(a, b)| a == b)
                })
            };
            if !matched {
                out.push((
                    pk.clone(),
                    ViolationRow {
                        kind: ViolationKind::ForeignKey,
                        constraint: fk.name.clone(),
                        message: format!(
                            "row references missing parent in '{}'",
                            fk.parent_table
                        ),
                        row: row.clone(),
                    },
                ));
            }
        }
    }
    Ok(())
}
