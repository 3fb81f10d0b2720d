//! Table schemas.
//!
//! Each column owns a stable numeric tag that survives renames; merges
//! pair columns across the base and both sides by tag, never by name or
//! position.

use crate::chunk::{Chunk, ChunkType};
use crate::hash::Hash;
use crate::store::ChunkStore;
use crate::value::{SqlType, Value};
use borsh::{BorshDeserialize, BorshSerialize};

use super::ModelError;

#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct Column {
    pub name: String,
    pub ty: SqlType,
    pub nullable: bool,
    /// Default value literal, as written in the DDL.
    pub default: Option<String>,
    pub comment: String,
    /// Stable identity across renames and merges.
    pub tag: u64,
}

#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct IndexDef {
    pub name: String,
    /// Tags of the indexed columns, in index key order.
    pub tags: Vec<u64>,
    pub unique: bool,
}

#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct CheckDef {
    pub name: String,
    pub expression: String,
    pub enforced: bool,
}

#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct ForeignKeyDef {
    pub name: String,
    pub table: String,
    /// Tags of the referencing columns.
    pub columns: Vec<u64>,
    pub parent_table: String,
    /// Tags of the referenced columns in the parent table.
    pub parent_columns: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct Schema {
    pub columns: Vec<Column>,
    /// Tags of the primary-key columns, in key order.
    pub pk_tags: Vec<u64>,
    pub indexes: Vec<IndexDef>,
    pub checks: Vec<CheckDef>,
}

impl Schema {
    pub fn new(columns: Vec<Column>, pk_tags: Vec<u64>) -> Schema {
        Schema {
            columns,
            pk_tags,
            indexes: Vec::new(),
            checks: Vec::new(),
        }
    }

    pub fn to_chunk(&self) -> Chunk {
        Chunk::new(ChunkType::Schema, borsh::to_vec(self).expect("borsh"))
    }

    pub fn from_chunk(chunk: &Chunk) -> Result<Schema, ModelError> {
        if chunk.ty() != ChunkType::Schema {
            return Err(ModelError::Corrupt(format!(
                "expected schema chunk, found {:?}",
                chunk.ty()
            )));
        }
        Schema::try_from_slice(chunk.payload()).map_err(|e| ModelError::Corrupt(e.to_string()))
    }

    pub fn load(store: &dyn ChunkStore, hash: &Hash) -> Result<Schema, ModelError> {
        Schema::from_chunk(&store.get(hash)?)
    }

    /// Store the schema and return its hash.
    pub fn store(&self, store: &dyn ChunkStore) -> Result<Hash, ModelError> {
        let chunk = self.to_chunk();
        let hash = chunk.hash();
        store.put(chunk)?;
        Ok(hash)
    }

    /// Identifier recorded in every tuple written under this schema.
    /// Derived from the schema's content hash, so any alteration changes it.
    pub fn schema_id(&self) -> u32 {
        let hash = self.to_chunk().hash();
        u32::from_le_bytes(hash.0[..4].try_into().unwrap())
    }

    pub fn column_by_tag(&self, tag: u64) -> Option<(usize, &Column)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.tag == tag)
    }

    pub fn column_by_name(&self, name: &str) -> Option<(usize, &Column)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == name)
    }

    /// Positions of the primary-key columns, in key order.
    pub fn pk_positions(&self) -> Vec<usize> {
        self.pk_tags
            .iter()
            .filter_map(|tag| self.column_by_tag(*tag).map(|(i, _)| i))
            .collect()
    }

    /// Positions of the non-key columns, in declaration order.
    pub fn value_positions(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !self.pk_tags.contains(&c.tag))
            .map(|(i, _)| i)
            .collect()
    }

    /// Split a full row (declaration order) into key and value tuples.
    pub fn split_row(&self, row: &[Value]) -> (Vec<Value>, Vec<Value>) {
        let key = self.pk_positions().iter().map(|&i| row[i].clone()).collect();
        let value = self
            .value_positions()
            .iter()
            .map(|&i| row[i].clone())
            .collect();
        (key, value)
    }

    /// Reassemble a full row from key and value tuples.
    pub fn join_row(&self, key: &[Value], value: &[Value]) -> Vec<Value> {
        let pk_positions = self.pk_positions();
        let value_positions = self.value_positions();
        let mut row = vec![Value::Null; self.columns.len()];
        for (slot, v) in pk_positions.iter().zip(key) {
            row[*slot] = v.clone();
        }
        for (slot, v) in value_positions.iter().zip(value) {
            row[*slot] = v.clone();
        }
        row
    }

    /// Map a full row from another schema generation of the same table
    /// into this schema's column order, pairing columns by tag. Columns
    /// absent in `from` take their default (or NULL).
    pub fn map_row_from(&self, from: &Schema, row: &[Value]) -> Vec<Value> {
        self.columns
            .iter()
            .map(|col| match from.column_by_tag(col.tag) {
                Some((i, _)) if i < row.len() => row[i].clone(),
                _ => parse_default(col.default.as_deref()),
            })
            .collect()
    }
}

/// Interpret a DDL default literal as a value. Unparsable defaults fall
/// back to NULL; expression defaults are evaluated by the SQL engine
/// before rows reach storage.
pub fn parse_default(default: Option<&str>) -> Value {
    let Some(text) = default else {
        return Value::Null;
    };
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return Value::Float(f);
    }
    let unquoted = trimmed
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| trimmed.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
    match unquoted {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn two_column_schema() -> Schema {
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

    #[test]
    fn split_and_join_round_trip() {
        let schema = two_column_schema();
        let row = vec![Value::Int(1), Value::Int(10)];
        let (key, value) = schema.split_row(&row);
        assert_eq!(key, vec![Value::Int(1)]);
        assert_eq!(value, vec![Value::Int(10)]);
        assert_eq!(schema.join_row(&key, &value), row);
    }

    #[test]
    fn schema_id_changes_with_alterations() {
        let schema = two_column_schema();
        let mut altered = schema.clone();
        altered.columns[1].name = "renamed".into();
        assert_ne!(schema.schema_id(), altered.schema_id());
    }

    #[test]
    fn map_row_pairs_by_tag_across_rename() {
        let old = two_column_schema();
        let mut new = old.clone();
        new.columns[1].name = "renamed".into();
        // Renames keep the tag; values flow through.
        let mapped = new.map_row_from(&old, &[Value::Int(1), Value::Int(10)]);
        assert_eq!(mapped, vec![Value::Int(1), Value::Int(10)]);

        // A column added on the target side takes its default.
        new.columns.push(Column {
            name: "extra".into(),
            ty: SqlType::Text,
            nullable: true,
            default: Some("'fresh'".into()),
            comment: String::new(),
            tag: 3,
        });
        let mapped = new.map_row_from(&old, &[Value::Int(1), Value::Int(10)]);
        assert_eq!(
            mapped,
            vec![Value::Int(1), Value::Int(10), Value::Text("fresh".into())]
        );
    }

    #[test]
    fn default_literals() {
        assert_eq!(parse_default(None), Value::Null);
        assert_eq!(parse_default(Some("42")), Value::Int(42));
        assert_eq!(parse_default(Some("'hi'")), Value::Text("hi".into()));
        assert_eq!(parse_default(Some("NULL")), Value::Null);
    }
}
