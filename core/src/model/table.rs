//! Tables: schema + index roots + merge artifacts.

use crate::chunk::{Chunk, ChunkType};
use crate::hash::Hash;
use crate::prolly::ProllyTree;
use crate::store::ChunkStore;
use crate::value::codec::{decode_key, encode_key, TupleKey};
use crate::value::Value;
use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::schema::Schema;
use super::ModelError;

/// Conflicts artifact reference: the conflict tree plus the three schema
/// generations it was recorded under, so schema evolution between the
/// merge base and both sides stays representable.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct ConflictsRef {
    pub base_schema: Hash,
    pub ours_schema: Hash,
    pub theirs_schema: Hash,
    pub tree: Hash,
}

/// One user table.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct Table {
    pub schema: Hash,
    /// Primary index root; `None` for an empty table.
    pub primary: Option<Hash>,
    /// Secondary index roots, aligned with the schema's index list by name.
    pub secondary: Vec<(String, Option<Hash>)>,
    pub auto_increment: Option<u64>,
    pub conflicts: Option<ConflictsRef>,
    /// Constraint-violations artifact root.
    pub violations: Option<Hash>,
}

impl Table {
    /// A fresh, empty table for `schema` (already stored).
    pub fn create(store: &dyn ChunkStore, schema: &Schema) -> Result<Table, ModelError> {
        let schema_hash = schema.store(store)?;
        Ok(Table {
            schema: schema_hash,
            primary: None,
            secondary: schema
                .indexes
                .iter()
                .map(|idx| (idx.name.clone(), None))
                .collect(),
            auto_increment: None,
            conflicts: None,
            violations: None,
        })
    }

    pub fn to_chunk(&self) -> Chunk {
        Chunk::new(ChunkType::Table, borsh::to_vec(self).expect("borsh"))
    }

    pub fn from_chunk(chunk: &Chunk) -> Result<Table, ModelError> {
        if chunk.ty() != ChunkType::Table {
            return Err(ModelError::Corrupt(format!(
                "expected table chunk, found {:?}",
                chunk.ty()
            )));
        }
        Table::try_from_slice(chunk.payload()).map_err(|e| ModelError::Corrupt(e.to_string()))
    }

    pub fn load(store: &dyn ChunkStore, hash: &Hash) -> Result<Table, ModelError> {
        Table::from_chunk(&store.get(hash)?)
    }

    pub fn store(&self, store: &dyn ChunkStore) -> Result<Hash, ModelError> {
        let chunk = self.to_chunk();
        let hash = chunk.hash();
        store.put(chunk)?;
        Ok(hash)
    }

    pub fn load_schema(&self, store: &dyn ChunkStore) -> Result<Schema, ModelError> {
        Schema::load(store, &self.schema)
    }

    pub fn primary_index(&self, store: Arc<dyn ChunkStore>) -> ProllyTree {
        ProllyTree::new(store, self.primary)
    }

    pub fn has_conflicts(&self) -> bool {
        self.conflicts.is_some()
    }

    pub fn has_violations(&self) -> bool {
        self.violations.is_some()
    }

    /// Rebuild every secondary index from the primary index. Covering
    /// entries are `(indexed columns..., pk columns...)` keys with empty
    /// values.
    pub fn rebuild_secondary_indexes(
        &mut self,
        store: Arc<dyn ChunkStore>,
        schema: &Schema,
    ) -> Result<(), ModelError> {
        let schema_id = schema.schema_id();
        let primary = self.primary_index(store.clone());
        let mut per_index: Vec<BTreeMap<TupleKey, Option<Vec<u8>>>> =
            schema.indexes.iter().map(|_| BTreeMap::new()).collect();

        let mut cursor = primary.cursor()?;
        while let Some((key_bytes, value_bytes)) = cursor.peek_cloned() {
            cursor.advance()?;
            let (_, key_values) = decode_key(&key_bytes)?;
            let (_, value_values) = crate::value::codec::decode_row(&*store, &value_bytes)?;
            let row = schema.join_row(&key_values, &value_values);
            for (slot, index) in schema.indexes.iter().enumerate() {
                let covering = covering_key(schema, &index.tags, &row, &key_values);
                let encoded = encode_key(schema_id, &covering)?;
                per_index[slot].insert(TupleKey(encoded), Some(Vec::new()));
            }
        }

        let mut rebuilt = Vec::with_capacity(schema.indexes.len());
        for (index, entries) in schema.indexes.iter().zip(per_index) {
            let tree = ProllyTree::empty(store.clone()).apply_edits(&entries)?;
            rebuilt.push((index.name.clone(), tree.root_hash()));
        }
        self.secondary = rebuilt;
        Ok(())
    }
}

/// The covering tuple for a secondary index entry: the indexed column
/// values followed by the primary-key values.
pub fn covering_key(
    schema: &Schema,
    index_tags: &[u64],
    full_row: &[Value],
    pk_values: &[Value],
) -> Vec<Value> {
    let mut covering: Vec<Value> = index_tags
        .iter()
        .filter_map(|tag| schema.column_by_tag(*tag).map(|(i, _)| full_row[i].clone()))
        .collect();
    covering.extend_from_slice(pk_values);
    covering
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::schema::{Column, IndexDef};
    use crate::store::MemoryStore;
    use crate::value::codec::encode_row;
    use crate::value::SqlType;

    fn indexed_schema() -> Schema {
        let mut schema = Schema::new(
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
                    name: "name".into(),
                    ty: SqlType::Text,
                    nullable: true,
                    default: None,
                    comment: String::new(),
                    tag: 2,
                },
            ],
            vec![1],
        );
        schema.indexes.push(IndexDef {
            name: "name_idx".into(),
            tags: vec![2],
            unique: false,
        });
        schema
    }

    #[test]
    fn create_and_reload() {
        let store = MemoryStore::new();
        let schema = indexed_schema();
        let table = Table::create(&store, &schema).unwrap();
        assert_eq!(table.secondary.len(), 1);

        let hash = table.store(&store).unwrap();
        let loaded = Table::load(&store, &hash).unwrap();
        assert_eq!(loaded, table);
        assert_eq!(loaded.load_schema(&store).unwrap(), schema);
    }

    #[test]
    fn secondary_index_rebuild() {
        let store: Arc<dyn ChunkStore> = Arc::new(MemoryStore::new());
        let schema = indexed_schema();
        let schema_id = schema.schema_id();
        let mut table = Table::create(&*store, &schema).unwrap();

        let mut primary = table.primary_index(store.clone());
        for (pk, name) in [(1, "bravo"), (2, "alpha"), (3, "alpha")] {
            let key = encode_key(schema_id, &[Value::Int(pk)]).unwrap();
            let value = encode_row(&*store, schema_id, &[Value::Text(name.into())]).unwrap();
            primary = primary.put(key, value).unwrap();
        }
        table.primary = primary.root_hash();

        table
            .rebuild_secondary_indexes(store.clone(), &schema)
            .unwrap();
        let idx_root = table.secondary[0].1;
        let idx = ProllyTree::new(store, idx_root);
        let entries = idx.scan(None, None).unwrap();
        assert_eq!(entries.len(), 3);
        // Ordered by indexed column first: alpha(2), alpha(3), bravo(1).
        let (_, first) = decode_key(&entries[0].0).unwrap();
        assert_eq!(first, vec![Value::Text("alpha".into()), Value::Int(2)]);
        let (_, last) = decode_key(&entries[2].0).unwrap();
        assert_eq!(last, vec![Value::Text("bravo".into()), Value::Int(1)]);
    }
}
