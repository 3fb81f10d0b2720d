//! Root values: the top-level per-database state object.

use crate::chunk::{Chunk, ChunkType};
use crate::hash::Hash;
use crate::store::ChunkStore;
use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;

use super::schema::ForeignKeyDef;
use super::table::Table;
use super::ModelError;

/// Kind of a schema catalog fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum CatalogKind {
    View,
    Trigger,
    Event,
}

impl CatalogKind {
    pub fn name(&self) -> &'static str {
        match self {
            CatalogKind::View => "view",
            CatalogKind::Trigger => "trigger",
            CatalogKind::Event => "event",
        }
    }
}

/// A schema catalog fragment (view, trigger, event).
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct CatalogEntry {
    pub kind: CatalogKind,
    pub name: String,
    pub definition: String,
    pub created_at_millis: i64,
}

/// A stored SQL procedure.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct ProcedureEntry {
    pub name: String,
    pub create_stmt: String,
    pub created_at_millis: i64,
    pub modified_at_millis: i64,
}

/// Maps table names to table chunks and holds the schema catalog and
/// foreign-key definitions. Every write embeds the writer's feature
/// version; readers refuse newer roots.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct RootValue {
    pub feature_version: u32,
    pub tables: BTreeMap<String, Hash>,
    pub schemas: BTreeMap<String, CatalogEntry>,
    pub procedures: BTreeMap<String, ProcedureEntry>,
    pub foreign_keys: Vec<ForeignKeyDef>,
}

impl RootValue {
    pub fn new(feature_version: u32) -> RootValue {
        RootValue {
            feature_version,
            tables: BTreeMap::new(),
            schemas: BTreeMap::new(),
            procedures: BTreeMap::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn to_chunk(&self) -> Chunk {
        Chunk::new(ChunkType::Root, borsh::to_vec(self).expect("borsh"))
    }

    /// Store this root and return its hash.
    pub fn store(&self, store: &dyn ChunkStore) -> Result<Hash, ModelError> {
        let chunk = self.to_chunk();
        let hash = chunk.hash();
        store.put(chunk)?;
        Ok(hash)
    }

    /// Load a root, enforcing the feature-version gate.
    pub fn load(
        store: &dyn ChunkStore,
        hash: &Hash,
        supported_feature: u32,
    ) -> Result<RootValue, ModelError> {
        let chunk = store.get(hash)?;
        if chunk.ty() != ChunkType::Root {
            return Err(ModelError::Corrupt(format!(
                "expected root chunk, found {:?}",
                chunk.ty()
            )));
        }
        let root = RootValue::try_from_slice(chunk.payload())
            .map_err(|e| ModelError::Corrupt(e.to_string()))?;
        if root.feature_version > supported_feature {
            return Err(ModelError::FeatureTooNew {
                found: root.feature_version,
                supported: supported_feature,
            });
        }
        Ok(root)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table(&self, store: &dyn ChunkStore, name: &str) -> Result<Option<Table>, ModelError> {
        match self.tables.get(name) {
            Some(hash) => Ok(Some(Table::load(store, hash)?)),
            None => Ok(None),
        }
    }

    /// Store `table` and point `name` at it.
    pub fn put_table(
        &mut self,
        store: &dyn ChunkStore,
        name: &str,
        table: &Table,
    ) -> Result<(), ModelError> {
        let hash = table.store(store)?;
        self.tables.insert(name.to_string(), hash);
        Ok(())
    }

    pub fn remove_table(&mut self, name: &str) -> bool {
        self.tables.remove(name).is_some()
    }

    /// Foreign keys whose child table is `name`.
    pub fn foreign_keys_on(&self, name: &str) -> Vec<&ForeignKeyDef> {
        self.foreign_keys
            .iter()
            .filter(|fk| fk.table == name)
            .collect()
    }
}
