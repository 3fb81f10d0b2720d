//! The versioned data model: the typed objects stored as chunks.

pub mod commit;
pub mod root;
pub mod schema;
pub mod table;
pub mod workingset;

use crate::store::StoreError;
use crate::value::ValueError;
use thiserror::Error;

pub use commit::{
    is_ancestor, merge_base, merge_base_candidates, Commit, CommitWalk, Signature, TagMeta,
};
pub use root::{CatalogEntry, CatalogKind, ProcedureEntry, RootValue};
pub use schema::{CheckDef, Column, ForeignKeyDef, IndexDef, Schema};
pub use table::{ConflictsRef, Table};
pub use workingset::{MergeState, WorkingSet};

#[derive(Error, Debug)]
pub enum ModelError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error("corrupt object: {0}")]
    Corrupt(String),
    #[error(
        "database root was written with feature version {found}, but this build only \
         supports {supported}; upgrade the reader to open it"
    )]
    FeatureTooNew { found: u32, supported: u32 },
}
