//! Tributary core: a content-addressed, Merkle-structured, branchable
//! object store with Git-style version control over relational data.
//!
//! The crate is organized leaves-first:
//!
//! - [`store`] — the chunk store: table files, manifest, cache, GC
//! - [`value`] — typed SQL values and the ordered tuple codec
//! - [`prolly`] — the Prolly tree index with structural diff
//! - [`model`] — commits, roots, schemas, tables, working sets
//! - [`refs`] — guarded CAS updates of named refs
//! - [`merge`] — the three-way merge engine
//! - [`remote`] — refspecs and chunk-set reconciliation (fetch/push/clone)
//! - [`db`] — the per-directory database shell

pub mod cancel;
pub mod chunk;
pub mod db;
pub mod hash;
pub mod merge;
pub mod model;
pub mod prolly;
pub mod refs;
pub mod remote;
pub mod store;
pub mod value;

pub use cancel::Cancel;
pub use chunk::{Chunk, ChunkType};
pub use hash::Hash;

/// Feature version embedded into every root this writer produces. Readers
/// refuse to open roots written by a newer feature version.
pub const FEATURE_VERSION: u32 = 3;
