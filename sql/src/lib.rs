//! SQL session bridge for Tributary.
//!
//! Maps a SQL session onto the versioned storage core: reads route
//! through Prolly trees over the session's working root, writes build new
//! working roots, and version-control operations surface as stored
//! procedures (`CALL dolt_commit(...)`) and `dolt_*` system tables. The
//! SQL planner/executor itself is external; this crate is the API it
//! consumes.

pub mod error;
pub mod procedures;
pub mod session;
pub mod system_tables;

pub use error::SessionError;
pub use procedures::ProcedureResult;
pub use session::{CommitOpts, MergeOpts, Session, SessionConfig};
