//! The `dolt_*` system tables.
//!
//! Read-only views over the versioned store, returned as typed rows for
//! the SQL engine to project.

pub mod conflicts;
pub mod diff;
pub mod history;
pub mod log;
pub mod refs;
pub mod schemas;
pub mod status;

pub use conflicts::{
    dolt_conflicts, dolt_conflicts_table, dolt_constraint_violations,
    dolt_constraint_violations_table, ConflictsSummaryRow, TableConflictRow,
    TableViolationRow, ViolationsSummaryRow,
};
pub use diff::{dolt_commit_diff_table, dolt_diff_table, DiffRow, STAGED, WORKING};
pub use history::{dolt_history_table, HistoryRow};
pub use log::{dolt_commit_ancestors, dolt_commits, dolt_log, CommitAncestorRow, LogRow};
pub use refs::{
    dolt_branches, dolt_remote_branches, dolt_remotes, dolt_tags, BranchRow, RemoteRow, TagRow,
};
pub use schemas::{
    dolt_procedures, dolt_procedures_history, dolt_schemas, dolt_schemas_history,
    ProcedureHistoryRow, ProcedureRow, SchemaHistoryRow, SchemaRow,
};
pub use status::{dolt_status, StatusRow};
