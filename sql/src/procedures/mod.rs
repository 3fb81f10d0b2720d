//! Stored procedures: the `CALL dolt_<verb>(...)` surface.
//!
//! Each verb is also reachable through a short alias (`dcommit`,
//! `dfetch`, ...) with identical semantics. Flag tables are strict:
//! unknown options are rejected.

pub mod args;
mod commit;
mod merge;
mod refs;
mod remote;

use crate::error::SessionError;
use crate::session::Session;

/// Result of a stored-procedure call, rendered by the SQL engine as a
/// single-row result set.
#[derive(Clone, Debug, PartialEq)]
pub enum ProcedureResult {
    /// New commit (or head) hash.
    CommitHash(String),
    /// Informational status with no hash.
    Message(String),
    Merge {
        hash: String,
        fast_forward: bool,
        conflicts: u64,
        violations: u64,
    },
    Fetch {
        chunks_fetched: u64,
        refs_updated: u64,
        refs_pruned: u64,
    },
    Push {
        chunks_pushed: u64,
    },
    /// `--skip-empty` with nothing staged.
    Skipped,
}

impl ProcedureResult {
    /// The hash column of the result row, where one applies.
    pub fn hash(&self) -> Option<&str> {
        match self {
            ProcedureResult::CommitHash(h) => Some(h),
            ProcedureResult::Merge { hash, .. } => Some(hash),
            _ => None,
        }
    }
}

fn canonical_name(name: &str) -> &str {
    match name {
        "dadd" => "dolt_add",
        "dcommit" => "dolt_commit",
        "dmerge" => "dolt_merge",
        "dfetch" => "dolt_fetch",
        "dpush" => "dolt_push",
        "dcheckout" => "dolt_checkout",
        "dbranch" => "dolt_branch",
        "dtag" => "dolt_tag",
        "dremote" => "dolt_remote",
        other => other,
    }
}

impl Session {
    /// Dispatch a `CALL dolt_<verb>(...)` invocation.
    pub async fn call_procedure(
        &mut self,
        name: &str,
        call_args: &[&str],
    ) -> Result<ProcedureResult, SessionError> {
        let lowered = name.to_ascii_lowercase();
        match canonical_name(&lowered) {
            "dolt_add" => commit::dolt_add(self, call_args),
            "dolt_commit" => commit::dolt_commit(self, call_args),
            "dolt_merge" => merge::dolt_merge(self, call_args),
            "dolt_conflicts_resolve" => merge::dolt_conflicts_resolve(self, call_args),
            "dolt_branch" => refs::dolt_branch(self, call_args),
            "dolt_checkout" => refs::dolt_checkout(self, call_args),
            "dolt_tag" => refs::dolt_tag(self, call_args),
            "dolt_remote" => remote::dolt_remote(self, call_args),
            "dolt_fetch" => remote::dolt_fetch(self, call_args).await,
            "dolt_push" => remote::dolt_push(self, call_args).await,
            other => Err(SessionError::UnknownProcedure(other.to_string())),
        }
    }
}
