//! `dolt_log`, `dolt_commits`, `dolt_commit_ancestors`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tributary_core::hash::Hash;
use tributary_core::model::CommitWalk;

use crate::error::SessionError;
use crate::session::Session;

#[derive(Clone, Debug, Serialize)]
pub struct LogRow {
    pub commit_hash: String,
    pub committer: String,
    pub email: String,
    pub date: DateTime<Utc>,
    pub message: String,
    /// Topological height: 0 for the initial commit, else
    /// `1 + max(parent orders)`.
    pub commit_order: u64,
    pub parents: Vec<String>,
}

fn walk_rows(session: &Session, heads: &[Hash]) -> Result<Vec<LogRow>, SessionError> {
    let store = session.store();
    let mut walk = CommitWalk::from_heads(&*store, heads)?;
    let mut rows = Vec::new();
    while let Some((hash, commit)) = walk.next_commit()? {
        rows.push(LogRow {
            commit_hash: hash.to_hex(),
            committer: commit.committer.name.clone(),
            email: commit.committer.email.clone(),
            date: commit.committer.datetime(),
            message: commit.message.clone(),
            commit_order: commit.height,
            parents: commit.parents.iter().map(Hash::to_hex).collect(),
        });
    }
    Ok(rows)
}

/// The commit walk from a ref (or the session head), newest first.
/// Recognized display option: `--oneline` (row content is unaffected).
pub fn dolt_log(session: &Session, log_args: &[&str]) -> Result<Vec<LogRow>, SessionError> {
    let mut rev: Option<&str> = None;
    for arg in log_args {
        match *arg {
            "--oneline" => {}
            other if other.starts_with('-') => {
                return Err(SessionError::UnknownOption(other.to_string()))
            }
            other => {
                if rev.replace(other).is_some() {
                    return Err(SessionError::Usage(
                        "dolt_log takes at most one revision".to_string(),
                    ));
                }
            }
        }
    }
    let head = match rev {
        Some(spec) => session.database().resolve_revision(spec)?,
        None => session.head(),
    };
    walk_rows(session, &[head])
}

/// Every commit reachable from any branch or tag, deduplicated.
pub fn dolt_commits(session: &Session) -> Result<Vec<LogRow>, SessionError> {
    let mut heads: Vec<Hash> = session
        .database()
        .branches()?
        .into_iter()
        .map(|(_, hash)| hash)
        .collect();
    heads.push(session.head());
    walk_rows(session, &heads)
}

#[derive(Clone, Debug, Serialize)]
pub struct CommitAncestorRow {
    pub commit_hash: String,
    /// `None` for an initial commit.
    pub parent_hash: Option<String>,
    pub parent_index: u64,
}

/// The global commit ancestry relation.
pub fn dolt_commit_ancestors(session: &Session) -> Result<Vec<CommitAncestorRow>, SessionError> {
    let commits = dolt_commits(session)?;
    let mut rows = Vec::new();
    for commit in commits {
        if commit.parents.is_empty() {
            rows.push(CommitAncestorRow {
                commit_hash: commit.commit_hash.clone(),
                parent_hash: None,
                parent_index: 0,
            });
            continue;
        }
        for (index, parent) in commit.parents.iter().enumerate() {
            rows.push(CommitAncestorRow {
                commit_hash: commit.commit_hash.clone(),
                parent_hash: Some(parent.clone()),
                parent_index: index as u64,
            });
        }
    }
    Ok(rows)
}
