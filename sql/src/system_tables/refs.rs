//! `dolt_branches`, `dolt_remote_branches`, `dolt_remotes`, `dolt_tags`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tributary_core::hash::Hash;
use tributary_core::model::{Commit, TagMeta};
use tributary_core::store::RefKind;

use crate::error::SessionError;
use crate::session::Session;

#[derive(Clone, Debug, Serialize)]
pub struct BranchRow {
    pub name: String,
    pub hash: String,
    pub latest_committer: String,
    pub latest_committer_email: String,
    pub latest_commit_date: DateTime<Utc>,
    pub latest_commit_message: String,
}

fn branch_row(session: &Session, name: String, hash: Hash) -> Result<BranchRow, SessionError> {
    let store = session.store();
    let commit = Commit::load(&*store, &hash)?;
    let latest_commit_date = commit.committer.datetime();
    Ok(BranchRow {
        name,
        hash: hash.to_hex(),
        latest_committer: commit.committer.name,
        latest_committer_email: commit.committer.email,
        latest_commit_date,
        latest_commit_message: commit.message,
    })
}

pub fn dolt_branches(session: &Session) -> Result<Vec<BranchRow>, SessionError> {
    session
        .database()
        .branches()?
        .into_iter()
        .map(|(name, hash)| branch_row(session, name, hash))
        .collect()
}

/// Remote-tracking branches. Empty (not an error) when nothing has been
/// fetched yet.
pub fn dolt_remote_branches(session: &Session) -> Result<Vec<BranchRow>, SessionError> {
    session
        .database()
        .refs()
        .list(Some(RefKind::RemoteTracking))?
        .into_iter()
        .map(|(name, hash)| branch_row(session, format!("remotes/{}", name.name), hash))
        .collect()
}

#[derive(Clone, Debug, Serialize)]
pub struct RemoteRow {
    pub name: String,
    pub url: String,
    pub fetch_specs: Vec<String>,
    pub params: BTreeMap<String, String>,
}

/// Configured remotes. Read-only; mutate through the `dolt_remote`
/// procedure.
pub fn dolt_remotes(session: &Session) -> Result<Vec<RemoteRow>, SessionError> {
    Ok(session
        .database()
        .remotes()
        .into_iter()
        .map(|remote| RemoteRow {
            name: remote.name,
            url: remote.url,
            fetch_specs: remote.fetch_specs,
            params: remote.params,
        })
        .collect())
}

#[derive(Clone, Debug, Serialize)]
pub struct TagRow {
    pub tag_name: String,
    pub tag_hash: String,
    pub tagger: String,
    pub email: String,
    pub date: DateTime<Utc>,
    pub message: String,
}

pub fn dolt_tags(session: &Session) -> Result<Vec<TagRow>, SessionError> {
    let store = session.store();
    session
        .database()
        .refs()
        .list(Some(RefKind::Tag))?
        .into_iter()
        .map(|(name, hash)| {
            let meta = TagMeta::load(&*store, &hash)?;
            Ok(TagRow {
                tag_name: name.name,
                tag_hash: meta.commit.to_hex(),
                tagger: meta.tagger.name.clone(),
                email: meta.tagger.email.clone(),
                date: meta.tagger.datetime(),
                message: meta.message,
            })
        })
        .collect()
}
