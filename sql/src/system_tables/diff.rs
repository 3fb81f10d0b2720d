//! `dolt_diff_T` and `dolt_commit_diff_T`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tributary_core::hash::Hash;
use tributary_core::model::{Commit, RootValue, Schema};
use tributary_core::prolly;
use tributary_core::store::ChunkStore;
use tributary_core::value::codec::{decode_key, decode_row};
use tributary_core::value::Value;

use crate::error::SessionError;
use crate::session::Session;

/// Sentinel `to_commit` for the uncommitted working root.
pub const WORKING: &str = "WORKING";
/// Sentinel `to_commit` for the staged root.
pub const STAGED: &str = "STAGED";
const EMPTY: &str = "EMPTY";

#[derive(Clone, Debug, Serialize)]
pub struct DiffRow {
    pub from_commit: String,
    pub to_commit: String,
    pub to_commit_date: Option<DateTime<Utc>>,
    /// `added`, `modified`, or `removed`.
    pub diff_type: String,
    pub from_row: Option<Vec<Value>>,
    pub to_row: Option<Vec<Value>>,
}

fn table_state(
    store: &Arc<dyn ChunkStore>,
    root: &RootValue,
    table: &str,
) -> Result<Option<(Schema, Option<Hash>)>, SessionError> {
    match root.table(&**store, table)? {
        Some(t) => {
            let schema = t.load_schema(&**store)?;
            Ok(Some((schema, t.primary)))
        }
        None => Ok(None),
    }
}

fn decode_side(
    store: &Arc<dyn ChunkStore>,
    schema: &Schema,
    key_bytes: &[u8],
    value_bytes: &[u8],
) -> Result<Vec<Value>, SessionError> {
    let (_, pk) = decode_key(key_bytes)?;
    let (_, values) = decode_row(&**store, value_bytes)?;
    Ok(schema.join_row(&pk, &values))
}

/// Row-level transitions of one table between two roots. Each side's
/// rows decode under that side's own schema generation.
fn diff_between_roots(
    store: &Arc<dyn ChunkStore>,
    from_root: &RootValue,
    to_root: &RootValue,
    table: &str,
    from_label: &str,
    to_label: &str,
    to_date: Option<DateTime<Utc>>,
) -> Result<Vec<DiffRow>, SessionError> {
    let from_state = table_state(store, from_root, table)?;
    let to_state = table_state(store, to_root, table)?;
    let from_tree = from_state.as_ref().and_then(|(_, root)| *root);
    let to_tree = to_state.as_ref().and_then(|(_, root)| *root);
    if from_state.is_none() && to_state.is_none() {
        return Ok(Vec::new());
    }

    let mut rows = Vec::new();
    for entry in prolly::diff(store.clone(), from_tree, to_tree)? {
        let from_row = match (&entry.from, &from_state) {
            (Some(bytes), Some((schema, _))) => {
                Some(decode_side(store, schema, &entry.key, bytes)?)
            }
            _ => None,
        };
        let to_row = match (&entry.to, &to_state) {
            (Some(bytes), Some((schema, _))) => {
                Some(decode_side(store, schema, &entry.key, bytes)?)
            }
            _ => None,
        };
        let diff_type = match (&from_row, &to_row) {
            (None, Some(_)) => "added",
            (Some(_), None) => "removed",
            _ => "modified",
        };
        rows.push(DiffRow {
            from_commit: from_label.to_string(),
            to_commit: to_label.to_string(),
            to_commit_date: to_date,
            diff_type: diff_type.to_string(),
            from_row,
            to_row,
        });
    }
    Ok(rows)
}

/// `dolt_diff_T`: every transition of `table` along the working set's
/// commit path, newest first, ending (at the top) with the STAGED and
/// WORKING sentinels.
pub fn dolt_diff_table(session: &Session, table: &str) -> Result<Vec<DiffRow>, SessionError> {
    let store = session.store();
    let fv = session.database().feature_version();

    // Points along the path, newest first: WORKING, STAGED, HEAD, ...
    // first-parent ancestors down to the initial commit.
    let mut points: Vec<(String, Option<DateTime<Utc>>, RootValue)> = vec![
        (
            WORKING.to_string(),
            None,
            session.working_root()?,
        ),
        (
            STAGED.to_string(),
            None,
            session.staged_root()?,
        ),
    ];
    let mut cursor = Some(session.head());
    while let Some(hash) = cursor {
        let commit = Commit::load(&*store, &hash)?;
        points.push((
            hash.to_hex(),
            Some(commit.committer.datetime()),
            RootValue::load(&*store, &commit.root, fv)?,
        ));
        cursor = commit.parents.first().copied();
    }

    let empty = RootValue::new(fv);
    let mut rows = Vec::new();
    for window in 0..points.len() {
        let (to_label, to_date, to_root) = &points[window];
        let (from_label, from_root): (&str, &RootValue) = match points.get(window + 1) {
            Some((label, _, root)) => (label.as_str(), root),
            None => (EMPTY, &empty),
        };
        rows.extend(diff_between_roots(
            &store, from_root, to_root, table, from_label, to_label, *to_date,
        )?);
    }
    Ok(rows)
}

/// `dolt_commit_diff_T`: the direct diff between two explicit commits.
/// Both endpoints are required.
pub fn dolt_commit_diff_table(
    session: &Session,
    table: &str,
    from_commit: Option<&str>,
    to_commit: Option<&str>,
) -> Result<Vec<DiffRow>, SessionError> {
    let (from_spec, to_spec) = match (from_commit, to_commit) {
        (Some(f), Some(t)) => (f, t),
        _ => {
            return Err(SessionError::Usage(
                "dolt_commit_diff_* requires both from_commit and to_commit".to_string(),
            ))
        }
    };
    let store = session.store();
    let fv = session.database().feature_version();

    let resolve_root = |spec: &str| -> Result<RootValue, SessionError> {
        match spec {
            WORKING => session.working_root(),
            STAGED => session.staged_root(),
            other => {
                let commit_hash = session.database().resolve_revision(other)?;
                let commit = Commit::load(&*store, &commit_hash)?;
                Ok(RootValue::load(&*store, &commit.root, fv)?)
            }
        }
    };
    let from_root = resolve_root(from_spec)?;
    let to_root = resolve_root(to_spec)?;
    diff_between_roots(&store, &from_root, &to_root, table, from_spec, to_spec, None)
}
