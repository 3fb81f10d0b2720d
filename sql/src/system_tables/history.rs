//! `dolt_history_T`: every row of a table at every commit in its
//! history.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tributary_core::model::{CommitWalk, RootValue};
use tributary_core::value::Value;

use crate::error::SessionError;
use crate::session::{rows_in_tree, Session};

#[derive(Clone, Debug, Serialize)]
pub struct HistoryRow {
    pub commit_hash: String,
    pub committer: String,
    pub commit_date: DateTime<Utc>,
    pub row: Vec<Value>,
}

pub fn dolt_history_table(
    session: &Session,
    table: &str,
) -> Result<Vec<HistoryRow>, SessionError> {
    let store = session.store();
    let fv = session.database().feature_version();
    let mut walk = CommitWalk::from_heads(&*store, &[session.head()])?;

    let mut rows = Vec::new();
    while let Some((hash, commit)) = walk.next_commit()? {
        let root = RootValue::load(&*store, &commit.root, fv)?;
        let Some(t) = root.table(&*store, table)? else {
            continue;
        };
        let schema = t.load_schema(&*store)?;
        for row in rows_in_tree(&store, &schema, t.primary)? {
            rows.push(HistoryRow {
                commit_hash: hash.to_hex(),
                committer: commit.committer.name.clone(),
                commit_date: commit.committer.datetime(),
                row,
            });
        }
    }
    Ok(rows)
}
