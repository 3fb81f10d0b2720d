//! `dolt_schemas` and `dolt_procedures`, plus their history views.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tributary_core::model::{CommitWalk, RootValue};

use crate::error::SessionError;
use crate::session::Session;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SchemaRow {
    /// `view`, `trigger`, or `event`.
    pub type_name: String,
    pub name: String,
    pub fragment: String,
    pub created_at: DateTime<Utc>,
}

/// Schema catalog fragments of the working root.
pub fn dolt_schemas(session: &Session) -> Result<Vec<SchemaRow>, SessionError> {
    Ok(session
        .working_root()?
        .schemas
        .values()
        .map(|entry| SchemaRow {
            type_name: entry.kind.name().to_string(),
            name: entry.name.clone(),
            fragment: entry.definition.clone(),
            created_at: DateTime::from_timestamp_millis(entry.created_at_millis)
                .unwrap_or_default(),
        })
        .collect())
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcedureRow {
    pub name: String,
    pub create_stmt: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Stored SQL procedures of the working root.
pub fn dolt_procedures(session: &Session) -> Result<Vec<ProcedureRow>, SessionError> {
    Ok(session
        .working_root()?
        .procedures
        .values()
        .map(|entry| ProcedureRow {
            name: entry.name.clone(),
            create_stmt: entry.create_stmt.clone(),
            created_at: DateTime::from_timestamp_millis(entry.created_at_millis)
                .unwrap_or_default(),
            modified_at: DateTime::from_timestamp_millis(entry.modified_at_millis)
                .unwrap_or_default(),
        })
        .collect())
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SchemaHistoryRow {
    pub commit_hash: String,
    pub entry: SchemaRow,
}

/// Catalog fragments as recorded at every commit in the history.
pub fn dolt_schemas_history(session: &Session) -> Result<Vec<SchemaHistoryRow>, SessionError> {
    let store = session.store();
    let fv = session.database().feature_version();
    let mut walk = CommitWalk::from_heads(&*store, &[session.head()])?;
    let mut rows = Vec::new();
    while let Some((hash, commit)) = walk.next_commit()? {
        let root = RootValue::load(&*store, &commit.root, fv)?;
        for entry in root.schemas.values() {
            rows.push(SchemaHistoryRow {
                commit_hash: hash.to_hex(),
                entry: SchemaRow {
                    type_name: entry.kind.name().to_string(),
                    name: entry.name.clone(),
                    fragment: entry.definition.clone(),
                    created_at: DateTime::from_timestamp_millis(entry.created_at_millis)
                        .unwrap_or_default(),
                },
            });
        }
    }
    Ok(rows)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcedureHistoryRow {
    pub commit_hash: String,
    pub entry: ProcedureRow,
}

/// Stored procedures as recorded at every commit in the history.
pub fn dolt_procedures_history(
    session: &Session,
) -> Result<Vec<ProcedureHistoryRow>, SessionError> {
    let store = session.store();
    let fv = session.database().feature_version();
    let mut walk = CommitWalk::from_heads(&*store, &[session.head()])?;
    let mut rows = Vec::new();
    while let Some((hash, commit)) = walk.next_commit()? {
        let root = RootValue::load(&*store, &commit.root, fv)?;
        for entry in root.procedures.values() {
            rows.push(ProcedureHistoryRow {
                commit_hash: hash.to_hex(),
                entry: ProcedureRow {
                    name: entry.name.clone(),
                    create_stmt: entry.create_stmt.clone(),
                    created_at: DateTime::from_timestamp_millis(entry.created_at_millis)
                        .unwrap_or_default(),
                    modified_at: DateTime::from_timestamp_millis(entry.modified_at_millis)
                        .unwrap_or_default(),
                },
            });
        }
    }
    Ok(rows)
}
