//! `dolt_conflicts`, `dolt_conflicts_T`, `dolt_constraint_violations`,
//! `dolt_constraint_violations_T`.

use serde::Serialize;
use tributary_core::merge::{ConflictRow, ViolationRow};
use tributary_core::prolly::ProllyTree;
use tributary_core::value::Value;

use crate::error::SessionError;
use crate::session::Session;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConflictsSummaryRow {
    pub table: String,
    pub num_conflicts: u64,
}

/// Tables in the working root with unresolved merge conflicts.
pub fn dolt_conflicts(session: &Session) -> Result<Vec<ConflictsSummaryRow>, SessionError> {
    let store = session.store();
    let root = session.working_root()?;
    let mut rows = Vec::new();
    for name in root.table_names() {
        let table = root.table(&*store, &name)?.expect("listed table");
        if let Some(conflicts) = &table.conflicts {
            let tree = ProllyTree::new(store.clone(), Some(conflicts.tree));
            rows.push(ConflictsSummaryRow {
                table: name,
                num_conflicts: tree.count()?,
            });
        }
    }
    Ok(rows)
}

/// One row of `dolt_conflicts_T`: the conflicting row as the base, our
/// side, and their side hold it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TableConflictRow {
    pub base_row: Option<Vec<Value>>,
    pub our_row: Option<Vec<Value>>,
    pub their_row: Option<Vec<Value>>,
}

pub fn dolt_conflicts_table(
    session: &Session,
    table_name: &str,
) -> Result<Vec<TableConflictRow>, SessionError> {
    let store = session.store();
    let root = session.working_root()?;
    let table = root
        .table(&*store, table_name)?
        .ok_or_else(|| SessionError::UnknownTable(table_name.to_string()))?;
    let Some(conflicts) = &table.conflicts else {
        return Ok(Vec::new());
    };

    let tree = ProllyTree::new(store.clone(), Some(conflicts.tree));
    let mut rows = Vec::new();
    let mut cursor = tree.cursor()?;
    while let Some((_, bytes)) = cursor.peek_cloned() {
        cursor.advance()?;
        let conflict = ConflictRow::from_bytes(&bytes)?;
        rows.push(TableConflictRow {
            base_row: conflict.base,
            our_row: conflict.ours,
            their_row: conflict.theirs,
        });
    }
    Ok(rows)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ViolationsSummaryRow {
    pub table: String,
    pub num_violations: u64,
}

pub fn dolt_constraint_violations(
    session: &Session,
) -> Result<Vec<ViolationsSummaryRow>, SessionError> {
    let store = session.store();
    let root = session.working_root()?;
    let mut rows = Vec::new();
    for name in root.table_names() {
        let table = root.table(&*store, &name)?.expect("listed table");
        if let Some(violations) = table.violations {
            let tree = ProllyTree::new(store.clone(), Some(violations));
            rows.push(ViolationsSummaryRow {
                table: name,
                num_violations: tree.count()?,
            });
        }
    }
    Ok(rows)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TableViolationRow {
    pub violation_type: String,
    pub row: Vec<Value>,
    pub info: String,
}

pub fn dolt_constraint_violations_table(
    session: &Session,
    table_name: &str,
) -> Result<Vec<TableViolationRow>, SessionError> {
    let store = session.store();
    let root = session.working_root()?;
    let table = root
        .table(&*store, table_name)?
        .ok_or_else(|| SessionError::UnknownTable(table_name.to_string()))?;
    let Some(violations) = table.violations else {
        return Ok(Vec::new());
    };

    let tree = ProllyTree::new(store.clone(), Some(violations));
    let mut rows = Vec::new();
    let mut cursor = tree.cursor()?;
    while let Some((_, bytes)) = cursor.peek_cloned() {
        cursor.advance()?;
        let violation = ViolationRow::from_bytes(&bytes)?;
        rows.push(TableViolationRow {
            violation_type: violation.kind.name().to_string(),
            row: violation.row,
            info: violation.message,
        });
    }
    Ok(rows)
}
