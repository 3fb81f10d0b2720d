//! `dolt_status`.

use serde::Serialize;
use tributary_core::model::RootValue;

use crate::error::SessionError;
use crate::session::{changed_tables, Session};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusRow {
    pub table_name: String,
    pub staged: bool,
    /// `new table`, `modified`, `deleted`, or `conflict`.
    pub status: String,
}

fn classify(from: &RootValue, to: &RootValue, name: &str) -> String {
    match (from.tables.get(name), to.tables.get(name)) {
        (None, Some(_)) => "new table".to_string(),
        (Some(_), None) => "deleted".to_string(),
        _ => "modified".to_string(),
    }
}

/// Staged and unstaged table changes, plus conflicted tables.
pub fn dolt_status(session: &Session) -> Result<Vec<StatusRow>, SessionError> {
    let store = session.store();
    let fv = session.database().feature_version();
    let head = RootValue::load(&*store, &session.head_root(), fv)?;
    let staged = RootValue::load(&*store, &session.staged_hash(), fv)?;
    let working = session.working_root()?;

    let mut rows = Vec::new();
    for name in changed_tables(&head, &staged) {
        rows.push(StatusRow {
            table_name: name.clone(),
            staged: true,
            status: classify(&head, &staged, &name),
        });
    }
    for name in changed_tables(&staged, &working) {
        let conflicted = working
            .table(&*store, &name)?
            .map(|t| t.has_conflicts() || t.has_violations())
            .unwrap_or(false);
        rows.push(StatusRow {
            table_name: name.clone(),
            staged: false,
            status: if conflicted {
                "conflict".to_string()
            } else {
                classify(&staged, &working, &name)
            },
        });
    }
    // Conflicted tables that happen to match staged content still show.
    for name in working.table_names() {
        let table = working.table(&*store, &name)?.expect("listed table");
        if (table.has_conflicts() || table.has_violations())
            && !rows.iter().any(|r| r.table_name == name && !r.staged)
        {
            rows.push(StatusRow {
                table_name: name,
                staged: false,
                status: "conflict".to_string(),
            });
        }
    }
    rows.sort_by(|a, b| (&a.table_name, a.staged).cmp(&(&b.table_name, b.staged)));
    Ok(rows)
}
