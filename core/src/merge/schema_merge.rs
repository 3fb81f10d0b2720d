//! Three-way schema merge.
//!
//! Columns pair across the base and both sides by tag. A column counts as
//! added when new on exactly one side, dropped when dropped on exactly
//! one unmodified side, and modified when the sides altered disjoint
//! attributes. Primary-key changes, divergent type changes, and
//! modify/drop collisions are schema conflicts.

use crate::model::{CheckDef, Column, IndexDef, Schema};

use super::MergeError;

pub fn merge_schemas(
    table: &str,
    base: &Schema,
    ours: &Schema,
    theirs: &Schema,
) -> Result<Schema, MergeError> {
    if ours == theirs {
        return Ok(ours.clone());
    }

    let conflict = |reason: String| MergeError::SchemaConflict {
        table: table.to_string(),
        reason,
    };

    if !(ours.pk_tags == base.pk_tags && theirs.pk_tags == base.pk_tags) {
        return Err(conflict("primary key changed".into()));
    }

    let mut columns = Vec::new();
    for ours_col in &ours.columns {
        let tag = ours_col.tag;
        let base_col = base.column_by_tag(tag).map(|(_, c)| c);
        let theirs_col = theirs.column_by_tag(tag).map(|(_, c)| c);
        match (base_col, theirs_col) {
            // Added on our side only.
            (None, None) => columns.push(ours_col.clone()),
            // Added on both sides.
            (None, Some(theirs_col)) => {
                if ours_col == theirs_col {
                    columns.push(ours_col.clone());
                } else {
                    return Err(conflict(format!(
                        "column '{}' added differently on both sides",
                        ours_col.name
                    )));
                }
            }
            // Dropped on their side.
            (Some(base_col), None) => {
                if ours_col == base_col {
                    continue;
                }
                return Err(conflict(format!(
                    "column '{}' modified here but dropped on the other side",
                    ours_col.name
                )));
            }
            (Some(base_col), Some(theirs_col)) => {
                columns.push(merge_column(table, base_col, ours_col, theirs_col)?);
            }
        }
    }
    // Columns added on their side only.
    for theirs_col in &theirs.columns {
        let tag = theirs_col.tag;
        if ours.column_by_tag(tag).is_some() {
            continue;
        }
        match base.column_by_tag(tag) {
            None => columns.push(theirs_col.clone()),
            Some((_, base_col)) => {
                // We dropped it; a clean drop only if they left it alone.
                if theirs_col == base_col {
                    continue;
                }
                return Err(conflict(format!(
                    "column '{}' dropped here but modified on the other side",
                    theirs_col.name
                )));
            }
        }
    }

    let indexes = merge_named(
        table,
        &base.indexes,
        &ours.indexes,
        &theirs.indexes,
        |idx: &IndexDef| idx.name.clone(),
        "index",
    )?;
    let checks = merge_named(
        table,
        &base.checks,
        &ours.checks,
        &theirs.checks,
        |c: &CheckDef| c.name.clone(),
        "check constraint",
    )?;

    Ok(Schema {
        columns,
        pk_tags: base.pk_tags.clone(),
        indexes,
        checks,
    })
}

fn merge_column(
    table: &str,
    base: &Column,
    ours: &Column,
    theirs: &Column,
) -> Result<Column, MergeError> {
    if ours == theirs {
        return Ok(ours.clone());
    }
    if ours == base {
        return Ok(theirs.clone());
    }
    if theirs == base {
        return Ok(ours.clone());
    }

    // Both sides altered the column: merge attribute-wise, conflicting
    // only where the same attribute changed both ways.
    let conflict = |attr: &str| MergeError::SchemaConflict {
        table: table.to_string(),
        reason: format!("column '{}' {attr} changed on both sides", base.name),
    };

    macro_rules! pick {
        ($field:ident, $attr:expr) => {
            if ours.$field == theirs.$field {
                ours.$field.clone()
            } else if ours.$field == base.$field {
                theirs.$field.clone()
            } else if theirs.$field == base.$field {
                ours.$field.clone()
            } else {
                return Err(conflict($attr));
            }
        };
    }

    Ok(Column {
        name: pick!(name, "name"),
        ty: pick!(ty, "type"),
        nullable: pick!(nullable, "nullability"),
        default: pick!(default, "default"),
        comment: pick!(comment, "comment"),
        tag: base.tag,
    })
}

/// Three-way merge of a named definition list (indexes, checks).
fn merge_named<T: Clone + PartialEq>(
    table: &str,
    base: &[T],
    ours: &[T],
    theirs: &[T],
    key: impl Fn(&T) -> String,
    what: &str,
) -> Result<Vec<T>, MergeError> {
    let find = |items: &[T], k: &str| items.iter().find(|item| key(item) == k).cloned();

    let mut names: Vec<String> = Vec::new();
    for item in ours.iter().chain(theirs.iter()) {
        let k = key(item);
        if !names.contains(&k) {
            names.push(k);
        }
    }

    let mut merged = Vec::new();
    for name in names {
        let b = find(base, &name);
        let o = find(ours, &name);
        let t = find(theirs, &name);
        let winner = match (&b, &o, &t) {
            (_, None, None) => None,
            (None, Some(o), None) => Some(o.clone()),
            (None, None, Some(t)) => Some(t.clone()),
            (Some(b), Some(o), None) => {
                if o == b {
                    None
                } else {
                    Some(o.clone())
                }
            }
            (Some(b), None, Some(t)) => {
                if t == b {
                    None
                } else {
                    Some(t.clone())
                }
            }
            (_, Some(o), Some(t)) if o == t => Some(o.clone()),
            (Some(b), Some(o), Some(t)) => {
                if o == b {
                    Some(t.clone())
                } else if t == b {
                    Some(o.clone())
                } else {
                    return Err(MergeError::SchemaConflict {
                        table: table.to_string(),
                        reason: format!("{what} '{name}' changed on both sides"),
                    });
                }
            }
            (None, Some(_), Some(_)) => {
                return Err(MergeError::SchemaConflict {
                    table: table.to_string(),
                    reason: format!("{what} '{name}' added differently on both sides"),
                });
            }
        };
        if let Some(w) = winner {
            merged.push(w);
        }
    }
    Ok(merged)
}
