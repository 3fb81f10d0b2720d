//! Session-level errors and their MySQL-compatible codes.

use thiserror::Error;
use tributary_core::db::DbError;
use tributary_core::merge::MergeError;
use tributary_core::model::ModelError;
use tributary_core::refs::RefError;
use tributary_core::remote::RemoteError;
use tributary_core::store::StoreError;
use tributary_core::value::ValueError;

#[derive(Error, Debug)]
pub enum SessionError {
    // Wrapped core errors.
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Ref(#[from] RefError),

    // User errors: bad SQL surface usage. Never fatal to the session.
    #[error("{0}")]
    Usage(String),
    #[error("unknown procedure: '{0}'")]
    UnknownProcedure(String),
    #[error("unknown option: '{0}'")]
    UnknownOption(String),
    #[error("table not found: '{0}'")]
    UnknownTable(String),
    #[error("row not found in table '{0}'")]
    RowNotFound(String),
    #[error("table already exists: '{0}'")]
    TableExists(String),
    #[error("duplicate primary key given in table '{0}'")]
    DuplicateKey(String),
    #[error("duplicate entry for unique index '{0}'")]
    DuplicateUnique(String),
    #[error("column '{0}' cannot be null")]
    NullViolation(String),
    #[error("column count does not match value count")]
    ArityMismatch,
    #[error("value does not match the type of column '{0}'")]
    BadColumnValue(String),

    // Version-control user errors.
    #[error("commit message required; pass -m")]
    MissingMessage,
    #[error("--allow-empty and --skip-empty are mutually exclusive")]
    AllowSkipEmpty,
    #[error("nothing to commit")]
    NothingToCommit,
    #[error("table '{0}' has unresolved conflicts or constraint violations")]
    UnresolvedConflicts(String),
    #[error("no merge in progress")]
    NotMerging,
    #[error("a merge is already in progress; commit or abort it first")]
    AlreadyMerging,
    #[error("local uncommitted changes to table '{0}' would be overwritten by merge")]
    WouldOverwrite(String),
    #[error("the branch head moved during this transaction; retry")]
    TransactionConflict,
    #[error("cannot write in detached HEAD state")]
    DetachedHead,
}

impl SessionError {
    /// MySQL-compatible error code, where one applies.
    pub fn mysql_code(&self) -> Option<u16> {
        Some(match self {
            SessionError::DuplicateKey(_) | SessionError::DuplicateUnique(_) => 1062,
            SessionError::NullViolation(_) => 1048,
            SessionError::UnknownTable(_) => 1146,
            SessionError::TableExists(_) => 1050,
            SessionError::ArityMismatch => 1136,
            SessionError::BadColumnValue(_) => 1366,
            SessionError::UnknownProcedure(_) => 1305,
            _ => return None,
        })
    }

    /// Whether this error leaves the session usable (spec: user errors
    /// and conflicts never abort the session).
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self,
            SessionError::Db(_) | SessionError::Store(_) | SessionError::Model(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mysql_codes() {
        assert_eq!(
            SessionError::DuplicateKey("t".into()).mysql_code(),
            Some(1062)
        );
        assert_eq!(
            SessionError::UnknownTable("t".into()).mysql_code(),
            Some(1146)
        );
        assert_eq!(SessionError::MissingMessage.mysql_code(), None);
    }
}
