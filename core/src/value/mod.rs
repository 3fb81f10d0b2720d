//! Typed SQL values.
//!
//! SQL types and values are closed tagged unions; dispatch is by tag.
//! Comparison is field-wise per the index's key order, with NULL sorting
//! before all non-NULL values.

pub mod codec;

use crate::store::StoreError;
use borsh::{BorshDeserialize, BorshSerialize};
use std::cmp::Ordering;
use thiserror::Error;

pub use codec::{
    blob_refs_in_tuple, compare_encoded, decode_key, decode_row, encode_key, encode_row,
    read_blob, write_blob, TupleKey,
};

#[derive(Error, Debug)]
pub enum ValueError {
    #[error("schema mismatch: expected schema id {expected}, found {found}")]
    SchemaMismatch { expected: u32, found: u32 },
    #[error("corrupt value encoding: {0}")]
    Corrupt(String),
    #[error("index key field too long ({0} bytes)")]
    KeyTooLong(usize),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Logical SQL column types.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, serde::Serialize,
    serde::Deserialize,
)]
pub enum SqlType {
    Boolean,
    Int,
    Uint,
    Float,
    Decimal,
    Text,
    Bytes,
    Timestamp,
}

impl SqlType {
    pub fn name(&self) -> &'static str {
        match self {
            SqlType::Boolean => "boolean",
            SqlType::Int => "bigint",
            SqlType::Uint => "bigint unsigned",
            SqlType::Float => "double",
            SqlType::Decimal => "decimal",
            SqlType::Text => "text",
            SqlType::Bytes => "blob",
            SqlType::Timestamp => "timestamp",
        }
    }
}

/// A SQL value.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize, serde::Serialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    /// Decimal rendered in its canonical string form.
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    /// Milliseconds since the Unix epoch, UTC.
    Timestamp(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Rank used to order values of different runtime variants. NULL is
    /// rank 0 and sorts first.
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Uint(_) => 3,
            Value::Float(_) => 4,
            Value::Decimal(_) => 5,
            Value::Text(_) => 6,
            Value::Bytes(_) => 7,
            Value::Timestamp(_) => 8,
        }
    }

    /// Total order over values. NULL sorts before all non-NULL values;
    /// values of the same variant compare naturally.
    pub fn compare(&self, other: &Value) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Uint(a), Uint(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Decimal(a), Decimal(b)) => compare_decimals(a, b),
            (Text(a), Text(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Whether this value is storable in a column of type `ty`. NULL fits
    /// every type; nullability is checked separately.
    pub fn fits(&self, ty: SqlType) -> bool {
        matches!(
            (self, ty),
            (Value::Null, _)
                | (Value::Bool(_), SqlType::Boolean)
                | (Value::Int(_), SqlType::Int)
                | (Value::Uint(_), SqlType::Uint)
                | (Value::Float(_), SqlType::Float)
                | (Value::Decimal(_), SqlType::Decimal)
                | (Value::Text(_), SqlType::Text)
                | (Value::Bytes(_), SqlType::Bytes)
                | (Value::Timestamp(_), SqlType::Timestamp)
        )
    }

    /// Render for result sets and system tables.
    pub fn to_sql_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Uint(u) => u.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Decimal(d) => d.clone(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => hex::encode(b),
            Value::Timestamp(millis) => chrono::DateTime::from_timestamp_millis(*millis)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
                .unwrap_or_else(|| millis.to_string()),
        }
    }
}

fn compare_decimals(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.total_cmp(&y),
        _ => a.cmp(b),
    }
}
