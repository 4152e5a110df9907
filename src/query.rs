//! Tabular query results and the execution seam between collector and database.

use futures::future::BoxFuture;
use std::fmt;

use crate::error::QueryError;

/// PostgreSQL type OIDs we classify. Anything not listed is `Unknown`.
pub mod oid {
    pub const BOOL: u32 = 16;
    pub const CHAR: u32 = 18;
    pub const NAME: u32 = 19;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const OID: u32 = 26;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const BPCHAR: u32 = 1042;
    pub const VARCHAR: u32 = 1043;
    pub const NUMERIC: u32 = 1700;
}

/// Coarse classification of a column's declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnClass {
    Numeric,
    Textual,
    Boolean,
    Unknown,
}

impl ColumnClass {
    pub fn from_type_oid(type_oid: u32) -> Self {
        match type_oid {
            oid::INT2 | oid::INT4 | oid::INT8 | oid::OID | oid::FLOAT4 | oid::FLOAT8
            | oid::NUMERIC => Self::Numeric,
            oid::TEXT | oid::VARCHAR | oid::BPCHAR | oid::CHAR | oid::NAME => Self::Textual,
            oid::BOOL => Self::Boolean,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ColumnClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Numeric => "numeric",
            Self::Textual => "textual",
            Self::Boolean => "boolean",
            Self::Unknown => "unknown",
        })
    }
}

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_oid: u32,
}

impl Column {
    pub fn new(name: impl Into<String>, type_oid: u32) -> Self {
        Self {
            name: name.into(),
            type_oid,
        }
    }

    pub fn class(&self) -> ColumnClass {
        ColumnClass::from_type_oid(self.type_oid)
    }
}

/// Result of one simple query: column metadata plus rows of raw text cells.
/// `None` is SQL NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    /// First cell of the first row, if present and not NULL.
    pub fn first_value(&self) -> Option<&str> {
        self.rows.first()?.first()?.as_deref()
    }
}

/// Anything that can run a statement for a tenant.
///
/// Implementations must be safe to call concurrently: one collection cycle
/// issues one query per metric against the same tenant, and overlapping
/// scrapes may run cycles side by side.
pub trait QueryExecutor: Send + Sync {
    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<QueryResult, QueryError>>;

    /// Release underlying resources at process shutdown.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}
