pub mod value;

pub use value::{Row, Value};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a source table, which is also the identity of its target table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    pub schema: String,
    pub name: String,
}

impl TableId {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Opaque position in the source log.
///
/// Positions compare lexically, and lexical order must equal log order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourcePosition(String);

impl SourcePosition {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Position token for the n-th record of an index-addressed log.
    pub fn from_index(index: u64) -> Self {
        Self(format!("{:020}", index))
    }

    /// Inverse of [`SourcePosition::from_index`].
    pub fn index(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Row-level operation kind as emitted by the replication log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    #[serde(alias = "c", rename = "insert")]
    Insert,
    #[serde(alias = "u", rename = "update")]
    Update,
    #[serde(alias = "d", rename = "delete")]
    Delete,
    #[serde(alias = "r", rename = "snapshot-read")]
    SnapshotRead,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::SnapshotRead => "snapshot-read",
        };
        f.write_str(s)
    }
}

/// One row-level mutation captured from the source.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: TableId,
    pub op: Operation,
    /// New column values. Empty for most deletes.
    pub after: Row,
    /// Previous column values, when the source provides them.
    pub before: Option<Row>,
    pub position: SourcePosition,
    /// Source commit time in milliseconds. Not unique per key.
    pub source_ts_ms: i64,
}

impl ChangeEvent {
    /// Columns the event carries values for, after- and before-image combined.
    pub fn referenced_columns(&self) -> impl Iterator<Item = &str> {
        self.after
            .names()
            .chain(self.before.iter().flat_map(|b| b.names()))
    }
}

/// A schema-altering statement captured from the source.
#[derive(Debug, Clone, PartialEq)]
pub struct DdlEvent {
    /// Database the statement ran in; qualifies unqualified table names.
    pub database: Option<String>,
    pub statement: String,
    pub position: SourcePosition,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Change(ChangeEvent),
    Ddl(DdlEvent),
}

impl SourceEvent {
    pub fn position(&self) -> &SourcePosition {
        match self {
            SourceEvent::Change(e) => &e.position,
            SourceEvent::Ddl(e) => &e.position,
        }
    }

    pub fn is_ddl(&self) -> bool {
        matches!(self, SourceEvent::Ddl(_))
    }
}
