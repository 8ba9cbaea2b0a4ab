pub mod file;
pub mod memory;

use crate::event::{SourceEvent, SourcePosition};
use async_trait::async_trait;
use thiserror::Error;

pub use file::{FileConnector, FileSource, LogRecord};
pub use memory::{MemoryConnector, MemoryLog, MemorySource};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed record at line {line}: {message}")]
    Parse { line: u64, message: String },

    #[error("position '{0}' does not belong to this source")]
    InvalidPosition(SourcePosition),

    #[error("source closed: {0}")]
    Closed(String),
}

/// Where to begin reading the replication log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartFrom {
    /// Replay the whole log.
    Beginning,
    /// Resume strictly after an acknowledged position.
    After(SourcePosition),
    /// Replay structure only: DDL history, then live changes.
    SchemaOnly,
}

/// A lazy, ordered stream of source events.
#[async_trait]
pub trait EventSource: Send {
    /// Next event in log order, or `None` once a finite log is exhausted.
    ///
    /// Must be cancel-safe: dropping the future before it completes loses
    /// no events.
    async fn next_event(&mut self) -> Result<Option<SourceEvent>, SourceError>;
}

/// Opens restartable readers over one replication log.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn open(&self, start: StartFrom) -> Result<Box<dyn EventSource>, SourceError>;
}
