use super::checkpoint::OffsetCheckpoint;
use crate::ddl::TargetDdl;
use crate::event::TableId;
use crate::schema::TableSchema;
use crate::sequencer::VersionStamp;
use crate::transform::TargetRowOperation;
use async_trait::async_trait;

/// Write surface of the analytical target.
///
/// Any store with bulk append and "last write wins by version column" merge
/// semantics can sit behind this trait.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Append every operation in one transaction. Returns the rows written.
    async fn execute_bulk_write(
        &self,
        schema: &TableSchema,
        operations: &[TargetRowOperation],
    ) -> Result<usize, StoreError>;

    async fn execute_ddl(&self, statement: &TargetDdl) -> Result<(), StoreError>;

    /// Highest version stamp stored for the table, or zero.
    async fn query_max_version(&self, table: &TableId) -> Result<VersionStamp, StoreError>;

    /// Table definitions persisted by earlier runs.
    async fn load_schemas(&self) -> Result<Vec<TableSchema>, StoreError>;

    async fn save_schema(&self, schema: &TableSchema) -> Result<(), StoreError>;

    async fn forget_schema(&self, table: &TableId) -> Result<(), StoreError>;
}

/// Durable home of the acknowledged source position.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn load_checkpoint(&self) -> Result<Option<OffsetCheckpoint>, StoreError>;

    async fn acknowledge(&self, checkpoint: &OffsetCheckpoint) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Connection to target lost: {0}")]
    Connection(String),

    #[error("Target operation timed out: {0}")]
    Timeout(String),

    #[error("Transient target error: {0}")]
    Transient(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Connection(_) | StoreError::Timeout(_) | StoreError::Transient(_)
        )
    }

    /// Affects every table, not just the one being written.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
