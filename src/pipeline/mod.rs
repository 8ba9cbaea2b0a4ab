pub mod coordinator;
pub mod handle;
pub mod status;
pub mod tracker;
pub mod worker;

use crate::ddl::DdlError;
use crate::sequencer::SequenceError;
use crate::source::SourceError;
use crate::storage::{CheckpointError, StoreError};
use thiserror::Error;

pub use coordinator::PipelineContext;
pub use handle::{Pipeline, PipelineHandle};
pub use status::{PipelineState, PipelineStatus, StatusBoard, TableState, TableStatus};
pub use tracker::OffsetTracker;

/// Errors that stop the whole pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("sequence error: {0}")]
    Sequence(#[from] SequenceError),

    #[error("DDL error: {0}")]
    Ddl(#[from] DdlError),

    #[error("target unavailable: {0}")]
    TargetUnavailable(String),

    #[error("timed out waiting for {0}")]
    WaitTimeout(String),

    #[error("pipeline is {0}")]
    NotRunning(PipelineState),

    #[error("pipeline task failed: {0}")]
    Task(String),
}
