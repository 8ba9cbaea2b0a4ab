use super::traits::{OffsetStore, StoreError};
use crate::event::SourcePosition;
use crate::sequencer::VersionStamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

const CURRENT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Checkpoint would move backwards from {current} to {requested}")]
    Regression {
        current: SourcePosition,
        requested: SourcePosition,
    },
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// "Everything up to and including `position` is durably in the target."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetCheckpoint {
    pub version: u32,
    pub position: SourcePosition,
    pub acknowledged_at: DateTime<Utc>,
    /// Pipeline instance that wrote the checkpoint.
    pub instance_id: Uuid,
    /// Highest stamp handed out when the checkpoint was taken.
    pub max_version: VersionStamp,
}

/// Forward-only acknowledgement of source positions.
pub struct CheckpointManager {
    store: Arc<dyn OffsetStore>,
    instance_id: Uuid,
    last: Option<SourcePosition>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn OffsetStore>, instance_id: Uuid) -> Self {
        Self {
            store,
            instance_id,
            last: None,
        }
    }

    pub async fn load(&mut self) -> Result<Option<OffsetCheckpoint>> {
        tracing::info!("Loading offset checkpoint");

        match self.store.load_checkpoint().await? {
            Some(checkpoint) if checkpoint.version != CURRENT_VERSION => {
                tracing::warn!(
                    found = checkpoint.version,
                    expected = CURRENT_VERSION,
                    "Checkpoint version mismatch, starting without a checkpoint"
                );
                Ok(None)
            }
            Some(checkpoint) => {
                tracing::info!(
                    position = %checkpoint.position,
                    acknowledged_at = %checkpoint.acknowledged_at,
                    "Loaded offset checkpoint"
                );
                self.last = Some(checkpoint.position.clone());
                Ok(Some(checkpoint))
            }
            None => {
                tracing::info!("No offset checkpoint found");
                Ok(None)
            }
        }
    }

    /// Persist `position`. Acknowledging the current position again is a no-op.
    pub async fn acknowledge(
        &mut self,
        position: &SourcePosition,
        max_version: VersionStamp,
    ) -> Result<bool> {
        match &self.last {
            Some(last) if last == position => return Ok(false),
            Some(last) if last > position => {
                return Err(CheckpointError::Regression {
                    current: last.clone(),
                    requested: position.clone(),
                })
            }
            _ => {}
        }

        let checkpoint = OffsetCheckpoint {
            version: CURRENT_VERSION,
            position: position.clone(),
            acknowledged_at: Utc::now(),
            instance_id: self.instance_id,
            max_version,
        };
        self.store.acknowledge(&checkpoint).await?;
        self.last = Some(position.clone());
        tracing::debug!(position = %position, "Offset acknowledged");
        Ok(true)
    }

    pub fn last(&self) -> Option<&SourcePosition> {
        self.last.as_ref()
    }
}
