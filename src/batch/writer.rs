use crate::ddl::TargetDdl;
use crate::schema::TableSchema;
use crate::sequencer::VersionStamp;
use crate::storage::{StoreError, TargetStore};
use crate::transform::TargetRowOperation;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Bounded exponential backoff for transient target errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        base.mul_f64(jitter).min(self.max_backoff)
    }
}

/// Result of a successful flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub rows: usize,
    pub max_version: VersionStamp,
    /// One entry per flushed operation.
    pub tickets: Vec<u64>,
    pub attempts: u32,
}

/// A flush that could not be completed. The operations come back untouched.
#[derive(Debug, Error)]
#[error("flush of {} operations failed after {attempts} attempts: {error}", operations.len())]
pub struct FlushFailed {
    pub operations: Vec<TargetRowOperation>,
    pub error: StoreError,
    pub attempts: u32,
}

/// Executes batches and schema changes against the target store.
#[derive(Clone)]
pub struct BatchWriter {
    store: Arc<dyn TargetStore>,
    retry: RetryPolicy,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn TargetStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &Arc<dyn TargetStore> {
        &self.store
    }

    /// Write `operations` as one bulk statement, retrying transient failures.
    pub async fn flush(
        &self,
        schema: &TableSchema,
        operations: Vec<TargetRowOperation>,
    ) -> Result<FlushReport, FlushFailed> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.store.execute_bulk_write(schema, &operations).await {
                Ok(rows) => {
                    let max_version = operations
                        .iter()
                        .map(|op| op.version)
                        .max()
                        .unwrap_or(VersionStamp::ZERO);
                    debug!(
                        table = %schema.table,
                        rows,
                        max_version = max_version.get(),
                        attempt,
                        "Flushed batch"
                    );
                    return Ok(FlushReport {
                        rows,
                        max_version,
                        tickets: operations.iter().map(|op| op.ticket).collect(),
                        attempts: attempt,
                    });
                }
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        table = %schema.table,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient flush failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return Err(FlushFailed {
                        operations,
                        error,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    /// Run one schema change. Never retried.
    pub async fn execute_ddl(&self, statement: &TargetDdl) -> Result<(), StoreError> {
        self.store.execute_ddl(statement).await
    }
}
