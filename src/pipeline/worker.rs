use crate::batch::{BatchWriter, FlushFailed, FlushReport, TableBuffer};
use crate::config::FailurePolicy;
use crate::event::TableId;
use crate::schema::SchemaRegistry;
use crate::storage::StoreError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub(crate) type FlushResult = Result<FlushReport, FlushFailed>;

/// A finished flush, reported back to the coordinator.
#[derive(Debug)]
pub(crate) struct FlushOutcome {
    pub table: TableId,
    pub result: FlushResult,
    /// Set when the worker stopped after this outcome.
    pub halted: bool,
}

#[derive(Debug)]
pub(crate) enum WorkerCommand {
    /// Flush everything buffered now and reply with the result.
    FlushNow(oneshot::Sender<FlushResult>),
    /// Flush what is left, then exit.
    Shutdown,
}

#[derive(Debug, Clone)]
pub(crate) struct WorkerSettings {
    pub check_interval: Duration,
    pub on_failure: FailurePolicy,
    pub rebuffer_delay: Duration,
}

/// Whether a failed flush stops the table under `policy`.
pub(crate) fn halts(policy: FailurePolicy, failed: &FlushFailed) -> bool {
    failed.error.is_connectivity() || policy == FailurePolicy::Halt
}

pub(crate) struct WorkerHandle {
    pub buffer: Arc<TableBuffer>,
    pub commands: mpsc::UnboundedSender<WorkerCommand>,
    pub task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask for an immediate flush. `None` if the worker has already exited.
    pub async fn flush_now(&self) -> Option<FlushResult> {
        let (reply, response) = oneshot::channel();
        self.commands.send(WorkerCommand::FlushNow(reply)).ok()?;
        response.await.ok()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(WorkerCommand::Shutdown);
    }
}

/// Start the flush worker that owns the draining side of `buffer`.
pub(crate) fn spawn_worker(
    buffer: Arc<TableBuffer>,
    registry: Arc<SchemaRegistry>,
    writer: BatchWriter,
    settings: WorkerSettings,
    outcomes: mpsc::UnboundedSender<FlushOutcome>,
) -> WorkerHandle {
    let (commands, command_rx) = mpsc::unbounded_channel();
    let worker = FlushWorker {
        table: buffer.table().clone(),
        buffer: buffer.clone(),
        registry,
        writer,
        settings,
        outcomes,
        resume_at: None,
    };
    let task = tokio::spawn(worker.run(command_rx));
    WorkerHandle {
        buffer,
        commands,
        task,
    }
}

struct FlushWorker {
    table: TableId,
    buffer: Arc<TableBuffer>,
    registry: Arc<SchemaRegistry>,
    writer: BatchWriter,
    settings: WorkerSettings,
    outcomes: mpsc::UnboundedSender<FlushOutcome>,
    /// Background flushes wait until then after a rebuffered failure.
    resume_at: Option<Instant>,
}

enum Step {
    Continue,
    Halt,
}

impl FlushWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
        let mut tick = interval(self.settings.check_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(table = %self.table, "Flush worker started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(WorkerCommand::FlushNow(reply)) => {
                        let result = self.flush().await;
                        let step = self.settle(&result);
                        let _ = reply.send(result);
                        if matches!(step, Step::Halt) {
                            return;
                        }
                    }
                    Some(WorkerCommand::Shutdown) | None => break,
                },
                _ = self.buffer.notified() => {
                    if self.flush_due() && matches!(self.background_flush().await, Step::Halt) {
                        return;
                    }
                }
                _ = tick.tick() => {
                    if self.flush_due() && matches!(self.background_flush().await, Step::Halt) {
                        return;
                    }
                }
            }
        }

        // Parked rows move into the buffer as each flush completes.
        while self.buffer.stats().buffered > 0 {
            info!(table = %self.table, "Flushing remaining rows before shutdown");
            if matches!(self.background_flush().await, Step::Halt) || self.resume_at.is_some() {
                break;
            }
        }
        debug!(table = %self.table, "Flush worker stopped");
    }

    fn flush_due(&self) -> bool {
        if self.resume_at.is_some_and(|at| Instant::now() < at) {
            return false;
        }
        self.buffer.should_flush()
    }

    async fn background_flush(&mut self) -> Step {
        let result = self.flush().await;
        let step = self.settle(&result);
        let _ = self.outcomes.send(FlushOutcome {
            table: self.table.clone(),
            result,
            halted: matches!(step, Step::Halt),
        });
        step
    }

    async fn flush(&mut self) -> FlushResult {
        let operations = self.buffer.drain();
        if operations.is_empty() {
            return Ok(FlushReport {
                rows: 0,
                max_version: crate::sequencer::VersionStamp::ZERO,
                tickets: Vec::new(),
                attempts: 0,
            });
        }

        let Some(schema) = self.registry.get(&self.table) else {
            return Err(FlushFailed {
                operations,
                error: StoreError::Schema(format!("table {} is not registered", self.table)),
                attempts: 0,
            });
        };
        self.writer.flush(&schema, operations).await
    }

    /// Release capacity on success, or put the batch back and apply the
    /// failure policy.
    fn settle(&mut self, result: &FlushResult) -> Step {
        match result {
            Ok(report) => {
                self.buffer.complete(report.tickets.len());
                self.resume_at = None;
                Step::Continue
            }
            Err(failed) => {
                self.buffer.requeue(failed.operations.clone());
                if halts(self.settings.on_failure, failed) {
                    error!(
                        table = %self.table,
                        attempts = failed.attempts,
                        error = %failed.error,
                        "Flush failed, halting table"
                    );
                    self.buffer.close();
                    Step::Halt
                } else {
                    warn!(
                        table = %self.table,
                        attempts = failed.attempts,
                        error = %failed.error,
                        delay_ms = self.settings.rebuffer_delay.as_millis() as u64,
                        "Flush failed, batch rebuffered"
                    );
                    self.resume_at = Some(Instant::now() + self.settings.rebuffer_delay);
                    Step::Continue
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{FlushPolicy, RetryPolicy};
    use crate::ddl::TargetDdl;
    use crate::event::Value;
    use crate::schema::{ColumnSchema, TableSchema, TargetType};
    use crate::sequencer::VersionStamp;
    use crate::storage::TargetStore;
    use crate::transform::{RowKind, TargetRowOperation};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Rejects the first `failures` bulk writes with a non-retryable error.
    struct RejectingStore {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TargetStore for RejectingStore {
        async fn execute_bulk_write(
            &self,
            _schema: &TableSchema,
            operations: &[TargetRowOperation],
        ) -> Result<usize, StoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(StoreError::Database("constraint violated".into()));
            }
            Ok(operations.len())
        }

        async fn execute_ddl(&self, _statement: &TargetDdl) -> Result<(), StoreError> {
            Ok(())
        }

        async fn query_max_version(&self, _table: &TableId) -> Result<VersionStamp, StoreError> {
            Ok(VersionStamp::ZERO)
        }

        async fn load_schemas(&self) -> Result<Vec<TableSchema>, StoreError> {
            Ok(Vec::new())
        }

        async fn save_schema(&self, _schema: &TableSchema) -> Result<(), StoreError> {
            Ok(())
        }

        async fn forget_schema(&self, _table: &TableId) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn table() -> TableId {
        TableId::new("db", "t")
    }

    fn op(v: u64) -> TargetRowOperation {
        TargetRowOperation {
            table: table(),
            kind: RowKind::Upsert,
            values: vec![("id", Value::Int(v as i64))].into_iter().collect(),
            version: VersionStamp(v),
            deleted: false,
            ticket: v,
        }
    }

    fn setup(
        failures: u32,
        on_failure: FailurePolicy,
    ) -> (WorkerHandle, mpsc::UnboundedReceiver<FlushOutcome>) {
        let registry = Arc::new(SchemaRegistry::new());
        registry.replace(TableSchema {
            table: table(),
            columns: vec![ColumnSchema::new("id", TargetType::Integer, false)],
            primary_key: vec!["id".to_string()],
        });
        let buffer = Arc::new(TableBuffer::new(
            table(),
            FlushPolicy {
                max_rows: 2,
                max_bytes: usize::MAX,
                max_latency: Duration::from_secs(60),
                max_buffered_rows: 10,
                max_parked_rows: 10,
            },
        ));
        let store = Arc::new(RejectingStore {
            failures,
            calls: AtomicU32::new(0),
        });
        let writer = BatchWriter::new(
            store,
            RetryPolicy {
                max_attempts: 1,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
            },
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_worker(
            buffer,
            registry,
            writer,
            WorkerSettings {
                check_interval: Duration::from_millis(5),
                on_failure,
                rebuffer_delay: Duration::from_millis(30),
            },
            tx,
        );
        (handle, rx)
    }

    #[tokio::test]
    async fn test_rebuffered_batch_is_retried_later() {
        let (handle, mut outcomes) = setup(1, FailurePolicy::Rebuffer);
        handle.buffer.add(op(1)).await.unwrap();
        handle.buffer.add(op(2)).await.unwrap();

        let first = outcomes.recv().await.unwrap();
        assert!(first.result.is_err());
        assert!(!first.halted);

        let second = outcomes.recv().await.unwrap();
        assert_eq!(second.result.unwrap().tickets, vec![1, 2]);
        assert_eq!(handle.buffer.stats().in_flight, 0);
        assert!(handle.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_halt_closes_buffer_and_keeps_rows() {
        let (handle, mut outcomes) = setup(u32::MAX, FailurePolicy::Halt);
        handle.buffer.add(op(1)).await.unwrap();
        handle.buffer.add(op(2)).await.unwrap();

        let outcome = outcomes.recv().await.unwrap();
        assert!(outcome.halted);
        assert!(handle.buffer.is_closed());
        assert_eq!(handle.buffer.stats().buffered, 2);
        assert!(handle.buffer.add(op(3)).await.is_err());
        assert!(handle.flush_now().await.is_none());
    }

    #[tokio::test]
    async fn test_flush_now_replies_with_result() {
        let (handle, _outcomes) = setup(0, FailurePolicy::Halt);
        handle.buffer.add(op(1)).await.unwrap();

        let report = handle.flush_now().await.unwrap().unwrap();
        assert_eq!(report.tickets, vec![1]);

        handle.shutdown();
        handle.task.await.unwrap();
    }
}
