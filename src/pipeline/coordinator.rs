use super::status::{PipelineState, StatusBoard};
use super::tracker::OffsetTracker;
use super::worker::{halts, spawn_worker, FlushOutcome, FlushResult, WorkerHandle, WorkerSettings};
use super::PipelineError;
use crate::batch::{Admission, BatchAccumulator, BatchWriter};
use crate::config::{Config, SnapshotMode};
use crate::ddl::{DdlCommand, DdlError, DdlTranslator, TargetDdl};
use crate::event::{ChangeEvent, DdlEvent, SourceEvent, SourcePosition, TableId};
use crate::schema::{RegistryChange, SchemaRegistry};
use crate::sequencer::{SequenceAssigner, VersionStamp};
use crate::source::{EventSource, SourceConnector, StartFrom};
use crate::storage::{CheckpointError, CheckpointManager, TargetStore};
use crate::transform::{PendingQueue, RecordTransformer, TargetRowOperation};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// State shared by every component of one pipeline instance.
pub struct PipelineContext {
    pub instance_id: Uuid,
    pub config: Arc<Config>,
    pub registry: Arc<SchemaRegistry>,
    /// Touched only by the ingestion task.
    pub assigner: SequenceAssigner,
}

pub(crate) struct Channels {
    pub board: Arc<StatusBoard>,
    pub cancel: CancellationToken,
    pub state: watch::Sender<PipelineState>,
    pub checkpoint: watch::Sender<Option<SourcePosition>>,
}

/// The ingestion task: reads the source in order, routes events, and owns
/// every decision about faults and checkpoints.
pub(crate) struct Coordinator {
    ctx: PipelineContext,
    connector: Arc<dyn SourceConnector>,
    store: Arc<dyn TargetStore>,
    transformer: RecordTransformer,
    translator: DdlTranslator,
    pending: PendingQueue,
    accumulator: BatchAccumulator,
    writer: BatchWriter,
    checkpoints: CheckpointManager,
    tracker: OffsetTracker,
    workers: HashMap<TableId, WorkerHandle>,
    worker_settings: WorkerSettings,
    outcome_tx: mpsc::UnboundedSender<FlushOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<FlushOutcome>,
    /// Released position whose acknowledgement failed transiently.
    unacknowledged: Option<SourcePosition>,
    channels: Channels,
}

impl Coordinator {
    pub fn new(
        ctx: PipelineContext,
        connector: Arc<dyn SourceConnector>,
        store: Arc<dyn TargetStore>,
        checkpoints: CheckpointManager,
        channels: Channels,
    ) -> Self {
        let config = ctx.config.clone();
        let default_database = config
            .source
            .database
            .clone()
            .unwrap_or_else(|| "main".to_string());
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        Self {
            transformer: RecordTransformer::new(ctx.registry.clone()),
            translator: DdlTranslator::new(ctx.registry.clone(), default_database),
            pending: PendingQueue::new(config.schema.max_retries, config.schema.max_pending_events),
            accumulator: BatchAccumulator::new(config.batch.flush_policy()),
            writer: BatchWriter::new(store.clone(), config.writer.retry_policy()),
            worker_settings: WorkerSettings {
                check_interval: config.batch.check_interval,
                on_failure: config.writer.on_failure,
                rebuffer_delay: config.writer.rebuffer_delay,
            },
            tracker: OffsetTracker::new(),
            workers: HashMap::new(),
            unacknowledged: None,
            ctx,
            connector,
            store,
            checkpoints,
            outcome_tx,
            outcome_rx,
            channels,
        }
    }

    pub async fn run(mut self) -> Result<(), PipelineError> {
        let result = self.execute().await;
        match &result {
            Ok(()) => {
                self.set_state(PipelineState::Stopped);
                info!("Pipeline stopped");
            }
            Err(e) => {
                error!(error = %e, "Pipeline faulted");
                self.channels.board.fault(e.to_string());
                self.channels.state.send_replace(PipelineState::Faulted);
            }
        }
        result
    }

    async fn execute(&mut self) -> Result<(), PipelineError> {
        let mut source = self.initialize().await?;
        self.set_state(PipelineState::Running);

        let ingested = self.ingest(&mut source).await;
        drop(source);

        match ingested {
            Ok(()) => self.drain().await,
            Err(e) => {
                for worker in self.workers.values() {
                    worker.task.abort();
                }
                Err(e)
            }
        }
    }

    fn set_state(&self, state: PipelineState) {
        self.channels.board.set_state(state);
        self.channels.state.send_replace(state);
    }

    /// Load schemas and the checkpoint, seed the assigner, and open the source.
    async fn initialize(&mut self) -> Result<Box<dyn EventSource>, PipelineError> {
        let schemas = self.store.load_schemas().await?;
        info!(tables = schemas.len(), "Loaded schema catalog");
        self.ctx.registry.load(schemas);

        let checkpoint = self.checkpoints.load().await?;
        let mut seed = checkpoint
            .as_ref()
            .map_or(VersionStamp::ZERO, |c| c.max_version);
        for schema in self.ctx.registry.tables() {
            seed = seed.max(self.store.query_max_version(&schema.table).await?);
        }
        self.ctx.assigner = SequenceAssigner::seeded(seed);

        let start = match checkpoint {
            Some(checkpoint) => {
                self.channels
                    .board
                    .set_acknowledged(checkpoint.position.clone(), seed);
                self.channels
                    .checkpoint
                    .send_replace(Some(checkpoint.position.clone()));
                StartFrom::After(checkpoint.position)
            }
            None => match self.ctx.config.source.snapshot_mode {
                SnapshotMode::Initial => StartFrom::Beginning,
                SnapshotMode::SchemaOnly => StartFrom::SchemaOnly,
            },
        };

        info!(seed = seed.get(), ?start, "Pipeline initialized");
        Ok(self.connector.open(start).await?)
    }

    async fn ingest(&mut self, source: &mut Box<dyn EventSource>) -> Result<(), PipelineError> {
        let mut exhausted = false;

        loop {
            tokio::select! {
                biased;

                _ = self.channels.cancel.cancelled() => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                Some(outcome) = self.outcome_rx.recv() => {
                    self.on_flush_outcome(outcome).await?;
                }
                next = source.next_event(), if !exhausted => match next? {
                    Some(event) => self.on_event(event).await?,
                    None => {
                        info!("Source exhausted, waiting for outstanding flushes");
                        exhausted = true;
                    }
                },
            }
        }
    }

    async fn on_event(&mut self, event: SourceEvent) -> Result<(), PipelineError> {
        let ticket = self.tracker.register(event.position().clone());
        match event {
            SourceEvent::Change(change) => self.on_change(change, ticket).await?,
            SourceEvent::Ddl(ddl) => self.on_ddl(ddl, ticket).await?,
        }
        self.acknowledge().await
    }

    async fn on_change(&mut self, change: ChangeEvent, ticket: u64) -> Result<(), PipelineError> {
        let table = change.table.clone();
        if !self.ctx.config.source.includes(&table) {
            self.tracker.attach(ticket, 0);
            return Ok(());
        }
        if self.channels.board.is_faulted(&table) {
            self.hold(&table, ticket);
            return Ok(());
        }

        let version = self.ctx.assigner.assign()?;

        if self.pending.is_blocked(&table) {
            self.queue_pending(change, version, ticket, "waiting behind earlier events");
            return Ok(());
        }

        match self.transformer.transform(&change, version, ticket) {
            Ok(ops) => {
                self.tracker.attach(ticket, ops.len());
                self.buffer_all(ops).await;
            }
            Err(err) if err.is_recoverable() => {
                debug!(
                    table = %table,
                    position = %change.position,
                    error = %err,
                    "Event waits for a schema change"
                );
                self.queue_pending(change, version, ticket, err.to_string());
            }
            Err(err) => {
                self.fault_table(&table, &err.to_string());
                self.hold(&table, ticket);
            }
        }
        Ok(())
    }

    fn queue_pending(
        &mut self,
        change: ChangeEvent,
        version: VersionStamp,
        ticket: u64,
        reason: impl Into<String>,
    ) {
        let table = change.table.clone();
        if let Err(err) = self.pending.push(change, version, ticket, reason) {
            self.fault_table(&table, &err.to_string());
            self.hold(&table, ticket);
        }
        self.channels
            .board
            .set_pending(&table, self.pending.len(&table));
    }

    /// Hand operations to their table buffers. A full buffer parks rows
    /// without waiting; only a table whose parking area is also full stalls
    /// ingestion.
    async fn buffer_all(&mut self, ops: Vec<TargetRowOperation>) {
        for op in ops {
            let table = op.table.clone();
            let ticket = op.ticket;
            let buffer = self.worker_for(&table).buffer.clone();
            let op = match buffer.try_add(op) {
                Ok(Admission::Buffered | Admission::Parked) => continue,
                Ok(Admission::Full(op)) => op,
                Err(_) => {
                    self.hold(&table, ticket);
                    continue;
                }
            };

            warn!(table = %table, "Table at its buffer cap, ingestion waits for its flushes");
            tokio::select! {
                added = buffer.add(op) => {
                    if added.is_err() {
                        self.hold(&table, ticket);
                    }
                }
                _ = self.channels.cancel.cancelled() => {
                    warn!(table = %table, "Shutdown while waiting for buffer capacity");
                }
            }
        }
    }

    fn hold(&mut self, table: &TableId, ticket: u64) {
        self.channels.board.hold_event(table);
        self.tracker.hold(ticket);
    }

    fn worker_for(&mut self, table: &TableId) -> &WorkerHandle {
        if !self.workers.contains_key(table) {
            let (buffer, _) = self.accumulator.get_or_create(table);
            self.channels.board.attach_buffer(table, buffer.clone());
            let handle = spawn_worker(
                buffer,
                self.ctx.registry.clone(),
                self.writer.clone(),
                self.worker_settings.clone(),
                self.outcome_tx.clone(),
            );
            debug!(table = %table, "Spawned flush worker");
            self.workers.insert(table.clone(), handle);
        }
        &self.workers[table]
    }

    async fn on_ddl(&mut self, event: DdlEvent, ticket: u64) -> Result<(), PipelineError> {
        let parsed = match self.translator.parse(&event) {
            Ok(parsed) => parsed,
            Err(err) => return self.reject_ddl(err, ticket),
        };

        let tables = parsed.tables();
        let source = &self.ctx.config.source;
        if matches!(parsed.command, DdlCommand::Ignored)
            || (!tables.is_empty() && tables.iter().all(|t| !source.includes(t)))
        {
            debug!(statement = %event.statement, "Skipping DDL");
            self.tracker.attach(ticket, 0);
            return Ok(());
        }
        if let Some(faulted) = tables.iter().find(|t| self.channels.board.is_faulted(t)) {
            warn!(table = %faulted, statement = %event.statement, "Holding DDL for faulted table");
            self.hold(faulted, ticket);
            return Ok(());
        }

        // Data buffered under the old schema goes out first.
        for table in &tables {
            if !self.drain_for_ddl(table).await? {
                self.hold(table, ticket);
                self.end_ddl_drain(&tables);
                return Ok(());
            }
        }

        let translation = match self.translator.translate(&parsed) {
            Ok(translation) => translation,
            Err(err) => {
                self.end_ddl_drain(&tables);
                return self.reject_ddl(err, ticket);
            }
        };

        for statement in &translation.statements {
            if let Err(err) = self.writer.execute_ddl(statement).await {
                if err.is_connectivity() {
                    return Err(PipelineError::TargetUnavailable(err.to_string()));
                }
                error!(statement = ?statement, error = %err, "Target rejected DDL");
                for table in &tables {
                    self.fault_table(table, &format!("DDL failed: {}", err));
                }
                if let Some(table) = tables.first() {
                    self.hold(table, ticket);
                }
                self.end_ddl_drain(&tables);
                return Ok(());
            }
        }
        self.persist_catalog(&translation.changes).await?;

        for statement in &translation.statements {
            match statement {
                TargetDdl::RenameTable { from, to } => {
                    self.retire_table(from);
                    self.pending.rename(from, to);
                    self.channels.board.set_pending(to, self.pending.len(to));
                }
                TargetDdl::DropTable(table) => self.retire_table(table),
                _ => {}
            }
        }
        self.end_ddl_drain(&tables);

        info!(
            statement = %event.statement,
            position = %event.position,
            statements = translation.statements.len(),
            "Applied DDL"
        );
        self.tracker.attach(ticket, 0);

        for table in &tables {
            self.release_pending(table).await;
        }
        Ok(())
    }

    fn reject_ddl(&mut self, err: DdlError, ticket: u64) -> Result<(), PipelineError> {
        match err.table().cloned() {
            Some(table) => {
                self.fault_table(&table, &err.to_string());
                self.hold(&table, ticket);
                Ok(())
            }
            None => Err(err.into()),
        }
    }

    /// Flush `table` completely before a schema change. `false` means the
    /// table could not be flushed and the DDL must wait.
    async fn drain_for_ddl(&mut self, table: &TableId) -> Result<bool, PipelineError> {
        let Some(worker) = self.workers.get(table) else {
            return Ok(true);
        };
        worker.buffer.mark_pending_ddl(true);
        let policy = self.worker_settings.on_failure;
        let delay = self.worker_settings.rebuffer_delay;

        loop {
            let Some(worker) = self.workers.get(table) else {
                return Ok(true);
            };
            let Some(result) = worker.flush_now().await else {
                self.fault_table(table, "flush worker stopped");
                return Ok(false);
            };

            let buffer = worker.buffer.clone();
            let halted = matches!(&result, Err(failed) if halts(policy, failed));
            let failed = result.is_err();
            self.apply_flush_result(table, &result, halted)?;
            self.acknowledge().await?;
            if halted || buffer.is_closed() {
                return Ok(false);
            }
            if !failed {
                // Parked rows were promoted by the flush and go out next.
                if buffer.is_empty() {
                    return Ok(true);
                }
                continue;
            }

            warn!(table = %table, delay_ms = delay.as_millis() as u64, "Retrying flush before DDL");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.channels.cancel.cancelled() => return Ok(false),
            }
        }
    }

    fn end_ddl_drain(&self, tables: &[TableId]) {
        for table in tables {
            if let Some(worker) = self.workers.get(table) {
                worker.buffer.mark_pending_ddl(false);
            }
        }
    }

    async fn persist_catalog(&self, changes: &[RegistryChange]) -> Result<(), PipelineError> {
        for change in changes {
            match change {
                RegistryChange::Put(schema) => self.store.save_schema(schema).await?,
                RegistryChange::Remove(table) => self.store.forget_schema(table).await?,
            }
        }
        Ok(())
    }

    /// Stop tracking a table that no longer exists under this name.
    fn retire_table(&mut self, table: &TableId) {
        if let Some(worker) = self.workers.remove(table) {
            worker.shutdown();
        }
        self.accumulator.remove(table);
        if !self.channels.board.is_faulted(table) {
            self.channels.board.forget_table(table);
        }
    }

    async fn release_pending(&mut self, table: &TableId) {
        if !self.pending.is_blocked(table) {
            return;
        }
        let outcome = self.pending.retry(table, &self.transformer);
        for (ticket, ops) in &outcome.released {
            self.tracker.attach(*ticket, *ops);
        }
        if !outcome.released.is_empty() {
            debug!(table = %table, events = outcome.released.len(), "Released waiting events");
        }
        self.buffer_all(outcome.ready).await;

        if let Some(err) = outcome.error {
            self.fault_table(table, &err.to_string());
        }
        self.channels
            .board
            .set_pending(table, self.pending.len(table));
    }

    async fn on_flush_outcome(&mut self, outcome: FlushOutcome) -> Result<(), PipelineError> {
        self.apply_flush_result(&outcome.table, &outcome.result, outcome.halted)?;
        self.acknowledge().await
    }

    fn apply_flush_result(
        &mut self,
        table: &TableId,
        result: &FlushResult,
        halted: bool,
    ) -> Result<(), PipelineError> {
        match result {
            Ok(report) => {
                if !report.tickets.is_empty() {
                    self.channels.board.record_flush(table, report.tickets.len());
                }
                for ticket in &report.tickets {
                    self.tracker.complete(*ticket, 1);
                }
                Ok(())
            }
            Err(failed) => {
                self.channels
                    .board
                    .record_flush_error(table, failed.to_string());
                if failed.error.is_connectivity() {
                    return Err(PipelineError::TargetUnavailable(failed.error.to_string()));
                }
                if halted {
                    self.fault_table(table, &format!("flush failed: {}", failed));
                }
                Ok(())
            }
        }
    }

    fn fault_table(&mut self, table: &TableId, reason: &str) {
        if self.channels.board.is_faulted(table) {
            return;
        }
        error!(table = %table, reason, "Table faulted, its events are held until restart");
        self.channels.board.fault_table(table, reason);
        if let Some(buffer) = self.accumulator.get(table) {
            buffer.close();
        }
    }

    /// Move the checkpoint over every event whose operations are durable.
    async fn acknowledge(&mut self) -> Result<(), PipelineError> {
        let Some(position) = self.tracker.advance().or_else(|| self.unacknowledged.take()) else {
            return Ok(());
        };
        let version = self.ctx.assigner.current();

        match self.checkpoints.acknowledge(&position, version).await {
            Ok(_) => {
                self.channels
                    .board
                    .set_acknowledged(position.clone(), version);
                self.channels.checkpoint.send_replace(Some(position));
                Ok(())
            }
            Err(CheckpointError::Storage(e)) if e.is_connectivity() => {
                Err(PipelineError::TargetUnavailable(e.to_string()))
            }
            Err(CheckpointError::Storage(e)) if e.is_transient() => {
                warn!(position = %position, error = %e, "Acknowledgement deferred");
                self.unacknowledged = Some(position);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stop reading, let workers flush what they hold, and record what is left.
    async fn drain(&mut self) -> Result<(), PipelineError> {
        self.set_state(PipelineState::Draining);
        let timeout = self.ctx.config.pipeline.shutdown_timeout;
        info!(
            tables = self.workers.len(),
            unflushed = self.accumulator.total_unflushed(),
            "Draining buffers"
        );

        let mut tasks = Vec::with_capacity(self.workers.len());
        for (_, worker) in self.workers.drain() {
            worker.shutdown();
            tasks.push(worker.task);
        }

        let joined = tokio::time::timeout(timeout, join_all(tasks.iter_mut())).await;
        if joined.is_err() {
            warn!(timeout_ms = timeout.as_millis() as u64, "Shutdown timeout reached, abandoning in-flight flushes");
            for task in &tasks {
                task.abort();
            }
        }

        while let Ok(outcome) = self.outcome_rx.try_recv() {
            self.apply_flush_result(&outcome.table, &outcome.result, outcome.halted)?;
        }
        self.acknowledge().await?;

        let outstanding = self.tracker.outstanding();
        if outstanding > 0 {
            warn!(
                events = outstanding,
                oldest = ?self.tracker.oldest_outstanding(),
                unflushed = self.accumulator.total_unflushed(),
                pending = self.pending.total(),
                "Events not committed; they will be replayed from the checkpoint on restart"
            );
        }
        Ok(())
    }
}
