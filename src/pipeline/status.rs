use crate::batch::TableBuffer;
use crate::event::{SourcePosition, TableId};
use crate::schema::SchemaRegistry;
use crate::sequencer::VersionStamp;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// Lifecycle of one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Initializing,
    Running,
    Draining,
    Stopped,
    Faulted,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Faulted)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Initializing => "initializing",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Stopped => "stopped",
            PipelineState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableState {
    Running,
    Faulted,
}

#[derive(Debug, Default)]
struct TableEntry {
    faulted: bool,
    error: Option<String>,
    last_flush_error: Option<String>,
    last_flush_at: Option<DateTime<Utc>>,
    rows_flushed: u64,
    pending_events: usize,
    held_events: u64,
    buffer: Option<Arc<TableBuffer>>,
}

#[derive(Debug)]
struct Inner {
    state: PipelineState,
    error: Option<String>,
    last_acknowledged: Option<SourcePosition>,
    current_version: VersionStamp,
    tables: BTreeMap<TableId, TableEntry>,
}

/// Operator-facing view of a running pipeline, shared with the admin API.
#[derive(Debug)]
pub struct StatusBoard {
    instance_id: Uuid,
    started_at: DateTime<Utc>,
    registry: Arc<SchemaRegistry>,
    inner: RwLock<Inner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub instance_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub state: PipelineState,
    pub error: Option<String>,
    pub last_acknowledged: Option<SourcePosition>,
    pub current_version: VersionStamp,
    /// Operations buffered, parked or in flight across every table.
    pub unflushed_operations: usize,
    pub tables: Vec<TableStatus>,
}

impl PipelineStatus {
    pub fn table(&self, table: &TableId) -> Option<&TableStatus> {
        self.tables.iter().find(|t| &t.table == table)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableStatus {
    pub table: TableId,
    pub state: TableState,
    pub error: Option<String>,
    pub buffered: usize,
    pub in_flight: usize,
    /// Rows accepted while the buffer was at its cap.
    pub parked: usize,
    pub pending_events: usize,
    /// Events kept unacknowledged because the table is faulted.
    pub held_events: u64,
    pub rows_flushed: u64,
    pub last_flush_error: Option<String>,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub schema_fingerprint: Option<String>,
    pub columns: Vec<String>,
}

impl StatusBoard {
    pub fn new(instance_id: Uuid, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            instance_id,
            started_at: Utc::now(),
            registry,
            inner: RwLock::new(Inner {
                state: PipelineState::Initializing,
                error: None,
                last_acknowledged: None,
                current_version: VersionStamp::ZERO,
                tables: BTreeMap::new(),
            }),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn state(&self) -> PipelineState {
        self.read().state
    }

    pub(crate) fn set_state(&self, state: PipelineState) {
        self.write().state = state;
    }

    pub(crate) fn fault(&self, error: impl Into<String>) {
        let mut inner = self.write();
        inner.state = PipelineState::Faulted;
        inner.error = Some(error.into());
    }

    pub(crate) fn set_acknowledged(&self, position: SourcePosition, version: VersionStamp) {
        let mut inner = self.write();
        inner.last_acknowledged = Some(position);
        inner.current_version = version;
    }

    pub(crate) fn attach_buffer(&self, table: &TableId, buffer: Arc<TableBuffer>) {
        self.write().tables.entry(table.clone()).or_default().buffer = Some(buffer);
    }

    pub(crate) fn forget_table(&self, table: &TableId) {
        self.write().tables.remove(table);
    }

    pub fn is_faulted(&self, table: &TableId) -> bool {
        self.read().tables.get(table).is_some_and(|t| t.faulted)
    }

    pub(crate) fn fault_table(&self, table: &TableId, error: impl Into<String>) {
        let mut inner = self.write();
        let entry = inner.tables.entry(table.clone()).or_default();
        entry.faulted = true;
        entry.error = Some(error.into());
    }

    pub(crate) fn hold_event(&self, table: &TableId) {
        self.write().tables.entry(table.clone()).or_default().held_events += 1;
    }

    pub(crate) fn set_pending(&self, table: &TableId, pending: usize) {
        let mut inner = self.write();
        if pending == 0 && !inner.tables.contains_key(table) {
            return;
        }
        inner.tables.entry(table.clone()).or_default().pending_events = pending;
    }

    pub(crate) fn record_flush(&self, table: &TableId, rows: usize) {
        let mut inner = self.write();
        let entry = inner.tables.entry(table.clone()).or_default();
        entry.rows_flushed += rows as u64;
        entry.last_flush_at = Some(Utc::now());
        entry.last_flush_error = None;
    }

    pub(crate) fn record_flush_error(&self, table: &TableId, error: impl Into<String>) {
        self.write()
            .tables
            .entry(table.clone())
            .or_default()
            .last_flush_error = Some(error.into());
    }

    pub fn snapshot(&self) -> PipelineStatus {
        let inner = self.read();
        let mut unflushed = 0;
        let tables = inner
            .tables
            .iter()
            .map(|(table, entry)| {
                let stats = entry
                    .buffer
                    .as_ref()
                    .map(|b| b.stats())
                    .unwrap_or_default();
                unflushed += stats.buffered + stats.in_flight + stats.parked;
                let schema = self.registry.get(table);
                TableStatus {
                    table: table.clone(),
                    state: if entry.faulted {
                        TableState::Faulted
                    } else {
                        TableState::Running
                    },
                    error: entry.error.clone(),
                    buffered: stats.buffered,
                    in_flight: stats.in_flight,
                    parked: stats.parked,
                    pending_events: entry.pending_events,
                    held_events: entry.held_events,
                    rows_flushed: entry.rows_flushed,
                    last_flush_error: entry.last_flush_error.clone(),
                    last_flush_at: entry.last_flush_at,
                    schema_fingerprint: schema.as_ref().map(|s| s.fingerprint()),
                    columns: schema
                        .map(|s| s.columns.iter().map(|c| c.name.clone()).collect())
                        .unwrap_or_default(),
                }
            })
            .collect();

        PipelineStatus {
            instance_id: self.instance_id,
            started_at: self.started_at,
            state: inner.state,
            error: inner.error.clone(),
            last_acknowledged: inner.last_acknowledged.clone(),
            current_version: inner.current_version,
            unflushed_operations: unflushed,
            tables,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::FlushPolicy;
    use std::time::Duration;

    #[test]
    fn test_snapshot_reports_table_faults() {
        let board = StatusBoard::new(Uuid::new_v4(), Arc::new(SchemaRegistry::new()));
        let orders = TableId::new("shop", "orders");
        let items = TableId::new("shop", "items");

        board.record_flush(&items, 10);
        board.fault_table(&orders, "unsupported DDL");
        board.hold_event(&orders);

        let status = board.snapshot();
        assert_eq!(status.state, PipelineState::Initializing);
        assert_eq!(status.table(&orders).unwrap().state, TableState::Faulted);
        assert_eq!(status.table(&orders).unwrap().held_events, 1);
        assert_eq!(status.table(&items).unwrap().state, TableState::Running);
        assert_eq!(status.table(&items).unwrap().rows_flushed, 10);
    }

    #[tokio::test]
    async fn test_snapshot_counts_buffered_operations() {
        use crate::event::Row;
        use crate::transform::{RowKind, TargetRowOperation};

        let board = StatusBoard::new(Uuid::new_v4(), Arc::new(SchemaRegistry::new()));
        let table = TableId::new("shop", "orders");
        let buffer = Arc::new(TableBuffer::new(
            table.clone(),
            FlushPolicy {
                max_rows: 100,
                max_bytes: usize::MAX,
                max_latency: Duration::from_secs(60),
                max_buffered_rows: 100,
                max_parked_rows: 100,
            },
        ));
        board.attach_buffer(&table, buffer.clone());

        buffer
            .add(TargetRowOperation {
                table: table.clone(),
                kind: RowKind::Upsert,
                values: Row::new(),
                version: VersionStamp(1),
                deleted: false,
                ticket: 1,
            })
            .await
            .unwrap();

        let status = board.snapshot();
        assert_eq!(status.unflushed_operations, 1);
        assert_eq!(status.table(&table).unwrap().buffered, 1);
        assert!(serde_json::to_string(&status).unwrap().contains("\"running\""));
    }
}
