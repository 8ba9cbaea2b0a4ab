use super::{EventSource, SourceConnector, SourceError, StartFrom};
use crate::event::{ChangeEvent, DdlEvent, Operation, Row, SourceEvent, SourcePosition, TableId};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogHead {
    len: usize,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    events: Mutex<Vec<SourceEvent>>,
    head: watch::Sender<LogHead>,
}

/// An appendable, replayable replication log held in memory.
///
/// Writers append from any task; readers opened through [`MemoryConnector`]
/// follow the log until it is closed.
#[derive(Debug, Clone)]
pub struct MemoryLog {
    shared: Arc<Shared>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        let (head, _) = watch::channel(LogHead {
            len: 0,
            closed: false,
        });
        Self {
            shared: Arc::new(Shared {
                events: Mutex::new(Vec::new()),
                head,
            }),
        }
    }

    fn events(&self) -> MutexGuard<'_, Vec<SourceEvent>> {
        self.shared.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, build: impl FnOnce(SourcePosition) -> SourceEvent) -> SourcePosition {
        let mut events = self.events();
        let position = SourcePosition::from_index(events.len() as u64);
        events.push(build(position.clone()));
        let len = events.len();
        drop(events);
        self.shared.head.send_modify(|head| head.len = len);
        position
    }

    pub fn append_change(
        &self,
        table: TableId,
        op: Operation,
        after: Row,
        before: Option<Row>,
    ) -> SourcePosition {
        self.push(|position| {
            SourceEvent::Change(ChangeEvent {
                table,
                op,
                after,
                before,
                position,
                source_ts_ms: Utc::now().timestamp_millis(),
            })
        })
    }

    pub fn append_ddl(&self, database: Option<&str>, statement: impl Into<String>) -> SourcePosition {
        let database = database.map(str::to_string);
        let statement = statement.into();
        self.push(|position| {
            SourceEvent::Ddl(DdlEvent {
                database,
                statement,
                position,
            })
        })
    }

    pub fn insert(&self, table: &TableId, row: Row) -> SourcePosition {
        self.append_change(table.clone(), Operation::Insert, row, None)
    }

    pub fn update(&self, table: &TableId, before: Option<Row>, after: Row) -> SourcePosition {
        self.append_change(table.clone(), Operation::Update, after, before)
    }

    pub fn delete(&self, table: &TableId, before: Row) -> SourcePosition {
        self.append_change(table.clone(), Operation::Delete, Row::new(), Some(before))
    }

    /// Mark the end of the log. Readers finish once they reach it.
    pub fn close(&self) {
        self.shared.head.send_modify(|head| head.closed = true);
    }

    pub fn len(&self) -> usize {
        self.shared.head.borrow().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of the most recent event.
    pub fn last_position(&self) -> Option<SourcePosition> {
        self.len()
            .checked_sub(1)
            .map(|i| SourcePosition::from_index(i as u64))
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { log: self.clone() }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    log: MemoryLog,
}

#[async_trait]
impl SourceConnector for MemoryConnector {
    async fn open(&self, start: StartFrom) -> Result<Box<dyn EventSource>, SourceError> {
        let (next, schema_only_until) = match &start {
            StartFrom::Beginning => (0, 0),
            StartFrom::After(position) => {
                let index = position
                    .index()
                    .ok_or_else(|| SourceError::InvalidPosition(position.clone()))?;
                (index as usize + 1, 0)
            }
            StartFrom::SchemaOnly => (0, self.log.len()),
        };
        tracing::debug!(?start, next, "Opening in-memory source");

        Ok(Box::new(MemorySource {
            log: self.log.clone(),
            head: self.log.shared.head.subscribe(),
            next,
            schema_only_until,
        }))
    }
}

/// Reader over a [`MemoryLog`].
#[derive(Debug)]
pub struct MemorySource {
    log: MemoryLog,
    head: watch::Receiver<LogHead>,
    next: usize,
    schema_only_until: usize,
}

#[async_trait]
impl EventSource for MemorySource {
    async fn next_event(&mut self) -> Result<Option<SourceEvent>, SourceError> {
        loop {
            let head = *self.head.borrow_and_update();

            while self.next < head.len {
                let index = self.next;
                let event = self.log.events()[index].clone();
                self.next += 1;
                if index < self.schema_only_until && !event.is_ddl() {
                    continue;
                }
                return Ok(Some(event));
            }

            if head.closed {
                return Ok(None);
            }
            if self.head.changed().await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Value;
    use std::time::Duration;

    fn row(id: i64) -> Row {
        vec![("id", Value::Int(id))].into_iter().collect()
    }

    #[tokio::test]
    async fn test_resume_after_position() {
        let log = MemoryLog::new();
        let table = TableId::new("db", "t");
        log.insert(&table, row(1));
        let second = log.insert(&table, row(2));
        log.insert(&table, row(3));
        log.close();

        let mut source = log.connector().open(StartFrom::After(second)).await.unwrap();
        let event = source.next_event().await.unwrap().unwrap();
        assert_eq!(event.position(), &SourcePosition::from_index(2));
        assert!(source.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_schema_only_skips_historic_data() {
        let log = MemoryLog::new();
        let table = TableId::new("db", "t");
        log.append_ddl(Some("db"), "CREATE TABLE t (id INT PRIMARY KEY)");
        log.insert(&table, row(1));

        let mut source = log.connector().open(StartFrom::SchemaOnly).await.unwrap();
        log.insert(&table, row(2));
        log.close();

        assert!(source.next_event().await.unwrap().unwrap().is_ddl());
        let live = source.next_event().await.unwrap().unwrap();
        assert_eq!(live.position(), &SourcePosition::from_index(2));
        assert!(source.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_waits_for_appends() {
        let log = MemoryLog::new();
        let table = TableId::new("db", "t");
        let mut source = log.connector().open(StartFrom::Beginning).await.unwrap();

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.insert(&table, row(1));
        });

        let event = tokio::time::timeout(Duration::from_secs(2), source.next_event())
            .await
            .unwrap()
            .unwrap();
        assert!(event.is_some());
    }
}
