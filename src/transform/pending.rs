use super::record::{RecordTransformer, TargetRowOperation, TransformError};
use crate::event::{ChangeEvent, TableId};
use crate::sequencer::VersionStamp;
use std::collections::{HashMap, VecDeque};

/// A change event waiting for DDL to catch up with it.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub event: ChangeEvent,
    pub version: VersionStamp,
    pub ticket: u64,
    pub attempts: u32,
    pub last_error: String,
}

/// Result of retrying a table's queue after a schema change.
#[derive(Debug, Default)]
pub struct RetryOutcome {
    /// Operations from events that now transform cleanly, in source order.
    pub ready: Vec<TargetRowOperation>,
    /// Tickets of released events, with how many operations each produced.
    pub released: Vec<(u64, usize)>,
    /// Set when the queue head can no longer be resolved.
    pub error: Option<TransformError>,
}

/// Per-table FIFO of events that hit a recoverable schema mismatch.
///
/// While a table's queue is non-empty, later events for that table must queue
/// behind it so per-key order survives the wait.
#[derive(Debug)]
pub struct PendingQueue {
    queues: HashMap<TableId, VecDeque<PendingEvent>>,
    max_retries: u32,
    max_pending: usize,
}

impl PendingQueue {
    pub fn new(max_retries: u32, max_pending: usize) -> Self {
        Self {
            queues: HashMap::new(),
            max_retries,
            max_pending,
        }
    }

    pub fn is_blocked(&self, table: &TableId) -> bool {
        self.queues.get(table).is_some_and(|q| !q.is_empty())
    }

    pub fn len(&self, table: &TableId) -> usize {
        self.queues.get(table).map_or(0, VecDeque::len)
    }

    pub fn total(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Queue an event. Fails once the table's queue is full.
    pub fn push(
        &mut self,
        event: ChangeEvent,
        version: VersionStamp,
        ticket: u64,
        reason: impl Into<String>,
    ) -> Result<(), TransformError> {
        let queue = self.queues.entry(event.table.clone()).or_default();
        if queue.len() >= self.max_pending {
            return Err(TransformError::UnresolvableSchemaDrift {
                table: event.table.clone(),
                position: event.position.clone(),
                attempts: 0,
                reason: format!("{} events already waiting for schema changes", queue.len()),
            });
        }
        queue.push_back(PendingEvent {
            event,
            version,
            ticket,
            attempts: 0,
            last_error: reason.into(),
        });
        Ok(())
    }

    /// Re-run queued events for `table` against the current schema.
    ///
    /// Stops at the first event that still does not fit; every retried head
    /// consumes one attempt.
    pub fn retry(&mut self, table: &TableId, transformer: &RecordTransformer) -> RetryOutcome {
        let mut outcome = RetryOutcome::default();
        let Some(queue) = self.queues.get_mut(table) else {
            return outcome;
        };

        while let Some(head) = queue.front_mut() {
            match transformer.transform(&head.event, head.version, head.ticket) {
                Ok(ops) => {
                    outcome.released.push((head.ticket, ops.len()));
                    outcome.ready.extend(ops);
                    queue.pop_front();
                }
                Err(err) if err.is_recoverable() => {
                    head.attempts += 1;
                    head.last_error = err.to_string();
                    if head.attempts > self.max_retries {
                        outcome.error = Some(TransformError::UnresolvableSchemaDrift {
                            table: table.clone(),
                            position: head.event.position.clone(),
                            attempts: head.attempts,
                            reason: head.last_error.clone(),
                        });
                    }
                    break;
                }
                Err(err) => {
                    outcome.error = Some(err);
                    break;
                }
            }
        }

        if queue.is_empty() {
            self.queues.remove(table);
        }
        outcome
    }

    /// Events still waiting for `table`, oldest first.
    pub fn waiting(&self, table: &TableId) -> impl Iterator<Item = &PendingEvent> {
        self.queues.get(table).into_iter().flatten()
    }

    /// Follow a table rename so queued events retry under the new name.
    pub fn rename(&mut self, from: &TableId, to: &TableId) {
        if let Some(mut queue) = self.queues.remove(from) {
            for pending in queue.iter_mut() {
                pending.event.table = to.clone();
            }
            self.queues.entry(to.clone()).or_default().extend(queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Operation, Row, SourcePosition, Value};
    use crate::schema::{ColumnSchema, SchemaRegistry, TableSchema, TargetType};
    use std::sync::Arc;

    fn table() -> TableId {
        TableId::new("db", "t")
    }

    fn schema(columns: &[&str]) -> TableSchema {
        TableSchema {
            table: table(),
            columns: columns
                .iter()
                .map(|c| ColumnSchema::new(*c, TargetType::Integer, true))
                .collect(),
            primary_key: vec!["id".to_string()],
        }
    }

    fn insert(index: u64, extra: &str) -> ChangeEvent {
        let after: Row = vec![("id", Value::Int(index as i64)), (extra, Value::Int(1))]
            .into_iter()
            .collect();
        ChangeEvent {
            table: table(),
            op: Operation::Insert,
            after,
            before: None,
            position: SourcePosition::from_index(index),
            source_ts_ms: 0,
        }
    }

    fn setup() -> (Arc<SchemaRegistry>, RecordTransformer) {
        let registry = Arc::new(SchemaRegistry::new());
        registry.replace(schema(&["id"]));
        let transformer = RecordTransformer::new(registry.clone());
        (registry, transformer)
    }

    #[test]
    fn test_queue_releases_after_schema_change() {
        let (registry, transformer) = setup();
        let mut pending = PendingQueue::new(3, 100);

        let event = insert(1, "extra");
        let err = transformer.transform(&event, VersionStamp(1), 1).unwrap_err();
        pending.push(event, VersionStamp(1), 1, err.to_string()).unwrap();
        assert!(pending.is_blocked(&table()));

        registry.replace(schema(&["id", "extra"]));
        let outcome = pending.retry(&table(), &transformer);

        assert!(outcome.error.is_none());
        assert_eq!(outcome.released, vec![(1, 1)]);
        assert_eq!(outcome.ready[0].version, VersionStamp(1));
        assert!(!pending.is_blocked(&table()));
    }

    #[test]
    fn test_retries_are_bounded() {
        let (_registry, transformer) = setup();
        let mut pending = PendingQueue::new(2, 100);

        let event = insert(1, "extra");
        let err = transformer.transform(&event, VersionStamp(1), 1).unwrap_err();
        pending.push(event, VersionStamp(1), 1, err.to_string()).unwrap();

        assert!(pending.retry(&table(), &transformer).error.is_none());
        assert!(pending.retry(&table(), &transformer).error.is_none());
        let outcome = pending.retry(&table(), &transformer);
        assert!(matches!(
            outcome.error,
            Some(TransformError::UnresolvableSchemaDrift { attempts: 3, .. })
        ));
    }

    #[test]
    fn test_queue_capacity() {
        let (_registry, transformer) = setup();
        let mut pending = PendingQueue::new(3, 1);

        let first = insert(1, "extra");
        let err = transformer.transform(&first, VersionStamp(1), 1).unwrap_err();
        pending.push(first, VersionStamp(1), 1, err.to_string()).unwrap();

        let second = insert(2, "extra");
        assert!(matches!(
            pending.push(second, VersionStamp(2), 2, err.to_string()),
            Err(TransformError::UnresolvableSchemaDrift { .. })
        ));
    }
}
