use crate::event::TableId;
use crate::transform::TargetRowOperation;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore, TryAcquireError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub max_rows: usize,
    pub max_bytes: usize,
    pub max_latency: Duration,
    /// Rows a table may hold, flushing ones included, before new rows are parked.
    pub max_buffered_rows: usize,
    /// Rows a table may park behind a full buffer before `add` blocks.
    pub max_parked_rows: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer for {0} is closed")]
    Closed(TableId),
}

#[derive(Debug, Default)]
struct BufferState {
    ops: VecDeque<TargetRowOperation>,
    bytes: usize,
    oldest: Option<Instant>,
    pending_ddl: bool,
    in_flight: usize,
    /// Rows accepted while the buffer had no capacity, in arrival order.
    parked: VecDeque<TargetRowOperation>,
}

/// Snapshot of one buffer for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub buffered: usize,
    pub in_flight: usize,
    pub parked: usize,
    pub bytes: usize,
}

/// Where `try_add` put an operation.
#[derive(Debug)]
pub enum Admission {
    Buffered,
    Parked,
    /// Buffer and parking area are both full; the operation is handed back.
    Full(TargetRowOperation),
}

/// Per-table queue between the ingestion task and the table's flush worker.
///
/// Capacity is held from admission until the flush that carries the row
/// succeeds. Rows arriving while the buffer is full are parked without
/// waiting and promoted as flushes complete, so the ingestion task keeps
/// serving other tables. Only a full parking area makes `add` wait.
#[derive(Debug)]
pub struct TableBuffer {
    table: TableId,
    policy: FlushPolicy,
    state: Mutex<BufferState>,
    capacity: Semaphore,
    parking: Semaphore,
    ready: Notify,
}

impl TableBuffer {
    pub fn new(table: TableId, policy: FlushPolicy) -> Self {
        let permits = policy.max_buffered_rows.clamp(1, Semaphore::MAX_PERMITS);
        let parking = policy.max_parked_rows.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            table,
            policy,
            state: Mutex::new(BufferState::default()),
            capacity: Semaphore::new(permits),
            parking: Semaphore::new(parking),
            ready: Notify::new(),
        }
    }

    pub fn table(&self) -> &TableId {
        &self.table
    }

    /// Append one operation, waiting only while the parking area is full.
    pub async fn add(&self, op: TargetRowOperation) -> Result<(), BufferError> {
        let op = match self.try_add(op)? {
            Admission::Full(op) => op,
            Admission::Buffered | Admission::Parked => return Ok(()),
        };
        let permit = self.parking.acquire().await.map_err(|_| self.closed())?;
        permit.forget();
        self.lock().parked.push_back(op);
        self.promote();
        Ok(())
    }

    /// Buffer or park one operation without waiting.
    pub fn try_add(&self, op: TargetRowOperation) -> Result<Admission, BufferError> {
        let mut state = self.lock();
        if state.parked.is_empty() {
            match self.capacity.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    let wake = self.push(&mut state, op);
                    drop(state);
                    if wake {
                        self.ready.notify_one();
                    }
                    return Ok(Admission::Buffered);
                }
                Err(TryAcquireError::Closed) => return Err(self.closed()),
                Err(TryAcquireError::NoPermits) => {}
            }
        }
        match self.parking.try_acquire() {
            Ok(permit) => {
                permit.forget();
                state.parked.push_back(op);
                Ok(Admission::Parked)
            }
            Err(TryAcquireError::Closed) => Err(self.closed()),
            Err(TryAcquireError::NoPermits) => Ok(Admission::Full(op)),
        }
    }

    fn push(&self, state: &mut BufferState, op: TargetRowOperation) -> bool {
        state.bytes += op.estimated_bytes();
        state.oldest.get_or_insert_with(Instant::now);
        state.ops.push_back(op);
        Self::due(state, &self.policy, Instant::now())
    }

    /// Move parked rows into the buffer while capacity allows.
    fn promote(&self) {
        let wake = {
            let mut state = self.lock();
            let mut wake = false;
            while !state.parked.is_empty() {
                let Ok(permit) = self.capacity.try_acquire() else {
                    break;
                };
                permit.forget();
                if let Some(op) = state.parked.pop_front() {
                    wake |= self.push(&mut state, op);
                }
                self.parking.add_permits(1);
            }
            wake
        };
        if wake {
            self.ready.notify_one();
        }
    }

    fn closed(&self) -> BufferError {
        BufferError::Closed(self.table.clone())
    }

    pub fn should_flush(&self) -> bool {
        self.should_flush_at(Instant::now())
    }

    pub fn should_flush_at(&self, now: Instant) -> bool {
        Self::due(&self.lock(), &self.policy, now)
    }

    fn due(state: &BufferState, policy: &FlushPolicy, now: Instant) -> bool {
        if state.ops.is_empty() {
            return false;
        }
        state.ops.len() >= policy.max_rows
            || state.bytes >= policy.max_bytes
            || state.pending_ddl
            || state
                .oldest
                .is_some_and(|t| now.saturating_duration_since(t) >= policy.max_latency)
    }

    /// Remove everything buffered, in insertion order.
    pub fn drain(&self) -> Vec<TargetRowOperation> {
        let mut state = self.lock();
        let ops: Vec<_> = state.ops.drain(..).collect();
        state.in_flight += ops.len();
        state.bytes = 0;
        state.oldest = None;
        ops
    }

    /// Put a failed batch back in front of anything added since.
    pub fn requeue(&self, ops: Vec<TargetRowOperation>) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(ops.len());
        state.bytes += ops.iter().map(TargetRowOperation::estimated_bytes).sum::<usize>();
        for op in ops.into_iter().rev() {
            state.ops.push_front(op);
        }
        if !state.ops.is_empty() {
            state.oldest = Some(Instant::now());
        }
    }

    /// Release capacity once `rows` drained operations are durable.
    pub fn complete(&self, rows: usize) {
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(rows);
        }
        self.capacity.add_permits(rows);
        self.promote();
    }

    pub fn mark_pending_ddl(&self, pending: bool) {
        self.lock().pending_ddl = pending;
        if pending {
            self.ready.notify_one();
        }
    }

    /// Wake blocked producers with an error; used when the table faults.
    pub fn close(&self) {
        self.capacity.close();
        self.parking.close();
        self.ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.capacity.is_closed()
    }

    /// No rows buffered or parked.
    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        state.ops.is_empty() && state.parked.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.lock();
        BufferStats {
            buffered: state.ops.len(),
            in_flight: state.in_flight,
            parked: state.parked.len(),
            bytes: state.bytes,
        }
    }

    /// Resolves once a flush trigger other than age may have fired.
    pub async fn notified(&self) {
        self.ready.notified().await
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Owns the per-table buffers.
#[derive(Debug)]
pub struct BatchAccumulator {
    policy: FlushPolicy,
    buffers: HashMap<TableId, Arc<TableBuffer>>,
}

impl BatchAccumulator {
    pub fn new(policy: FlushPolicy) -> Self {
        Self {
            policy,
            buffers: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &FlushPolicy {
        &self.policy
    }

    pub fn get(&self, table: &TableId) -> Option<Arc<TableBuffer>> {
        self.buffers.get(table).cloned()
    }

    /// Buffer for `table`, created on first use. The flag reports creation.
    pub fn get_or_create(&mut self, table: &TableId) -> (Arc<TableBuffer>, bool) {
        if let Some(buffer) = self.buffers.get(table) {
            return (buffer.clone(), false);
        }
        let buffer = Arc::new(TableBuffer::new(table.clone(), self.policy));
        self.buffers.insert(table.clone(), buffer.clone());
        (buffer, true)
    }

    pub async fn add(&mut self, op: TargetRowOperation) -> Result<(), BufferError> {
        let (buffer, _) = self.get_or_create(&op.table);
        buffer.add(op).await
    }

    pub fn should_flush(&self, table: &TableId) -> bool {
        self.buffers.get(table).is_some_and(|b| b.should_flush())
    }

    pub fn drain(&self, table: &TableId) -> Vec<TargetRowOperation> {
        self.buffers
            .get(table)
            .map(|b| b.drain())
            .unwrap_or_default()
    }

    pub fn remove(&mut self, table: &TableId) -> Option<Arc<TableBuffer>> {
        self.buffers.remove(table)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableId> {
        self.buffers.keys()
    }

    /// Operations buffered, parked or in flight across every table.
    pub fn total_unflushed(&self) -> usize {
        self.buffers
            .values()
            .map(|b| {
                let stats = b.stats();
                stats.buffered + stats.in_flight + stats.parked
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Row, Value};
    use crate::sequencer::VersionStamp;
    use crate::transform::RowKind;

    fn policy(max_rows: usize, max_latency: Duration, cap: usize) -> FlushPolicy {
        FlushPolicy {
            max_rows,
            max_bytes: usize::MAX,
            max_latency,
            max_buffered_rows: cap,
            max_parked_rows: 2,
        }
    }

    fn op(version: u64) -> TargetRowOperation {
        TargetRowOperation {
            table: TableId::new("db", "t"),
            kind: RowKind::Upsert,
            values: vec![("id", Value::Int(1))].into_iter().collect::<Row>(),
            version: VersionStamp(version),
            deleted: false,
            ticket: version,
        }
    }

    #[tokio::test]
    async fn test_row_count_trigger() {
        let buffer = TableBuffer::new(TableId::new("db", "t"), policy(3, Duration::from_secs(3600), 100));
        buffer.add(op(1)).await.unwrap();
        buffer.add(op(2)).await.unwrap();
        assert!(!buffer.should_flush());
        buffer.add(op(3)).await.unwrap();
        assert!(buffer.should_flush());
    }

    #[tokio::test]
    async fn test_age_trigger_with_single_row() {
        let buffer = TableBuffer::new(TableId::new("db", "t"), policy(1000, Duration::from_millis(50), 100));
        buffer.add(op(1)).await.unwrap();
        let now = Instant::now();
        assert!(!buffer.should_flush_at(now));
        assert!(buffer.should_flush_at(now + Duration::from_millis(60)));
    }

    #[tokio::test]
    async fn test_pending_ddl_trigger() {
        let buffer = TableBuffer::new(TableId::new("db", "t"), policy(1000, Duration::from_secs(3600), 100));
        buffer.mark_pending_ddl(true);
        assert!(!buffer.should_flush(), "nothing to flush yet");
        buffer.add(op(1)).await.unwrap();
        assert!(buffer.should_flush());
    }

    #[tokio::test]
    async fn test_drain_and_requeue_preserve_order() {
        let buffer = TableBuffer::new(TableId::new("db", "t"), policy(1000, Duration::from_secs(3600), 100));
        for v in 1..=3 {
            buffer.add(op(v)).await.unwrap();
        }
        let drained = buffer.drain();
        buffer.add(op(4)).await.unwrap();
        buffer.requeue(drained);

        let versions: Vec<u64> = buffer.drain().iter().map(|o| o.version.get()).collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_full_buffer_parks_until_flush_completes() {
        let buffer = TableBuffer::new(TableId::new("db", "t"), policy(1000, Duration::from_secs(3600), 2));
        assert!(matches!(buffer.try_add(op(1)), Ok(Admission::Buffered)));
        assert!(matches!(buffer.try_add(op(2)), Ok(Admission::Buffered)));
        assert!(matches!(buffer.try_add(op(3)), Ok(Admission::Parked)));

        let drained = buffer.drain();
        assert!(
            matches!(buffer.try_add(op(4)), Ok(Admission::Parked)),
            "drained rows still hold capacity"
        );
        assert_eq!(buffer.stats().parked, 2);

        buffer.complete(drained.len());
        let stats = buffer.stats();
        assert_eq!((stats.buffered, stats.parked), (2, 0));
        let versions: Vec<u64> = buffer.drain().iter().map(|o| o.version.get()).collect();
        assert_eq!(versions, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_add_blocks_once_parking_is_full() {
        let buffer = Arc::new(TableBuffer::new(
            TableId::new("db", "t"),
            policy(1000, Duration::from_secs(3600), 2),
        ));
        for v in 1..=4 {
            buffer.add(op(v)).await.unwrap();
        }
        assert!(matches!(buffer.try_add(op(5)), Ok(Admission::Full(_))));

        let blocked = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.add(op(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        let drained = buffer.drain();
        buffer.complete(drained.len());
        blocked.await.unwrap().unwrap();

        let stats = buffer.stats();
        assert_eq!((stats.buffered, stats.parked), (2, 1));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_producer() {
        let buffer = Arc::new(TableBuffer::new(
            TableId::new("db", "t"),
            policy(1000, Duration::from_secs(3600), 1),
        ));
        buffer.add(op(1)).await.unwrap();
        buffer.add(op(2)).await.unwrap();
        buffer.add(op(3)).await.unwrap();

        let blocked = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.add(op(4)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();

        assert!(matches!(blocked.await.unwrap(), Err(BufferError::Closed(_))));
    }
}
