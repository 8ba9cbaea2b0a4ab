pub mod pending;
pub mod record;

pub use pending::{PendingEvent, PendingQueue, RetryOutcome};
pub use record::{RecordTransformer, RowKind, TargetRowOperation, TransformError};
