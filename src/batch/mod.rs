pub mod accumulator;
pub mod writer;

pub use accumulator::{Admission, BatchAccumulator, BufferError, BufferStats, FlushPolicy, TableBuffer};
pub use writer::{BatchWriter, FlushFailed, FlushReport, RetryPolicy};
