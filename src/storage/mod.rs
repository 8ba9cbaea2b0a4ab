pub mod checkpoint;
pub mod duckdb;
pub mod traits;

pub use checkpoint::{CheckpointError, CheckpointManager, OffsetCheckpoint};
pub use duckdb::DuckDbStore;
pub use traits::{OffsetStore, StoreError, TargetStore};
