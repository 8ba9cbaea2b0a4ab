pub mod assigner;

pub use assigner::{SequenceAssigner, SequenceError, VersionStamp};
