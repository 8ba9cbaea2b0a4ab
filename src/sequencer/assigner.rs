use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Pipeline-assigned ordering key written to the target's version column.
///
/// Only relative order is meaningful: a larger stamp was observed later in
/// the source log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionStamp(pub u64);

impl VersionStamp {
    pub const ZERO: VersionStamp = VersionStamp(0);

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("version stamp space exhausted after {0}")]
    Exhausted(VersionStamp),
}

/// Hands out strictly increasing version stamps, one per change event.
///
/// Stamps ignore the source timestamp entirely, so events sharing a
/// millisecond still get distinct, ordered stamps. The counter is seeded from
/// the highest stamp already persisted in the target so a restart never hands
/// out a stamp lower than one the merge engine has already seen.
///
/// Owned by the ingestion task; there is exactly one writer.
#[derive(Debug, Clone)]
pub struct SequenceAssigner {
    last: u64,
}

impl SequenceAssigner {
    pub fn new() -> Self {
        Self::seeded(VersionStamp::ZERO)
    }

    pub fn seeded(max_persisted: VersionStamp) -> Self {
        Self {
            last: max_persisted.0,
        }
    }

    /// Assign the next stamp.
    pub fn assign(&mut self) -> Result<VersionStamp, SequenceError> {
        let next = self
            .last
            .checked_add(1)
            .ok_or(SequenceError::Exhausted(VersionStamp(self.last)))?;
        self.last = next;
        Ok(VersionStamp(next))
    }

    /// The most recently assigned (or seeded) stamp.
    pub fn current(&self) -> VersionStamp {
        VersionStamp(self.last)
    }
}

impl Default for SequenceAssigner {
    fn default() -> Self {
        Self::new()
    }
}
