//! Panic bookkeeping for the cohort.

use std::fmt;

use parking_lot::RwLock;

/// A task that unwound instead of returning.
///
/// The payload is kept as text only. `panic!` payloads keep their message; a
/// payload of any other type raised with [`std::panic::panic_any`] is
/// recorded as `Box<dyn Any>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicRecord {
    /// World rank of the task.
    pub rank: usize,
    /// The panic payload rendered as text.
    pub message: String,
}

impl fmt::Display for PanicRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "rank {} panicked: {}", self.rank, self.message)
    }
}

/// Append-only list of [`PanicRecord`]s shared by all tasks of a cohort.
#[derive(Debug, Default)]
pub struct PanicLog {
    records: RwLock<Vec<PanicRecord>>,
}

impl PanicLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: PanicRecord) {
        self.records.write().push(record);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Returns a copy of the records appended so far.
    pub fn snapshot(&self) -> Vec<PanicRecord> {
        self.records.read().clone()
    }
}
