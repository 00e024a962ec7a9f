//! Journal abstraction.

use parking_lot::Mutex;
use perpx_core::OperationRecord;

use crate::error::PersistenceResult;

/// Sink for operation snapshots.
///
/// `append` must not return before the snapshot is durable; the engine
/// relies on it to resume tracking after a restart.
pub trait OperationJournal: Send + Sync {
    fn append(&self, record: &OperationRecord) -> PersistenceResult<()>;
}

/// In-memory journal for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<OperationRecord>>,
}

impl MemoryJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every snapshot appended so far, oldest first.
    pub fn records(&self) -> Vec<OperationRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl OperationJournal for MemoryJournal {
    fn append(&self, record: &OperationRecord) -> PersistenceResult<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}
