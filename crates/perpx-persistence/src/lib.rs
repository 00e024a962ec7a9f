//! Durable operation log for perpx.
//!
//! Every status transition appends a full operation snapshot as one JSON
//! line. On startup the log is replayed and the latest snapshot per
//! operation id is handed back to the engine for resumption.

pub mod error;
pub mod journal;
pub mod log;

pub use error::{PersistenceError, PersistenceResult};
pub use journal::{MemoryJournal, OperationJournal};
pub use log::{replay, OperationLog};
