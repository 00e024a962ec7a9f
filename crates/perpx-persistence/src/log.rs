//! JSON Lines operation log.
//!
//! Uses JSON Lines format (.jsonl) for robustness:
//! - Each line is a complete operation snapshot
//! - Partial file corruption only affects individual lines
//! - Can be read even if a write was interrupted

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use perpx_core::{OperationId, OperationRecord};
use tracing::{debug, info, warn};

use crate::error::PersistenceResult;
use crate::journal::OperationJournal;

struct ActiveWriter {
    writer: BufWriter<File>,
    records_written: usize,
}

/// Append-only operation log.
///
/// Opened in append mode, so an existing log is never truncated; only
/// [`compact`](Self::compact) rewrites it. Each append is flushed and
/// synced before returning.
pub struct OperationLog {
    path: PathBuf,
    active: Mutex<ActiveWriter>,
}

impl OperationLog {
    /// Open (or create) the log at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> PersistenceResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!(path = %path.display(), "Opening operation log (append mode)");

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            active: Mutex::new(ActiveWriter {
                writer: BufWriter::new(file),
                records_written: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshots written through this handle.
    pub fn records_written(&self) -> usize {
        self.active.lock().records_written
    }

    /// Rewrite the log down to the latest snapshot per operation.
    ///
    /// The compacted copy is synced next to the log and renamed over it, so
    /// a crash leaves either the old or the new file whole. Later appends
    /// go to the compacted file. Returns the number of operations kept.
    pub fn compact(&self) -> PersistenceResult<usize> {
        let mut active = self.active.lock();
        active.writer.flush()?;
        let records = replay(&self.path)?;

        let mut staging = self.path.clone().into_os_string();
        staging.push(".compact");
        let staging = PathBuf::from(staging);
        {
            let mut out = BufWriter::new(File::create(&staging)?);
            for record in &records {
                writeln!(out, "{}", serde_json::to_string(record)?)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        std::fs::rename(&staging, &self.path)?;

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        active.writer = BufWriter::new(file);
        info!(
            path = %self.path.display(),
            operations = records.len(),
            "Operation log compacted"
        );
        Ok(records.len())
    }
}

impl OperationJournal for OperationLog {
    fn append(&self, record: &OperationRecord) -> PersistenceResult<()> {
        let line = serde_json::to_string(record)?;

        let mut active = self.active.lock();
        writeln!(active.writer, "{line}")?;
        active.writer.flush()?;
        active.writer.get_ref().sync_data()?;
        active.records_written += 1;

        debug!(
            operation_id = %record.operation_id,
            status = %record.status,
            "Operation snapshot persisted"
        );
        Ok(())
    }
}

impl Drop for OperationLog {
    fn drop(&mut self) {
        let mut active = self.active.lock();
        if let Err(e) = active.writer.flush() {
            warn!(?e, "Failed to flush operation log on close");
        }
        info!(
            path = %self.path.display(),
            records = active.records_written,
            "Closed operation log"
        );
    }
}

/// Replay the log at `path`.
///
/// Returns the latest snapshot per operation id, oldest operation first.
/// A missing file yields no records; corrupt lines are skipped with a
/// warning.
pub fn replay(path: impl AsRef<Path>) -> PersistenceResult<Vec<OperationRecord>> {
    let path = path.as_ref();
    if !path.exists() {
        info!(path = %path.display(), "No operation log to replay");
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let mut latest: HashMap<OperationId, OperationRecord> = HashMap::new();
    let mut lines = 0usize;
    let mut skipped = 0usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        lines += 1;
        match serde_json::from_str::<OperationRecord>(&line) {
            Ok(record) => {
                latest.insert(record.operation_id, record);
            }
            Err(e) => {
                skipped += 1;
                warn!(line = index + 1, error = %e, "Skipping corrupt operation log line");
            }
        }
    }

    let mut records: Vec<OperationRecord> = latest.into_values().collect();
    records.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.operation_id.cmp(&b.operation_id))
    });

    info!(
        path = %path.display(),
        lines,
        skipped,
        operations = records.len(),
        "Operation log replayed"
    );
    Ok(records)
}
