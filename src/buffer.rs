// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Durable buffer for fixes that failed live insertion.
//!
//! A flat CSV file (no header) with one row per fix:
//! `[timestampRFC3339, latitude, longitude, altitude-or-empty,
//! speed-or-empty]`, oldest row first. Every mutation rewrites the full
//! store through a temp file in the same directory followed by an atomic
//! rename, so an external reader (or a crash) sees either the complete
//! old content or the complete new content, never a partial write.

use chrono::{DateTime, Utc};
use csv::StringRecord;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::sink::{Fix, FixSink, InsertOutcome};

/// Durable buffer store errors.
///
/// These surface the single true data-loss path (live insert failed AND
/// the buffer write failed), so they are typed rather than folded into
/// a generic error.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("buffer store encoding failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("atomic replace of buffer store failed: {0}")]
    Replace(#[from] tempfile::PersistError),
}

/// Result of one replay pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayStats {
    /// Records the sink accepted and made durable in this pass.
    pub accepted: usize,
    /// Records the sink rejected as already stored (removed, but not
    /// counted as fresh successes).
    pub duplicates: usize,
    /// Records still buffered after the pass.
    pub remaining: usize,
}

/// Local durable store for not-yet-committed fixes.
pub struct DurableBuffer {
    path: PathBuf,
}

impl DurableBuffer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of currently buffered records.
    pub fn pending(&self) -> Result<usize, BufferError> {
        Ok(self.load()?.len())
    }

    /// Append one fix to the store, reporting whether it was stored.
    ///
    /// A fix without both coordinates is dropped with a warning
    /// (`Ok(false)`) -- no fix without position is meaningful, and such
    /// a record must never reach the store.
    pub fn append(&self, fix: &Fix) -> Result<bool, BufferError> {
        if !fix.has_position() {
            tracing::warn!(
                timestamp = %fix.timestamp,
                "dropping fix without position, not buffering"
            );
            return Ok(false);
        }

        let mut rows = self.load()?;
        rows.push(encode_row(fix));
        self.atomic_replace(&rows)?;
        Ok(true)
    }

    /// Drain buffered records into a sink.
    ///
    /// Per record: a row that no longer decodes is kept; a sink
    /// duplicate is removed without counting as a fresh success; a sink
    /// error keeps the row and the pass continues. If any insert was
    /// attempted the sink is asked to commit, so a duplicates-only pass
    /// still closes the transaction it opened; a failing commit reverts
    /// the whole pass (nothing is removed). The final remaining set is
    /// written back with the same atomic-replace discipline, including
    /// when it is empty.
    pub fn replay(&self, sink: &mut dyn FixSink) -> Result<ReplayStats, BufferError> {
        let rows = self.load()?;
        if rows.is_empty() {
            return Ok(ReplayStats::default());
        }

        let mut accepted = 0usize;
        let mut duplicates = 0usize;
        let mut attempted = false;
        let mut remaining: Vec<StringRecord> = Vec::new();

        for row in &rows {
            let Some(fix) = decode_row(row) else {
                tracing::warn!(row = ?row, "keeping undecodable buffered record");
                remaining.push(row.clone());
                continue;
            };

            attempted = true;
            match sink.insert(&fix) {
                Ok(InsertOutcome::Inserted) => accepted += 1,
                Ok(InsertOutcome::Duplicate) => duplicates += 1,
                Err(e) => {
                    tracing::warn!(timestamp = %fix.timestamp, "replay insert failed: {e:#}");
                    remaining.push(row.clone());
                }
            }
        }

        // Commit whenever an insert was attempted: a duplicates-only
        // pass still opened a transaction that must not stay idle.
        if attempted {
            if let Err(e) = sink.commit() {
                // Nothing from this pass is safe; keep every input row.
                tracing::warn!(records = rows.len(), "replay commit failed, keeping all: {e:#}");
                sink.rollback();
                remaining = rows;
                accepted = 0;
                duplicates = 0;
            }
        }

        let stats = ReplayStats {
            accepted,
            duplicates,
            remaining: remaining.len(),
        };
        self.atomic_replace(&remaining)?;
        Ok(stats)
    }

    /// Read all buffered rows; an absent store reads as empty.
    fn load(&self) -> Result<Vec<StringRecord>, BufferError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file);

        let mut rows = Vec::new();
        for record in reader.records() {
            rows.push(record?);
        }
        Ok(rows)
    }

    /// Write the full store content to a temp file in the same
    /// directory, then atomically rename it over the store.
    fn atomic_replace(&self, rows: &[StringRecord]) -> Result<(), BufferError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(tmp.as_file_mut());
            for row in rows {
                writer.write_record(row)?;
            }
            writer.flush()?;
        }
        tmp.persist(&self.path)?;
        Ok(())
    }
}

fn encode_row(fix: &Fix) -> StringRecord {
    StringRecord::from(vec![
        fix.timestamp.to_rfc3339(),
        opt_to_field(fix.latitude),
        opt_to_field(fix.longitude),
        opt_to_field(fix.altitude),
        opt_to_field(fix.speed_kmh),
    ])
}

fn opt_to_field(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn field_to_opt(field: &str) -> Option<Option<f64>> {
    if field.is_empty() {
        return Some(None);
    }
    field.parse().ok().map(Some)
}

/// Decode one stored row back into a fix. `None` marks a row that must
/// be kept as-is (it cannot be handed to the sink).
fn decode_row(row: &StringRecord) -> Option<Fix> {
    let timestamp = DateTime::parse_from_rfc3339(row.get(0)?)
        .ok()?
        .with_timezone(&Utc);
    let latitude: f64 = row.get(1)?.parse().ok()?;
    let longitude: f64 = row.get(2)?.parse().ok()?;
    let altitude = field_to_opt(row.get(3).unwrap_or(""))?;
    let speed_kmh = field_to_opt(row.get(4).unwrap_or(""))?;

    Some(Fix {
        timestamp,
        latitude: Some(latitude),
        longitude: Some(longitude),
        altitude,
        speed_kmh,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use std::io::Read;

    fn fix(ts_secs: i64, lat: f64) -> Fix {
        Fix {
            timestamp: DateTime::from_timestamp(ts_secs, 0).unwrap(),
            latitude: Some(lat),
            longitude: Some(11.5167),
            altitude: Some(545.4),
            speed_kmh: Some(18.52),
        }
    }

    fn temp_buffer() -> (tempfile::TempDir, DurableBuffer) {
        let dir = tempfile::tempdir().unwrap();
        let buffer = DurableBuffer::new(dir.path().join("buffer.csv"));
        (dir, buffer)
    }

    #[test]
    fn test_append_and_pending() {
        let (_dir, buffer) = temp_buffer();
        assert_eq!(buffer.pending().unwrap(), 0);

        buffer.append(&fix(1, 48.0)).unwrap();
        buffer.append(&fix(2, 49.0)).unwrap();
        assert_eq!(buffer.pending().unwrap(), 2);
    }

    #[test]
    fn test_append_order_is_oldest_first() {
        let (_dir, buffer) = temp_buffer();
        buffer.append(&fix(1, 48.0)).unwrap();
        buffer.append(&fix(2, 49.0)).unwrap();

        let rows = buffer.load().unwrap();
        let first = decode_row(&rows[0]).unwrap();
        assert_eq!(first.latitude, Some(48.0));
    }

    #[test]
    fn test_append_drops_record_without_position() {
        let (_dir, buffer) = temp_buffer();
        let mut incomplete = fix(1, 48.0);
        incomplete.longitude = None;

        assert!(!buffer.append(&incomplete).unwrap());
        assert_eq!(buffer.pending().unwrap(), 0);
        // Nothing was persisted, not even an empty store.
        assert!(!buffer.path().exists());
    }

    #[test]
    fn test_failed_replace_preserves_existing_content() {
        let (dir, buffer) = temp_buffer();
        buffer.append(&fix(1, 48.0)).unwrap();
        let before = std::fs::read(buffer.path()).unwrap();

        // A non-empty directory at the store path blocks the final
        // rename, interrupting the replace after the temp file write.
        let blocked_path = dir.path().join("blocked");
        std::fs::create_dir(&blocked_path).unwrap();
        std::fs::write(blocked_path.join("occupant"), "x").unwrap();
        let blocked = DurableBuffer::new(&blocked_path);

        let err = blocked
            .atomic_replace(&[encode_row(&fix(2, 49.0))])
            .unwrap_err();
        assert!(matches!(err, BufferError::Replace(_)));

        // Only the temp file was touched; the existing store in the
        // same directory is byte-identical.
        assert_eq!(std::fs::read(buffer.path()).unwrap(), before);
    }

    #[test]
    fn test_row_roundtrip() {
        let original = fix(42, 48.1173);
        let decoded = decode_row(&encode_row(&original)).unwrap();
        assert_eq!(decoded, original);

        let mut sparse = original;
        sparse.altitude = None;
        sparse.speed_kmh = None;
        let decoded = decode_row(&encode_row(&sparse)).unwrap();
        assert_eq!(decoded, sparse);
    }

    #[test]
    fn test_replay_drains_accepted_records() {
        let (_dir, buffer) = temp_buffer();
        buffer.append(&fix(1, 48.0)).unwrap();
        buffer.append(&fix(2, 49.0)).unwrap();

        let mut sink = MemorySink::new();
        let stats = buffer.replay(&mut sink).unwrap();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.remaining, 0);
        assert_eq!(sink.committed().len(), 2);
        assert_eq!(buffer.pending().unwrap(), 0);

        // Second pass on the now-empty store is a no-op.
        let stats = buffer.replay(&mut sink).unwrap();
        assert_eq!(stats.accepted, 0);
        assert_eq!(sink.committed().len(), 2);
    }

    #[test]
    fn test_replay_removes_duplicates_without_counting_them() {
        let (_dir, buffer) = temp_buffer();
        let record = fix(1, 48.0);

        let mut sink = MemorySink::new();
        buffer.append(&record).unwrap();
        buffer.replay(&mut sink).unwrap();

        // Same record buffered again, e.g. after a torn connection.
        buffer.append(&record).unwrap();
        let stats = buffer.replay(&mut sink).unwrap();
        assert_eq!(stats.accepted, 0);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.remaining, 0);
        assert_eq!(buffer.pending().unwrap(), 0);
        assert_eq!(sink.committed().len(), 1);
    }

    #[test]
    fn test_duplicates_only_pass_still_commits() {
        let (_dir, buffer) = temp_buffer();
        let record = fix(1, 48.0);

        let mut sink = MemorySink::new();
        buffer.append(&record).unwrap();
        buffer.replay(&mut sink).unwrap();
        assert_eq!(sink.commit_calls, 1);

        // Same record buffered again: the pass sees only a duplicate,
        // but it issued an insert and must still close its transaction.
        buffer.append(&record).unwrap();
        let stats = buffer.replay(&mut sink).unwrap();
        assert_eq!(stats.accepted, 0);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(sink.commit_calls, 2);
    }

    #[test]
    fn test_replay_keeps_records_on_insert_error() {
        let (_dir, buffer) = temp_buffer();
        buffer.append(&fix(1, 48.0)).unwrap();
        buffer.append(&fix(2, 49.0)).unwrap();

        let mut sink = MemorySink::new();
        sink.fail_inserts = true;
        let stats = buffer.replay(&mut sink).unwrap();
        assert_eq!(stats.accepted, 0);
        assert_eq!(stats.remaining, 2);
        assert_eq!(buffer.pending().unwrap(), 2);
    }

    #[test]
    fn test_replay_commit_failure_reverts_whole_pass() {
        let (_dir, buffer) = temp_buffer();
        buffer.append(&fix(1, 48.0)).unwrap();
        buffer.append(&fix(2, 49.0)).unwrap();

        let mut sink = MemorySink::new();
        sink.fail_commit = true;
        let stats = buffer.replay(&mut sink).unwrap();
        assert_eq!(stats.accepted, 0);
        assert_eq!(stats.remaining, 2);
        assert_eq!(buffer.pending().unwrap(), 2);
        assert!(sink.committed().is_empty());

        // Once commit works again, the same records drain.
        sink.fail_commit = false;
        let stats = buffer.replay(&mut sink).unwrap();
        assert_eq!(stats.accepted, 2);
        assert_eq!(buffer.pending().unwrap(), 0);
    }

    #[test]
    fn test_replay_preserves_undecodable_rows() {
        let (_dir, buffer) = temp_buffer();
        buffer.append(&fix(1, 48.0)).unwrap();

        // Corrupt a copy of the store with a hand-written garbage row.
        let mut content = std::fs::read_to_string(buffer.path()).unwrap();
        content.push_str("not-a-timestamp,xx,yy,,\n");
        std::fs::write(buffer.path(), content).unwrap();

        let mut sink = MemorySink::new();
        let stats = buffer.replay(&mut sink).unwrap();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.remaining, 1);
        assert_eq!(buffer.pending().unwrap(), 1);
    }

    #[test]
    fn test_replace_never_truncates_in_place() {
        let (_dir, buffer) = temp_buffer();
        buffer.append(&fix(1, 48.0)).unwrap();

        // A reader that opened the store before the rewrite keeps seeing
        // the complete old content through its handle.
        let mut old_handle = File::open(buffer.path()).unwrap();
        buffer.append(&fix(2, 49.0)).unwrap();

        let mut old_content = String::new();
        old_handle.read_to_string(&mut old_content).unwrap();
        assert_eq!(old_content.lines().count(), 1);
        assert!(old_content.starts_with("1970-01-01T00:00:01"));

        assert_eq!(buffer.pending().unwrap(), 2);
    }

    #[test]
    fn test_replay_clears_store_file() {
        let (_dir, buffer) = temp_buffer();
        buffer.append(&fix(1, 48.0)).unwrap();

        let mut sink = MemorySink::new();
        buffer.replay(&mut sink).unwrap();

        // The store file itself is rewritten empty, not deleted.
        assert!(buffer.path().exists());
        assert_eq!(std::fs::read_to_string(buffer.path()).unwrap(), "");
    }
}
