// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fix record and sink abstraction.
//!
//! Defines the insert contract the ingest loop and the durable buffer
//! write against, plus in-memory implementations used by tests and the
//! fake receiver mode.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::buffer::DurableBuffer;

/// One resolved position reading at a point in time.
///
/// Immutable once constructed; consumed exactly once (written live or
/// buffered) and then discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    /// UTC time the fix was stamped by the ingest loop.
    pub timestamp: DateTime<Utc>,
    /// Decimal degrees in [-90, 90]; `None` when the sentence carried no
    /// usable latitude.
    pub latitude: Option<f64>,
    /// Decimal degrees in [-180, 180].
    pub longitude: Option<f64>,
    /// Meters above mean sea level.
    pub altitude: Option<f64>,
    /// Speed in km/h, carried over from the most recent RMC sentence.
    pub speed_kmh: Option<f64>,
}

impl Fix {
    /// A fix without both coordinates is not meaningful and must never
    /// be persisted.
    pub fn has_position(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

/// Outcome of a sink insert.
///
/// Duplicates are an expected, idempotent result (uniqueness constraint
/// on the timestamp), not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Row was stored.
    Inserted,
    /// Row was already present; the sink rejected it via its
    /// uniqueness constraint.
    Duplicate,
}

/// Insert contract of the persistence target.
///
/// `insert` stages a row in the current transaction, `commit` makes the
/// staged rows durable. `rollback` is best-effort: its result is
/// intentionally discarded so the buffering fallback is never blocked
/// by a failing rollback.
pub trait FixSink {
    /// Stage one fix. Errors cover connectivity and constraint failures
    /// other than the expected duplicate case.
    fn insert(&mut self, fix: &Fix) -> Result<InsertOutcome>;

    /// Make all staged inserts durable.
    fn commit(&mut self) -> Result<()>;

    /// Discard staged inserts, swallowing errors.
    fn rollback(&mut self);
}

/// Session lifecycle seam between the ingest loop and the sink backend.
///
/// At most one live session exists at a time; the previous one is torn
/// down (best-effort) before a replacement is installed.
pub trait SinkProvider {
    /// Concrete sink handle managed by this provider.
    type Sink: FixSink;

    /// Open a fresh session, replaying the durable buffer into it before
    /// returning. `None` means offline -- callers must not treat that as
    /// fatal.
    fn connect(&mut self, buffer: &DurableBuffer) -> Option<&mut Self::Sink>;

    /// Probe the current session for liveness; on any failure tear it
    /// down and reconnect.
    fn ensure_live(&mut self, buffer: &DurableBuffer) -> Option<&mut Self::Sink>;

    /// Current session, if any, without probing.
    fn session_mut(&mut self) -> Option<&mut Self::Sink>;

    /// Tear down the current session, swallowing close errors.
    fn drop_session(&mut self);
}

// ============================================================================
// In-memory implementations (tests, fake mode)
// ============================================================================

/// In-memory sink with a timestamp uniqueness constraint and fault
/// injection switches.
#[derive(Debug, Default)]
pub struct MemorySink {
    committed: Vec<Fix>,
    staged: Vec<Fix>,
    seen: HashSet<String>,
    /// Total insert attempts, including failed ones.
    pub insert_calls: usize,
    /// Total commit attempts, including failed ones.
    pub commit_calls: usize,
    /// When set, every insert fails as a connectivity error.
    pub fail_inserts: bool,
    /// When set, commit fails and staged rows are discarded.
    pub fail_commit: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows made durable so far.
    pub fn committed(&self) -> &[Fix] {
        &self.committed
    }
}

impl FixSink for MemorySink {
    fn insert(&mut self, fix: &Fix) -> Result<InsertOutcome> {
        self.insert_calls += 1;
        if self.fail_inserts {
            bail!("sink unavailable");
        }

        let key = fix.timestamp.to_rfc3339();
        let staged_dup = self.staged.iter().any(|f| f.timestamp == fix.timestamp);
        if self.seen.contains(&key) || staged_dup {
            return Ok(InsertOutcome::Duplicate);
        }

        self.staged.push(fix.clone());
        Ok(InsertOutcome::Inserted)
    }

    fn commit(&mut self) -> Result<()> {
        self.commit_calls += 1;
        if self.fail_commit {
            self.staged.clear();
            bail!("commit failed");
        }
        for fix in self.staged.drain(..) {
            self.seen.insert(fix.timestamp.to_rfc3339());
            self.committed.push(fix);
        }
        Ok(())
    }

    fn rollback(&mut self) {
        self.staged.clear();
    }
}

/// In-memory provider with a toggleable online flag.
///
/// Mirrors the connectivity manager's contract: `connect` replays the
/// durable buffer into the fresh session before handing it out.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    sink: MemorySink,
    /// Whether connect/ensure_live succeed.
    pub online: bool,
    /// Number of connect attempts observed.
    pub connects: usize,
}

impl MemoryProvider {
    pub fn new(online: bool) -> Self {
        Self {
            sink: MemorySink::new(),
            online,
            connects: 0,
        }
    }

    pub fn sink(&self) -> &MemorySink {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut MemorySink {
        &mut self.sink
    }
}

impl SinkProvider for MemoryProvider {
    type Sink = MemorySink;

    fn connect(&mut self, buffer: &DurableBuffer) -> Option<&mut MemorySink> {
        self.connects += 1;
        if !self.online {
            return None;
        }
        if let Err(e) = buffer.replay(&mut self.sink) {
            tracing::warn!("buffer replay on connect failed: {e}");
        }
        Some(&mut self.sink)
    }

    fn ensure_live(&mut self, buffer: &DurableBuffer) -> Option<&mut MemorySink> {
        if self.online {
            return Some(&mut self.sink);
        }
        self.drop_session();
        self.connect(buffer)
    }

    fn session_mut(&mut self) -> Option<&mut MemorySink> {
        self.online.then_some(&mut self.sink)
    }

    fn drop_session(&mut self) {
        self.sink.rollback();
    }
}
