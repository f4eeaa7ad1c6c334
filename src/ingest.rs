// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingest loop.
//!
//! The orchestrating state machine: one line per iteration, dispatched
//! to the speed or position path, with a live-insert-or-buffer decision
//! for every fix and an opportunistic flush timer.
//!
//! # Operation
//!
//! 1. Read one line (blocking, bounded by the serial read timeout)
//! 2. Speed sentence -> update the carried speed and loop
//! 3. Position sentence -> stamp UTC time, attach the carried speed,
//!    attempt a live insert; on failure buffer locally and reconnect
//! 4. Every flush interval: liveness probe, replay the buffer or force
//!    a reconnect
//!
//! Parse and sink failures never escalate past one iteration; only a
//! sensor fault or the stop flag ends the loop.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::DurableBuffer;
use crate::config::Config;
use crate::nmea::{self, Sentence};
use crate::serial::LineSource;
use crate::sink::{Fix, FixSink, InsertOutcome, SinkProvider};

/// Ingest statistics, reported at shutdown.
#[derive(Debug, Default, Clone)]
pub struct IngestStats {
    /// Non-empty lines read from the sensor.
    pub lines_read: u64,
    /// Speed updates taken from RMC sentences.
    pub speed_updates: u64,
    /// Position sentences that parsed into a fix.
    pub fixes_parsed: u64,
    /// Position sentences that failed to parse.
    pub parse_failures: u64,
    /// Fixes written live to the sink.
    pub live_inserts: u64,
    /// Live inserts the sink rejected as duplicates.
    pub duplicates: u64,
    /// Fixes diverted to the durable buffer.
    pub buffered: u64,
    /// Fixes lost because both the live insert and the buffer write
    /// failed. This should stay at zero.
    pub lost: u64,
    /// Buffered records drained by the flush timer.
    pub replayed: u64,
}

/// Handle to stop a running ingest loop.
#[derive(Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    /// Request a cooperative stop; the loop exits after the current
    /// iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// The ingest state machine.
pub struct IngestLoop<P: SinkProvider> {
    config: Config,
    buffer: DurableBuffer,
    provider: P,
    /// Most recent speed report, folded into the next fix.
    last_speed: Option<f64>,
    last_flush: Instant,
    running: Arc<AtomicBool>,
    stats: IngestStats,
}

impl<P: SinkProvider> IngestLoop<P> {
    pub fn new(config: Config, buffer: DurableBuffer, provider: P) -> Self {
        Self {
            config,
            buffer,
            provider,
            last_speed: None,
            last_flush: Instant::now(),
            running: Arc::new(AtomicBool::new(false)),
            stats: IngestStats::default(),
        }
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    pub fn buffer(&self) -> &DurableBuffer {
        &self.buffer
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    /// Get a handle to stop the loop from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: self.running.clone(),
        }
    }

    /// Run the loop until stopped or the sensor faults. The shutdown
    /// sequence runs on both exit paths.
    pub fn run(&mut self, source: &mut dyn LineSource) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        if self.provider.connect(&self.buffer).is_none() {
            tracing::warn!("starting offline; fixes will be buffered locally");
        }

        let result = self.run_inner(source);
        self.shutdown();
        result
    }

    fn run_inner(&mut self, source: &mut dyn LineSource) -> Result<()> {
        while self.running.load(Ordering::SeqCst) {
            match source.read_line() {
                Ok(Some(line)) => {
                    if !line.is_empty() {
                        self.handle_line(&line);
                    }
                }
                Ok(None) => {}
                Err(e) => return Err(e).context("GNSS sensor read failed"),
            }
            self.tick();
        }
        Ok(())
    }

    /// Dispatch one raw line.
    pub fn handle_line(&mut self, line: &str) {
        self.stats.lines_read += 1;

        match nmea::classify(line) {
            Sentence::Speed => {
                if let Some(kmh) = nmea::parse_speed_sentence(line) {
                    self.last_speed = Some(kmh);
                    self.stats.speed_updates += 1;
                    tracing::trace!(speed_kmh = kmh, "speed updated");
                }
            }
            Sentence::Position => match nmea::parse_position_sentence(line) {
                Some(fragment) => {
                    self.stats.fixes_parsed += 1;
                    let fix = Fix {
                        timestamp: Utc::now(),
                        latitude: fragment.latitude,
                        longitude: fragment.longitude,
                        altitude: fragment.altitude,
                        speed_kmh: Some(self.last_speed.unwrap_or(0.0)),
                    };
                    self.write_fix(fix);
                }
                None => {
                    self.stats.parse_failures += 1;
                    tracing::debug!(%line, "position sentence failed to parse");
                }
            },
            Sentence::Ignored => {}
        }
    }

    /// Live insert with buffer fallback.
    fn write_fix(&mut self, fix: Fix) {
        match self.try_live_insert(&fix) {
            Ok(InsertOutcome::Inserted) => {
                self.stats.live_inserts += 1;
                tracing::trace!(timestamp = %fix.timestamp, "fix stored");
            }
            Ok(InsertOutcome::Duplicate) => {
                self.stats.duplicates += 1;
            }
            Err(e) => {
                tracing::warn!("live insert failed, buffering locally: {e:#}");

                if let Some(session) = self.provider.session_mut() {
                    session.rollback();
                }

                match self.buffer.append(&fix) {
                    Ok(true) => self.stats.buffered += 1,
                    // Positionless fix, dropped by the store.
                    Ok(false) => {}
                    Err(be) => {
                        // The single true data-loss path.
                        self.stats.lost += 1;
                        tracing::error!(timestamp = %fix.timestamp, "fix lost, buffer write failed: {be}");
                    }
                }

                // Fresh session for the next iteration.
                self.provider.drop_session();
                if self.provider.connect(&self.buffer).is_none() {
                    tracing::debug!("reconnect failed, still offline");
                }
            }
        }
    }

    fn try_live_insert(&mut self, fix: &Fix) -> Result<InsertOutcome> {
        let Some(session) = self.provider.ensure_live(&self.buffer) else {
            bail!("database offline");
        };
        let outcome = session.insert(fix)?;
        session.commit()?;
        Ok(outcome)
    }

    /// Opportunistic flush timer, checked once per loop iteration.
    pub fn tick(&mut self) {
        if self.last_flush.elapsed() < self.config.flush_interval() {
            return;
        }
        self.last_flush = Instant::now();

        // ensure_live probes the session and reconnects (which itself
        // replays) when the probe fails.
        match self.provider.ensure_live(&self.buffer) {
            Some(session) => match self.buffer.replay(session) {
                Ok(stats) if stats.accepted > 0 => {
                    self.stats.replayed += stats.accepted as u64;
                    tracing::info!(
                        accepted = stats.accepted,
                        remaining = stats.remaining,
                        "flushed buffered records"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("buffer flush failed: {e}"),
            },
            None => tracing::debug!("flush tick skipped, database offline"),
        }
    }

    /// Close resources, each guarded independently.
    fn shutdown(&mut self) {
        self.provider.drop_session();
        tracing::info!(
            lines = self.stats.lines_read,
            live_inserts = self.stats.live_inserts,
            buffered = self.stats.buffered,
            replayed = self.stats.replayed,
            lost = self.stats.lost,
            "ingest loop stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryProvider;
    use std::collections::VecDeque;
    use std::io;

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
    const RMC_10KN: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,10.0,084.4,230394,003.1,W*6A";

    struct ScriptedSource {
        lines: VecDeque<String>,
    }

    impl ScriptedSource {
        fn new(lines: &[&str]) -> Self {
            Self {
                lines: lines.iter().map(|l| l.to_string()).collect(),
            }
        }
    }

    impl LineSource for ScriptedSource {
        fn read_line(&mut self) -> io::Result<Option<String>> {
            match self.lines.pop_front() {
                Some(line) => Ok(Some(line)),
                // Script exhausted: behave like a dying sensor.
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "sensor gone")),
            }
        }
    }

    fn ingest(online: bool) -> (IngestLoop<MemoryProvider>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::builder().flush_interval_secs(0).build();
        let buffer = DurableBuffer::new(dir.path().join("buffer.csv"));
        let provider = MemoryProvider::new(online);
        (IngestLoop::new(config, buffer, provider), dir)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_live_insert_with_sink_available() {
        let (mut ingest, _dir) = ingest(true);
        ingest.handle_line(GGA);

        let sink = ingest.provider_mut().sink();
        assert_eq!(sink.committed().len(), 1);
        let fix = &sink.committed()[0];
        assert!(close(fix.latitude.unwrap(), 48.1173));
        assert!(close(fix.longitude.unwrap(), 11.5167));
        assert_eq!(fix.altitude, Some(545.4));
        assert_eq!(fix.speed_kmh, Some(0.0));
        assert_eq!(ingest.stats().live_inserts, 1);
        assert_eq!(ingest.buffer().pending().unwrap(), 0);
    }

    #[test]
    fn test_offline_buffers_instead_of_inserting() {
        let (mut ingest, _dir) = ingest(false);
        ingest.handle_line(GGA);

        assert_eq!(ingest.provider_mut().sink().insert_calls, 0);
        assert_eq!(ingest.buffer().pending().unwrap(), 1);
        assert_eq!(ingest.stats().buffered, 1);
        assert_eq!(ingest.stats().live_inserts, 0);
    }

    #[test]
    fn test_positionless_fix_is_not_counted_buffered() {
        let (mut ingest, _dir) = ingest(false);
        // Empty latitude field: the fragment parses but the resulting
        // fix has no position, so the store drops it.
        ingest.handle_line("$GPGGA,123519,,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47");

        assert_eq!(ingest.stats().fixes_parsed, 1);
        assert_eq!(ingest.stats().buffered, 0);
        assert_eq!(ingest.stats().lost, 0);
        assert_eq!(ingest.buffer().pending().unwrap(), 0);
    }

    #[test]
    fn test_speed_is_carried_into_next_fix() {
        let (mut ingest, _dir) = ingest(true);
        ingest.handle_line(RMC_10KN);
        ingest.handle_line(GGA);

        let sink = ingest.provider_mut().sink();
        assert_eq!(sink.committed().len(), 1);
        let kmh = sink.committed()[0].speed_kmh.unwrap();
        assert!(close(kmh, 18.52), "got {kmh}");
        assert_eq!(ingest.stats().speed_updates, 1);
    }

    #[test]
    fn test_short_position_sentence_has_no_side_effects() {
        let (mut ingest, _dir) = ingest(true);
        ingest.handle_line("$GPGGA,123519,4807.038,N");

        assert_eq!(ingest.stats().parse_failures, 1);
        assert_eq!(ingest.provider_mut().sink().insert_calls, 0);
        assert_eq!(ingest.buffer().pending().unwrap(), 0);
    }

    #[test]
    fn test_unknown_sentences_are_ignored() {
        let (mut ingest, _dir) = ingest(true);
        ingest.handle_line("$GPGSV,3,1,11,03,03,111,00,04,15,270,00*74");

        assert_eq!(ingest.stats().lines_read, 1);
        assert_eq!(ingest.provider_mut().sink().insert_calls, 0);
    }

    #[test]
    fn test_flush_tick_drains_backlog_after_reconnect() {
        let (mut ingest, _dir) = ingest(false);
        ingest.handle_line(GGA);
        assert_eq!(ingest.buffer().pending().unwrap(), 1);

        // Connectivity returns; the next tick replays the backlog.
        ingest.provider_mut().online = true;
        ingest.tick();

        assert_eq!(ingest.buffer().pending().unwrap(), 0);
        assert_eq!(ingest.provider_mut().sink().committed().len(), 1);
        assert_eq!(ingest.stats().replayed, 1);
    }

    #[test]
    fn test_run_terminates_on_sensor_fault() {
        let (mut ingest, _dir) = ingest(true);
        let mut source = ScriptedSource::new(&[RMC_10KN, GGA]);

        let result = ingest.run(&mut source);
        assert!(result.is_err());
        assert_eq!(ingest.stats().lines_read, 2);
        assert_eq!(ingest.provider_mut().sink().committed().len(), 1);
    }

    #[test]
    fn test_stop_handle() {
        let (ingest, _dir) = ingest(true);
        let handle = ingest.stop_handle();
        handle.stop();
        assert!(!ingest.running.load(Ordering::SeqCst));
    }
}
