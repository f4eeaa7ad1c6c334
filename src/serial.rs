// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Line sources: the serial GNSS receiver and a simulated one.
//!
//! The serial read is the only blocking point of the ingest loop, so it
//! carries a short timeout -- a timeout surfaces as "no line" and lets
//! the flush timer get serviced.

use anyhow::{Context, Result};
use serialport::{DataBits, Parity, SerialPort, StopBits};
use std::io::{self, BufRead, BufReader, ErrorKind};
use std::time::Duration;

/// Serial read timeout. Short enough to service the flush timer every
/// iteration, long enough for the 1 Hz sentence cadence of common
/// receivers.
const READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// A provider of raw NMEA text lines.
pub trait LineSource {
    /// Read one line. `Ok(None)` means no line was available within the
    /// timeout; errors are unrecoverable sensor faults.
    fn read_line(&mut self) -> io::Result<Option<String>>;
}

/// Serial GNSS receiver (8N1 framing).
pub struct SerialLineSource {
    reader: BufReader<Box<dyn SerialPort>>,
}

impl SerialLineSource {
    /// Open the serial device. Failure here is a fatal startup error.
    pub fn open(device: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(device, baud)
            .timeout(READ_TIMEOUT)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .open()
            .with_context(|| format!("failed to open GNSS device {device}"))?;

        Ok(Self {
            reader: BufReader::new(port),
        })
    }
}

impl LineSource for SerialLineSource {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut raw = Vec::new();
        match self.reader.read_until(b'\n', &mut raw) {
            Ok(0) => Ok(None),
            // Garbled bytes are replaced, never fatal.
            Ok(_) => Ok(Some(String::from_utf8_lossy(&raw).trim().to_string())),
            Err(e) if matches!(
                e.kind(),
                ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
            ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Canned sentences for running without GNSS hardware.
const FAKE_SENTENCES: [&str; 2] = [
    "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A",
    "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47",
];

/// Simulated receiver emitting canned RMC/GGA sentences.
pub struct FakeLineSource {
    next: usize,
    interval: Duration,
}

impl FakeLineSource {
    /// 1 Hz, matching a real receiver's cadence.
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(1))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self { next: 0, interval }
    }
}

impl Default for FakeLineSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LineSource for FakeLineSource {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        std::thread::sleep(self.interval);
        let line = FAKE_SENTENCES[self.next % FAKE_SENTENCES.len()];
        self.next += 1;
        Ok(Some(line.to_string()))
    }
}
