// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! GNSS Data Logger
//!
//! Reads NMEA sentences from a serial GNSS receiver, extracts
//! position/speed fixes and persists them to PostgreSQL. When the
//! database or network is unreachable, fixes are buffered to a local
//! durable CSV store and replayed once connectivity returns.
//!
//! # Architecture
//!
//! ```text
//! serial line --> nmea parser --> IngestLoop
//!                                    |-- live insert --> Connectivity/Session --> PostgreSQL
//!                                    +-- on failure  --> DurableBuffer (buffer.csv)
//!                                                          ^ replayed on reconnect / flush timer
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use gnss_logger::{Config, Connectivity, DurableBuffer, IngestLoop, SerialLineSource};
//!
//! let config = Config::builder().db_host("db.example.net").build();
//! let buffer = DurableBuffer::new(&config.buffer_file);
//! let provider = Connectivity::new(config.clone())?;
//! let mut source = SerialLineSource::open(&config.device, config.baud)?;
//!
//! let mut ingest = IngestLoop::new(config, buffer, provider);
//! ingest.run(&mut source)?;
//! ```

pub mod buffer;
pub mod config;
pub mod db;
pub mod ingest;
pub mod nmea;
pub mod serial;
pub mod sink;

pub use buffer::{BufferError, DurableBuffer, ReplayStats};
pub use config::Config;
pub use db::{Connectivity, Session};
pub use ingest::{IngestLoop, IngestStats, StopHandle};
pub use nmea::{PositionFragment, Sentence};
pub use serial::{FakeLineSource, LineSource, SerialLineSource};
pub use sink::{Fix, FixSink, InsertOutcome, MemoryProvider, MemorySink, SinkProvider};
