// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logger configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Logger configuration.
///
/// Populated from environment-backed CLI flags in the binary; the
/// builder exists for library use and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Serial device the GNSS receiver is attached to.
    pub device: String,

    /// Serial baud rate.
    pub baud: u32,

    /// Database host.
    pub db_host: String,

    /// Database port.
    pub db_port: u16,

    /// Database name.
    pub db_name: String,

    /// Database user.
    pub db_user: String,

    /// Database password.
    pub db_password: String,

    /// Path of the local durable buffer file.
    pub buffer_file: PathBuf,

    /// Reachability probe host (defaults to the database host).
    pub probe_host: Option<String>,

    /// Reachability probe port (defaults to the database port).
    pub probe_port: Option<u16>,

    /// Probe timeout in seconds; 0 disables the probe.
    pub probe_timeout_secs: u64,

    /// Seconds between opportunistic buffer flush attempts.
    pub flush_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: "/dev/serial0".to_string(),
            baud: 9600,
            db_host: "localhost".to_string(),
            db_port: 5432,
            db_name: "gnss".to_string(),
            db_user: "gnss".to_string(),
            db_password: String::new(),
            buffer_file: PathBuf::from("buffer.csv"),
            probe_host: None,
            probe_port: None,
            probe_timeout_secs: 3,
            flush_interval_secs: 30,
        }
    }
}

impl Config {
    /// Create a new config builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Flush interval as a duration.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    /// Resolved probe target, or `None` when probing is disabled.
    pub fn probe_target(&self) -> Option<(String, u16, Duration)> {
        if self.probe_timeout_secs == 0 {
            return None;
        }
        let host = self.probe_host.clone().unwrap_or_else(|| self.db_host.clone());
        let port = self.probe_port.unwrap_or(self.db_port);
        Some((host, port, Duration::from_secs(self.probe_timeout_secs)))
    }
}

/// Config builder for fluent API.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    device: Option<String>,
    baud: Option<u32>,
    db_host: Option<String>,
    db_port: Option<u16>,
    db_name: Option<String>,
    db_user: Option<String>,
    db_password: Option<String>,
    buffer_file: Option<PathBuf>,
    probe_host: Option<String>,
    probe_port: Option<u16>,
    probe_timeout_secs: Option<u64>,
    flush_interval_secs: Option<u64>,
}

impl ConfigBuilder {
    /// Set the serial device path.
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// Set the serial baud rate.
    pub fn baud(mut self, baud: u32) -> Self {
        self.baud = Some(baud);
        self
    }

    /// Set the database host.
    pub fn db_host(mut self, host: impl Into<String>) -> Self {
        self.db_host = Some(host.into());
        self
    }

    /// Set the database port.
    pub fn db_port(mut self, port: u16) -> Self {
        self.db_port = Some(port);
        self
    }

    /// Set the database name.
    pub fn db_name(mut self, name: impl Into<String>) -> Self {
        self.db_name = Some(name.into());
        self
    }

    /// Set the database user.
    pub fn db_user(mut self, user: impl Into<String>) -> Self {
        self.db_user = Some(user.into());
        self
    }

    /// Set the database password.
    pub fn db_password(mut self, password: impl Into<String>) -> Self {
        self.db_password = Some(password.into());
        self
    }

    /// Set the durable buffer file path.
    pub fn buffer_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.buffer_file = Some(path.into());
        self
    }

    /// Set the reachability probe host.
    pub fn probe_host(mut self, host: impl Into<String>) -> Self {
        self.probe_host = Some(host.into());
        self
    }

    /// Set the reachability probe port.
    pub fn probe_port(mut self, port: u16) -> Self {
        self.probe_port = Some(port);
        self
    }

    /// Set the probe timeout in seconds (0 disables the probe).
    pub fn probe_timeout_secs(mut self, secs: u64) -> Self {
        self.probe_timeout_secs = Some(secs);
        self
    }

    /// Set the flush interval in seconds.
    pub fn flush_interval_secs(mut self, secs: u64) -> Self {
        self.flush_interval_secs = Some(secs);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Config {
        let defaults = Config::default();

        Config {
            device: self.device.unwrap_or(defaults.device),
            baud: self.baud.unwrap_or(defaults.baud),
            db_host: self.db_host.unwrap_or(defaults.db_host),
            db_port: self.db_port.unwrap_or(defaults.db_port),
            db_name: self.db_name.unwrap_or(defaults.db_name),
            db_user: self.db_user.unwrap_or(defaults.db_user),
            db_password: self.db_password.unwrap_or(defaults.db_password),
            buffer_file: self.buffer_file.unwrap_or(defaults.buffer_file),
            probe_host: self.probe_host.or(defaults.probe_host),
            probe_port: self.probe_port.or(defaults.probe_port),
            probe_timeout_secs: self
                .probe_timeout_secs
                .unwrap_or(defaults.probe_timeout_secs),
            flush_interval_secs: self
                .flush_interval_secs
                .unwrap_or(defaults.flush_interval_secs),
        }
    }
}
