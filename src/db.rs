// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Database connectivity.
//!
//! Owns the PostgreSQL session lifecycle: reachability probe, encrypted
//! handshake, liveness check and reconnect. Going offline is a normal
//! operating condition here, not an error -- callers get `None` and fall
//! back to the durable buffer.

use anyhow::{Context, Result};
use postgres::config::SslMode;
use postgres::{Client, Statement};
use postgres_native_tls::MakeTlsConnector;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::buffer::DurableBuffer;
use crate::config::Config;
use crate::sink::{Fix, FixSink, InsertOutcome, SinkProvider};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Idempotent insert: the uniqueness constraint on the timestamp makes
/// re-submitting an already-stored fix a no-op (0 rows affected).
const INSERT_SQL: &str = "INSERT INTO gnss_data (timestamp, latitude, longitude, altitude, speed) \
     VALUES ($1, $2, $3, $4, $5) ON CONFLICT (timestamp) DO NOTHING";

/// One database session: a connection plus the prepared insert
/// statement. Both are replaced together on reconnect; a session is
/// never partially valid.
pub struct Session {
    client: Client,
    insert: Statement,
    in_tx: bool,
}

impl Session {
    fn open(config: &Config, tls: &MakeTlsConnector) -> Result<Self> {
        let mut client = postgres::Config::new()
            .host(&config.db_host)
            .port(config.db_port)
            .dbname(&config.db_name)
            .user(&config.db_user)
            .password(&config.db_password)
            .ssl_mode(SslMode::Require)
            .connect_timeout(CONNECT_TIMEOUT)
            .connect(tls.clone())
            .context("database handshake failed")?;

        let insert = client
            .prepare(INSERT_SQL)
            .context("failed to prepare insert statement")?;

        Ok(Self {
            client,
            insert,
            in_tx: false,
        })
    }

    /// Trivial liveness probe.
    pub fn ping(&mut self) -> Result<()> {
        self.client.simple_query("SELECT 1")?;
        Ok(())
    }

    /// Server version string, for diagnostics.
    pub fn server_version(&mut self) -> Result<String> {
        let row = self.client.query_one("SELECT version()", &[])?;
        Ok(row.get(0))
    }

    /// Close the session, swallowing errors -- a failing close must not
    /// block installing a replacement.
    pub fn close(self) {
        let _ = self.client.close();
    }
}

impl FixSink for Session {
    fn insert(&mut self, fix: &Fix) -> Result<InsertOutcome> {
        if !self.in_tx {
            self.client.batch_execute("BEGIN")?;
            self.in_tx = true;
        }

        let rows = self.client.execute(
            &self.insert,
            &[
                &fix.timestamp,
                &fix.latitude,
                &fix.longitude,
                &fix.altitude,
                &fix.speed_kmh,
            ],
        )?;

        Ok(if rows == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    fn commit(&mut self) -> Result<()> {
        if self.in_tx {
            self.client.batch_execute("COMMIT")?;
            self.in_tx = false;
        }
        Ok(())
    }

    fn rollback(&mut self) {
        if self.in_tx {
            // Intentionally non-propagating: the buffering fallback must
            // never be blocked by a failing rollback.
            let _ = self.client.batch_execute("ROLLBACK");
            self.in_tx = false;
        }
    }
}

/// Owns the current database session and its replacement policy.
pub struct Connectivity {
    config: Config,
    tls: MakeTlsConnector,
    session: Option<Session>,
}

impl Connectivity {
    pub fn new(config: Config) -> Result<Self> {
        let connector = native_tls::TlsConnector::new().context("TLS connector init failed")?;
        Ok(Self {
            config,
            tls: MakeTlsConnector::new(connector),
            session: None,
        })
    }

    /// Probe + handshake without installing the session or touching the
    /// buffer. Used by `connect` and by the one-shot subcommands.
    pub fn open_session(&self) -> Result<Session> {
        if !self.probe_reachable() {
            anyhow::bail!("connectivity probe failed, network unreachable");
        }
        Session::open(&self.config, &self.tls)
    }

    /// Best-effort TCP reachability check, so an absent uplink fails
    /// fast instead of blocking in the database handshake. Returns true
    /// when probing is disabled or the target cannot be resolved.
    fn probe_reachable(&self) -> bool {
        let Some((host, port, timeout)) = self.config.probe_target() else {
            return true;
        };

        let addrs = match (host.as_str(), port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::debug!(%host, port, "probe target unresolvable ({e}), skipping probe");
                return true;
            }
        };

        for addr in addrs {
            if TcpStream::connect_timeout(&addr, timeout).is_ok() {
                return true;
            }
        }
        tracing::debug!(%host, port, "reachability probe failed");
        false
    }
}

impl SinkProvider for Connectivity {
    type Sink = Session;

    fn connect(&mut self, buffer: &DurableBuffer) -> Option<&mut Session> {
        self.drop_session();

        let mut session = match self.open_session() {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("staying offline: {e:#}");
                return None;
            }
        };
        tracing::info!(host = %self.config.db_host, "database session established");

        // Reconcile the backlog before the session is handed out.
        match buffer.replay(&mut session) {
            Ok(stats) if stats.accepted > 0 || stats.duplicates > 0 => {
                tracing::info!(
                    accepted = stats.accepted,
                    duplicates = stats.duplicates,
                    remaining = stats.remaining,
                    "replayed buffered records on connect"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("buffer replay on connect failed: {e}"),
        }

        self.session = Some(session);
        self.session.as_mut()
    }

    fn ensure_live(&mut self, buffer: &DurableBuffer) -> Option<&mut Session> {
        let alive = match self.session.as_mut() {
            Some(session) => session.ping().is_ok(),
            None => false,
        };
        if alive {
            return self.session.as_mut();
        }
        // connect() tears the stale session down first.
        self.connect(buffer)
    }

    fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    fn drop_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.rollback();
            session.close();
        }
    }
}
