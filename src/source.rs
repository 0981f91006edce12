//! Access to the homeserver's event tables.
//!
//! Synapse keeps event metadata in `events` and the full JSON envelope in
//! `event_json`; both share `event_id`:
//!
//! ```sql
//! SELECT e.received_ts, j.json
//! FROM events AS e
//! INNER JOIN event_json AS j USING (event_id)
//! WHERE e.room_id IN (...)
//!   AND e.received_ts > ?
//!   AND e.type = 'm.room.message'
//! ORDER BY e.received_ts;
//! ```
//!
//! The comparison is strict so that re-running from the last exported timestamp
//! never returns that row again.

use crate::error::SourceError;
use rusqlite::{Connection, OpenFlags, ToSql};
use std::ops::ControlFlow;
use std::path::PathBuf;

/// One row as returned by the event store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEventRow {
    pub received_ts: i64,
    pub json: String,
}

/// Something that can open a connection for the duration of one run.
pub trait EventStore {
    fn connect(&self) -> Result<Box<dyn EventSource + '_>, SourceError>;
}

impl<T: EventStore + ?Sized> EventStore for Box<T> {
    fn connect(&self) -> Result<Box<dyn EventSource + '_>, SourceError> {
        (**self).connect()
    }
}

/// An open connection. Dropping it releases the connection.
pub trait EventSource {
    /// Streams message rows of `room_ids` with `received_ts > after_ts`, in
    /// ascending `received_ts` order, into `visit`. Returning `Break` stops
    /// the scan without error.
    fn scan_messages(
        &mut self,
        room_ids: &[String],
        after_ts: i64,
        visit: &mut dyn FnMut(RawEventRow) -> ControlFlow<()>,
    ) -> Result<(), SourceError>;
}

fn sqlite_query(room_count: usize) -> String {
    let placeholders = vec!["?"; room_count].join(", ");
    format!(
        "SELECT e.received_ts, j.json \
         FROM events AS e \
         INNER JOIN event_json AS j USING (event_id) \
         WHERE e.room_id IN ({placeholders}) \
         AND e.received_ts > ? \
         AND e.type = 'm.room.message' \
         ORDER BY e.received_ts"
    )
}

// ── SQLite ────────────────────────────────────────────────────────────────────

/// A Synapse database stored in SQLite, opened read-only.
#[derive(Debug, Clone)]
pub struct SqliteEventStore {
    path: PathBuf,
}

impl SqliteEventStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl EventStore for SqliteEventStore {
    fn connect(&self) -> Result<Box<dyn EventSource + '_>, SourceError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            SourceError::connection(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(Box::new(SqliteEventSource { conn }))
    }
}

struct SqliteEventSource {
    conn: Connection,
}

impl EventSource for SqliteEventSource {
    fn scan_messages(
        &mut self,
        room_ids: &[String],
        after_ts: i64,
        visit: &mut dyn FnMut(RawEventRow) -> ControlFlow<()>,
    ) -> Result<(), SourceError> {
        if room_ids.is_empty() {
            return Ok(());
        }
        let query_err = |e: rusqlite::Error| SourceError::query(e.to_string());

        let mut stmt = self
            .conn
            .prepare(&sqlite_query(room_ids.len()))
            .map_err(query_err)?;
        let mut params: Vec<&dyn ToSql> = room_ids.iter().map(|r| r as &dyn ToSql).collect();
        params.push(&after_ts);

        let mut rows = stmt.query(params.as_slice()).map_err(query_err)?;
        while let Some(row) = rows.next().map_err(query_err)? {
            let event = RawEventRow {
                received_ts: row.get(0).map_err(query_err)?,
                json: row.get(1).map_err(query_err)?,
            };
            if visit(event).is_break() {
                break;
            }
        }
        Ok(())
    }
}

// ── PostgreSQL ────────────────────────────────────────────────────────────────

#[cfg(feature = "postgres")]
pub use self::pg::PostgresEventStore;

#[cfg(feature = "postgres")]
mod pg {
    use super::{EventSource, EventStore, RawEventRow};
    use crate::error::SourceError;
    use postgres::fallible_iterator::FallibleIterator;
    use postgres::types::ToSql;
    use postgres::{Client, NoTls};
    use std::ops::ControlFlow;
    use std::time::Duration;
    use tracing::info;

    const QUERY: &str = "SELECT e.received_ts, j.json \
         FROM events AS e \
         INNER JOIN event_json AS j USING (event_id) \
         WHERE e.room_id = ANY($1) \
         AND e.received_ts > $2 \
         AND e.type = 'm.room.message' \
         ORDER BY e.received_ts";

    /// The production Synapse store.
    #[derive(Debug, Clone)]
    pub struct PostgresEventStore {
        config: postgres::Config,
    }

    impl PostgresEventStore {
        pub fn new(
            host: &str,
            port: u16,
            dbname: &str,
            user: &str,
            password: &str,
            connect_timeout: Duration,
        ) -> Self {
            let mut config = postgres::Config::new();
            config
                .host(host)
                .port(port)
                .dbname(dbname)
                .user(user)
                .password(password)
                .connect_timeout(connect_timeout);
            Self { config }
        }
    }

    impl EventStore for PostgresEventStore {
        fn connect(&self) -> Result<Box<dyn EventSource + '_>, SourceError> {
            info!("Connecting to database ...");
            let client = self
                .config
                .connect(NoTls)
                .map_err(|e| SourceError::connection(e.to_string().replace('\n', " ")))?;
            info!("Connected to database.");
            Ok(Box::new(PostgresEventSource { client }))
        }
    }

    struct PostgresEventSource {
        client: Client,
    }

    impl Drop for PostgresEventSource {
        fn drop(&mut self) {
            info!("Disconnecting from database ...");
        }
    }

    fn classify(e: postgres::Error) -> SourceError {
        if e.is_closed() {
            SourceError::connection(e.to_string())
        } else {
            SourceError::query(e.to_string())
        }
    }

    impl EventSource for PostgresEventSource {
        fn scan_messages(
            &mut self,
            room_ids: &[String],
            after_ts: i64,
            visit: &mut dyn FnMut(RawEventRow) -> ControlFlow<()>,
        ) -> Result<(), SourceError> {
            let params: [&(dyn ToSql + Sync); 2] = [&room_ids, &after_ts];
            let mut rows = self.client.query_raw(QUERY, params).map_err(classify)?;
            while let Some(row) = rows.next().map_err(classify)? {
                let event = RawEventRow {
                    received_ts: row.try_get(0).map_err(classify)?,
                    json: row.try_get(1).map_err(classify)?,
                };
                if visit(event).is_break() {
                    break;
                }
            }
            Ok(())
        }
    }
}
