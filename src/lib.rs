//! # synapse-room-logger
//!
//! Exports the message history of selected [Matrix](https://matrix.org) rooms from a
//! Synapse homeserver database to plain log files, one JSON object per line.
//!
//! ## What it does
//!
//! Synapse stores every event in its `events` table, with the full JSON envelope in
//! `event_json`. This tool reads the `m.room.message` events of the configured rooms,
//! keeps the useful fields (`ts`, `origin_ts`, `origin`, `sender`, `event_id`,
//! `room_id`, `message`, `url`) and appends them to one file per room and UTC day:
//!
//! ```text
//! <output_directory>/<room_name>_<YYYYMMDD>.log
//! ```
//!
//! The database is only ever read; log files are only ever appended to.
//!
//! ## Incremental export
//!
//! The reception timestamp of the last exported message is kept in
//! `<output_directory>/.last_ts`. Each run only fetches newer messages and only moves
//! that checkpoint after the whole batch has been written and synced. A run that stops
//! half-way (database gone, unwritable directory, malformed event) leaves the checkpoint
//! where it was, so the next run starts over from there: lines may be duplicated after
//! a failure, never lost.
//!
//! ## Usage
//!
//! ```sh
//! # Export once and exit (for cron)
//! roomlogger cron --config /etc/roomlogger/config.yaml
//!
//! # Keep polling until SIGINT/SIGTERM
//! roomlogger daemon --debug
//! ```
//!
//! ## Limits
//!
//! A single process must own an output directory. Running two instances against the
//! same directory and checkpoint is not supported.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod mapper;
pub mod run;
pub mod scheduler;
pub mod source;
pub mod writer;

pub use checkpoint::{CheckpointStore, StoredWatermark};
pub use config::{DatabaseConfig, LoggerConfig};
pub use error::{FatalError, RunFailure};
pub use mapper::{FileLayout, MessageRecord, RecordMapper};
pub use run::{Exporter, RunOutcome, RunReport};
pub use source::{EventSource, EventStore, RawEventRow, SqliteEventStore};
pub use writer::{FileAppender, LineSink};

#[cfg(feature = "postgres")]
pub use source::PostgresEventStore;
