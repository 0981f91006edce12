use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures reported by the event store. Neither kind is retried here;
/// the daemon simply tries again on its next tick.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("could not connect to event store: {0}")]
    Connection(String),
    #[error("event query failed: {0}")]
    Query(String),
}

impl SourceError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::Query(message.into())
    }
}

/// A fetched row that cannot be turned into a message record.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed event received at {received_ts}: {reason}")]
pub struct MalformedRecord {
    pub received_ts: i64,
    pub reason: String,
}

impl MalformedRecord {
    pub fn new(received_ts: i64, reason: impl Into<String>) -> Self {
        Self {
            received_ts,
            reason: reason.into(),
        }
    }
}

/// Outcome of a failed line append.
///
/// `MissingParent` and `PermissionDenied` need an operator and halt the run;
/// anything else is an unexpected I/O fault and is fatal to the process.
#[derive(Debug, Error)]
pub enum AppendError {
    #[error("could not write {}, maybe the parent directory is missing", path.display())]
    MissingParent { path: PathBuf },
    #[error("could not write {}, insufficient permissions", path.display())]
    PermissionDenied { path: PathBuf },
    #[error("i/o failure while writing {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl AppendError {
    pub fn classify(path: PathBuf, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::MissingParent { path },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }
}

/// Why a write halted the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailure {
    MissingParent,
    PermissionDenied,
}

impl std::fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteFailure::MissingParent => write!(f, "parent directory is missing"),
            WriteFailure::PermissionDenied => write!(f, "insufficient permissions"),
        }
    }
}

/// Recoverable failures: the run stops, the watermark stays where it was,
/// and the next run re-fetches from the old watermark.
#[derive(Debug, Error)]
pub enum RunFailure {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Malformed(#[from] MalformedRecord),
    #[error("could not write message {received_ts} of room {room} to {}: {reason}", path.display())]
    Write {
        received_ts: i64,
        room: String,
        path: PathBuf,
        reason: WriteFailure,
    },
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("could not read checkpoint {}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("checkpoint {} does not hold a timestamp: {contents:?}", path.display())]
    Corrupt { path: PathBuf, contents: String },
    #[error("could not save checkpoint {}", path.display())]
    Save {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("refusing to move checkpoint back from {current} to {attempted}")]
    Regression { current: i64, attempted: i64 },
}

/// Errors that must terminate the process.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("unexpected i/o failure on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
