use crate::error::CheckpointError;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};

pub const CHECKPOINT_FILE_NAME: &str = ".last_ts";

/// What the checkpoint file held when it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredWatermark {
    /// No checkpoint yet: the first run exports the whole history.
    Missing,
    At(i64),
}

impl StoredWatermark {
    pub fn value(self) -> i64 {
        match self {
            StoredWatermark::Missing => 0,
            StoredWatermark::At(ts) => ts,
        }
    }
}

/// Persists the reception timestamp of the last durably exported record
/// as a plain decimal string in `<output_directory>/.last_ts`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_directory(output_directory: &Path) -> Self {
        Self::new(output_directory.join(CHECKPOINT_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<StoredWatermark, CheckpointError> {
        info!("Reading last timestamp written from previous run.");
        let stored = self.read()?;
        match stored {
            StoredWatermark::Missing => warn!(
                path = %self.path.display(),
                "No state file found, setting last timestamp written to 0."
            ),
            StoredWatermark::At(ts) => info!(watermark = ts, "Last timestamp from previous run."),
        }
        Ok(stored)
    }

    /// Atomically replaces the stored watermark. Refuses to move it backwards.
    pub fn save(&self, ts: i64) -> Result<(), CheckpointError> {
        if let StoredWatermark::At(current) = self.read()?
            && ts < current
        {
            return Err(CheckpointError::Regression {
                current,
                attempted: ts,
            });
        }

        let save_err = |source: io::Error| CheckpointError::Save {
            path: self.path.clone(),
            source,
        };
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(save_err)?;
        tmp.write_all(ts.to_string().as_bytes()).map_err(save_err)?;
        tmp.as_file().sync_all().map_err(save_err)?;
        tmp.persist(&self.path).map_err(|e| save_err(e.error))?;

        info!(watermark = ts, "Timestamp written to state file.");
        Ok(())
    }

    fn read(&self) -> Result<StoredWatermark, CheckpointError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StoredWatermark::Missing),
            Err(source) => {
                return Err(CheckpointError::Unreadable {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        match contents.trim().parse::<i64>() {
            Ok(ts) if ts >= 0 => Ok(StoredWatermark::At(ts)),
            _ => Err(CheckpointError::Corrupt {
                path: self.path.clone(),
                contents,
            }),
        }
    }
}
