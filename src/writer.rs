use crate::error::{AppendError, FatalError};
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Destination for exported lines.
pub trait LineSink {
    /// Appends `line` plus a newline to `path`, creating the file if needed.
    fn append(&mut self, path: &Path, line: &str) -> Result<(), AppendError>;

    /// Makes everything appended so far durable.
    fn sync(&mut self) -> Result<(), FatalError>;
}

/// Appends to files with one open/write/close per line. No handle outlives
/// a single append. Directories are never created.
#[derive(Debug, Default)]
pub struct FileAppender {
    touched: BTreeSet<PathBuf>,
}

impl FileAppender {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LineSink for FileAppender {
    fn append(&mut self, path: &Path, line: &str) -> Result<(), AppendError> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');

        OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .and_then(|mut file| file.write_all(buf.as_bytes()))
            .map_err(|e| AppendError::classify(path.to_path_buf(), e))?;

        self.touched.insert(path.to_path_buf());
        Ok(())
    }

    fn sync(&mut self) -> Result<(), FatalError> {
        while let Some(path) = self.touched.pop_first() {
            OpenOptions::new()
                .append(true)
                .open(&path)
                .and_then(|file| file.sync_data())
                .map_err(|source| FatalError::Io { path, source })?;
        }
        Ok(())
    }
}
