//! Append-only log file usable as a `tracing` writer
//!
//! The worker has no console, so its subscriber writes here. The file can be
//! truncated while the subscriber keeps writing to it.

use crate::Result;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing_subscriber::fmt::MakeWriter;

/// File name used in the temp directory when no path is given
pub const DEFAULT_LOG_NAME: &str = "deskmover_worker.log";

/// Shared handle to the worker log
#[derive(Clone, Debug)]
pub struct LogFile {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl LogFile {
    /// Open `path` for appending, creating it if needed
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// `%TEMP%\deskmover_worker.log`
    pub fn default_path() -> PathBuf {
        std::env::temp_dir().join(DEFAULT_LOG_NAME)
    }

    /// Location of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop everything written so far
    pub fn clear(&self) -> Result<()> {
        // The subscriber may write to this same file, so unlock before logging
        self.lock().set_len(0)?;
        tracing::debug!(path = %self.path.display(), "log cleared");
        Ok(())
    }

    /// Exclusive writer, held until dropped
    pub fn writer(&self) -> LogWriter<'_> {
        LogWriter(self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Writer returned by [`LogFile::writer`]
pub struct LogWriter<'a>(MutexGuard<'a, File>);

impl Write for LogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer()
    }
}
