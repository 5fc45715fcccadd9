//! Error types for the deskmover protocol

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by channel setup, client transactions and the worker
#[derive(Error, Debug)]
pub enum Error {
    /// Shared resources could not be created or opened
    #[error("channel setup failed: {0}")]
    ChannelSetup(String),

    /// The channel mutex was not acquired in time
    #[error("timed out after {0:?} waiting for the channel mutex")]
    MutexTimeout(Duration),

    /// No server answered before the command was sent
    #[error("worker not ready after {0:?}")]
    NotReady(Duration),

    /// The server took the command but did not answer in time
    #[error("worker did not respond within {0:?}")]
    ResponseTimeout(Duration),

    /// The server ran the command and reported failures
    #[error("command failed with {error_count} error(s): {message}")]
    CommandFailed {
        /// Number of failed sub-items
        error_count: u32,
        /// Most recent error reported by the worker
        message: String,
    },

    /// The host process died during or after a transaction
    #[error("host process is gone (restart issued: {restarted})")]
    HostCrashed {
        /// Whether a restart of the host was issued
        restarted: bool,
    },

    /// Getting the worker into the host failed
    #[error("injection failed: {0}")]
    Injection(String),

    /// A bulk enumeration produced more items than the caller can hold
    #[error("enumeration exceeds destination capacity of {capacity} items")]
    BatchOverflow {
        /// Capacity the caller asked for
        capacity: usize,
    },

    /// A desktop operation failed inside the worker
    #[error("desktop operation failed: {0}")]
    Desktop(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Windows API error
    #[cfg(windows)]
    #[error("Windows error: {0}")]
    Windows(#[from] windows::core::Error),
}

impl Error {
    /// True for wait timeouts, which a caller may retry as-is
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::MutexTimeout(_) | Error::NotReady(_) | Error::ResponseTimeout(_)
        )
    }
}

/// Result type for deskmover operations
pub type Result<T> = std::result::Result<T, Error>;
