//! Error handling and types
//!
//! Every failure in the transfer engine is fatal for the copy in progress
//! and propagates as a [`CopyError`] up to the caller, which decides whether
//! to abort the process. The variants follow the lifecycle of a copy:
//! setup, submission, completion, teardown.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::backend::OpKind;

/// File copy and async I/O errors
#[derive(Error, Debug)]
pub enum CopyError {
    /// Setup or teardown file operation failed (open, stat, create,
    /// truncate, sync)
    #[error("unable to {operation} '{path}': {source}")]
    Setup {
        /// The failing operation, e.g. `"open source file"`
        operation: &'static str,
        /// Path the operation was applied to
        path: PathBuf,
        /// Underlying OS error
        source: io::Error,
    },

    /// Destination preallocation failed (typically not enough space)
    #[error("unable to preallocate {size} bytes for '{path}': {source}")]
    Preallocate {
        /// Destination path
        path: PathBuf,
        /// Requested allocation in bytes
        size: u64,
        /// Underlying OS error
        source: io::Error,
    },

    /// Aligned I/O buffer pool allocation failed
    #[error("unable to allocate {count} aligned I/O buffers of {size} bytes each")]
    BufferAllocation {
        /// Number of cells requested
        count: usize,
        /// Block size per cell in bytes
        size: usize,
    },

    /// Async I/O backend could not be initialized
    #[error("unable to initialize {backend} backend: {source}")]
    BackendInit {
        /// Backend name, e.g. `"io_uring"`
        backend: &'static str,
        /// Underlying OS error
        source: io::Error,
    },

    /// Backend rejected a read or write submission
    #[error("unable to submit {op} at offset {offset}: {source}")]
    Submit {
        /// Operation that was being submitted
        op: OpKind,
        /// File offset of the rejected request
        offset: u64,
        /// Underlying OS error
        source: io::Error,
    },

    /// A completed operation reported a failure result
    #[error("{op} failed at offset {offset}: {source}")]
    Completion {
        /// Operation that failed
        op: OpKind,
        /// File offset of the failed request
        offset: u64,
        /// OS error decoded from the completion result
        source: io::Error,
    },

    /// A completed operation transferred fewer bytes than requested
    #[error("short {op} at offset {offset}: expected {expected} bytes, got {got}")]
    ShortTransfer {
        /// Operation that came up short
        op: OpKind,
        /// File offset of the request
        offset: u64,
        /// Bytes requested
        expected: usize,
        /// Bytes actually transferred
        got: usize,
    },

    /// Waiting for completions failed
    #[error("unable to poll {backend} completions: {source}")]
    Poll {
        /// Backend name
        backend: &'static str,
        /// Underlying OS error
        source: io::Error,
    },

    /// Invalid configuration error
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Standard I/O error without more specific context
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias used throughout the crate
pub type Result<T> = std::result::Result<T, CopyError>;
