//! aiocp: pipelined asynchronous bulk file copying
//!
//! This library copies a regular file end-to-end by overlapping disk reads
//! and writes through a bounded pool of in-flight asynchronous I/O
//! requests, keeping the device busy without ever holding more than
//! `queue_depth * block_size` bytes in memory.
//!
//! The engine is split into a buffer pool ([`pool`]), per-cell state
//! tracking ([`cells`]), the pipeline driver ([`transfer`]), and swappable
//! kernel async I/O backends ([`backend`]): io_uring, Linux native AIO,
//! and POSIX AIO. [`copy::copy_file`] wires them together for a complete
//! single-file copy with preallocation, truncation, and sync.

pub mod backend;
pub mod cells;
pub mod cli;
pub mod copy;
pub mod error;
pub mod pool;
pub mod transfer;

// Re-export commonly used types
pub use backend::{AioBackend, BackendKind, Completion, OpKind};
pub use copy::{copy_file, CopyOptions, CopyStats};
pub use error::{CopyError, Result};
