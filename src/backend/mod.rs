//! Kernel asynchronous I/O backends
//!
//! The transfer engine drives one of three kernel facilities through the
//! same narrow contract: submit one read, submit one write, poll for
//! finished operations. Everything backend-specific (ring setup, control
//! blocks, syscall plumbing) lives behind [`AioBackend`]; the pipeline
//! driver never branches on the facility in use.
//!
//! Backends are selected at construction via [`BackendKind`], not by
//! conditional compilation. `auto` probes io_uring first (newest, fastest),
//! then Linux native AIO, and falls back to POSIX AIO, which glibc
//! implements everywhere with a thread pool.

pub mod linux_aio;
pub mod posix_aio;
pub mod uring;

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use crate::cells::CellId;
use crate::error::Result;
use crate::pool::BufferPool;

pub use linux_aio::LinuxAioBackend;
pub use posix_aio::PosixAioBackend;
pub use uring::UringBackend;

/// The two operations the engine submits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Read from the source file into a cell's buffer
    Read,
    /// Write a cell's buffer to the destination file
    Write,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Read => write!(f, "read"),
            OpKind::Write => write!(f, "write"),
        }
    }
}

/// One finished operation, reported by a backend poll.
///
/// `result` follows the kernel convention: the transferred byte count on
/// success, a negated errno on failure. Completions are ephemeral; the
/// driver consumes them immediately.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// Cell whose request finished
    pub cell: CellId,
    /// Operation kind the completion concludes
    pub kind: OpKind,
    /// Raw result: bytes transferred, or `-errno`
    pub result: i32,
}

impl Completion {
    /// Decode the raw result into a byte count or an OS error.
    ///
    /// # Errors
    ///
    /// Returns the decoded OS error when the kernel reported a negative
    /// result for the operation.
    pub fn bytes(&self) -> io::Result<usize> {
        if self.result < 0 {
            Err(io::Error::from_raw_os_error(-self.result))
        } else {
            Ok(self.result as usize)
        }
    }
}

/// Uniform contract over a kernel asynchronous I/O facility.
///
/// Submissions are non-blocking: they enqueue the request and return. The
/// only suspension point in the engine is [`AioBackend::poll_completions`]
/// with `blocking` set.
pub trait AioBackend {
    /// Short name for diagnostics and logs, e.g. `"io_uring"`.
    fn name(&self) -> &'static str;

    /// Enqueue a read of `[offset, offset + len)` from `fd` into `buf`.
    ///
    /// # Safety
    ///
    /// `buf` must point to at least `len` writable bytes that stay valid,
    /// and are not read or written by anything else, until the matching
    /// completion for `cell` has been observed. The engine upholds this by
    /// dedicating one pool buffer to each cell and allowing at most one
    /// outstanding request per cell.
    ///
    /// # Errors
    ///
    /// Fails only if the facility rejects the submission (queue exhausted,
    /// malformed request); fatal for the transfer.
    unsafe fn submit_read(
        &mut self,
        cell: CellId,
        fd: RawFd,
        offset: u64,
        buf: *mut u8,
        len: usize,
    ) -> Result<()>;

    /// Enqueue a write of `[offset, offset + len)` from `buf` to `fd`.
    ///
    /// # Safety
    ///
    /// As [`AioBackend::submit_read`], except `buf` need only be readable.
    ///
    /// # Errors
    ///
    /// As [`AioBackend::submit_read`].
    unsafe fn submit_write(
        &mut self,
        cell: CellId,
        fd: RawFd,
        offset: u64,
        buf: *const u8,
        len: usize,
    ) -> Result<()>;

    /// Drain finished operations into `out`.
    ///
    /// With `blocking` set, parks the calling thread until at least one
    /// completion is available; otherwise returns immediately, possibly
    /// appending nothing. Completions may arrive in any order relative to
    /// submission.
    ///
    /// # Errors
    ///
    /// Fails if the facility's completion-wait mechanism itself errors;
    /// fatal for the transfer.
    fn poll_completions(&mut self, blocking: bool, out: &mut Vec<Completion>) -> Result<()>;
}

/// Which kernel facility to drive the transfer with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BackendKind {
    /// Probe at construction: io_uring, then Linux AIO, then POSIX AIO
    #[default]
    Auto,
    /// io_uring (Linux 5.1+)
    IoUring,
    /// Linux native AIO (io_submit/io_getevents)
    LinuxAio,
    /// POSIX AIO (glibc thread-pool implementation)
    PosixAio,
}

impl BackendKind {
    /// Construct the selected backend with `queue_depth` request slots.
    ///
    /// The pool is borrowed so backends that support it can register the
    /// cell buffers with the kernel up front.
    ///
    /// # Errors
    ///
    /// Returns `CopyError::BackendInit` when the facility cannot be set up.
    /// `Auto` only fails if every facility is unavailable, which POSIX AIO
    /// makes practically impossible.
    pub fn create(self, queue_depth: usize, pool: &BufferPool) -> Result<Box<dyn AioBackend>> {
        match self {
            BackendKind::IoUring => Ok(Box::new(UringBackend::new(queue_depth, pool)?)),
            BackendKind::LinuxAio => Ok(Box::new(LinuxAioBackend::new(queue_depth)?)),
            BackendKind::PosixAio => Ok(Box::new(PosixAioBackend::new(queue_depth)?)),
            BackendKind::Auto => {
                if uring::is_available() {
                    if let Ok(backend) = UringBackend::new(queue_depth, pool) {
                        return Ok(Box::new(backend));
                    }
                    tracing::debug!("io_uring probe succeeded but setup failed, falling back");
                }
                if linux_aio::is_available() {
                    if let Ok(backend) = LinuxAioBackend::new(queue_depth) {
                        return Ok(Box::new(backend));
                    }
                    tracing::debug!("Linux AIO probe succeeded but setup failed, falling back");
                }
                Ok(Box::new(PosixAioBackend::new(queue_depth)?))
            }
        }
    }
}
