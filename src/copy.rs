//! Single-file copy orchestration
//!
//! Everything around the transfer engine: opening and sizing the source,
//! creating and preallocating the destination, running the pipelined
//! transfer, then truncating to the exact source size and syncing before
//! the handles are released.
//!
//! All failures are fatal for the copy and surface as typed errors; the
//! caller decides whether they end the process.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::backend::BackendKind;
use crate::cells::CellTracker;
use crate::error::{CopyError, Result};
use crate::pool::BufferPool;
use crate::transfer::Transfer;

/// Direct I/O requires request lengths in multiples of the device's
/// logical block size; 512 covers every common block device.
const DIRECT_IO_ALIGNMENT: usize = 512;

/// Largest accepted pipeline depth. Cell ids are dense `u16` indices, and
/// nothing is gained from deeper queues on real devices.
pub const MAX_QUEUE_DEPTH: usize = 32 * 1024;

/// Tuning parameters for one copy operation.
///
/// The defaults mirror the classic fixed constants of this engine: 64 KB
/// blocks and a 64-deep request window.
#[derive(Debug, Clone)]
pub struct CopyOptions {
    /// Which kernel async I/O facility to use
    pub backend: BackendKind,
    /// Bytes transferred per request; the final block may be shorter
    pub block_size: usize,
    /// Pipeline depth: cell count and maximum simultaneously outstanding
    /// requests
    pub queue_depth: usize,
    /// Open the source with `O_DIRECT`, bypassing the page cache
    pub direct_io: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            block_size: 64 * 1024,
            queue_depth: 64,
            direct_io: false,
        }
    }
}

impl CopyOptions {
    /// Validate the parameter combination.
    ///
    /// # Errors
    ///
    /// Returns `CopyError::InvalidConfig` for a zero block size, a queue
    /// depth outside `1..=MAX_QUEUE_DEPTH`, or a `direct_io` block size
    /// that is not a multiple of 512.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(CopyError::InvalidConfig(
                "block size must be non-zero".to_string(),
            ));
        }
        if self.queue_depth == 0 || self.queue_depth > MAX_QUEUE_DEPTH {
            return Err(CopyError::InvalidConfig(format!(
                "queue depth must be between 1 and {MAX_QUEUE_DEPTH}, got {}",
                self.queue_depth
            )));
        }
        if self.direct_io && self.block_size % DIRECT_IO_ALIGNMENT != 0 {
            return Err(CopyError::InvalidConfig(format!(
                "direct I/O requires the block size to be a multiple of {DIRECT_IO_ALIGNMENT}"
            )));
        }
        Ok(())
    }
}

/// Statistics for a completed copy operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyStats {
    /// Total number of bytes copied
    pub bytes_copied: u64,
    /// Wall-clock duration of the copy
    pub duration: Duration,
}

/// Copy `src` to `dst` through a bounded window of asynchronous requests.
///
/// The destination is created or truncated, preallocated to the source
/// size, filled by the pipelined transfer, truncated to the exact source
/// size again, and fsynced before the handles are released.
///
/// # Errors
///
/// Returns a [`CopyError`] describing the first failing operation: setup
/// (open/stat/create/preallocate/allocate), submission, completion, or
/// teardown (truncate/sync). The transfer is aborted at the first error;
/// destination contents are unspecified after a failure.
pub fn copy_file(src: &Path, dst: &Path, options: &CopyOptions) -> Result<CopyStats> {
    options.validate()?;
    let start = Instant::now();

    let mut open_src = OpenOptions::new();
    open_src.read(true);
    if options.direct_io {
        open_src.custom_flags(libc::O_DIRECT);
    }
    let src_file = open_src.open(src).map_err(|source| CopyError::Setup {
        operation: "open source file",
        path: src.to_path_buf(),
        source,
    })?;

    let total_size = src_file
        .metadata()
        .map_err(|source| CopyError::Setup {
            operation: "stat source file",
            path: src.to_path_buf(),
            source,
        })?
        .len();

    let dst_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dst)
        .map_err(|source| CopyError::Setup {
            operation: "create destination file",
            path: dst.to_path_buf(),
            source,
        })?;

    preallocate(&dst_file, dst, total_size)?;

    let pool = BufferPool::new(options.queue_depth, options.block_size)?;
    let mut cells = CellTracker::new(options.queue_depth);
    let mut backend = options.backend.create(options.queue_depth, &pool)?;
    info!(
        backend = backend.name(),
        block_size = options.block_size,
        queue_depth = options.queue_depth,
        total_size,
        "copying {} -> {}",
        src.display(),
        dst.display()
    );

    let mut transfer = Transfer::new(src_file.as_raw_fd(), dst_file.as_raw_fd(), total_size);
    if options.direct_io {
        transfer = transfer.with_request_align(DIRECT_IO_ALIGNMENT);
    }
    transfer.run(backend.as_mut(), &pool, &mut cells)?;

    // Drop any padding a rounding discipline may have written, then make
    // sure the bytes reached the disk before the handles go away.
    dst_file
        .set_len(total_size)
        .map_err(|source| CopyError::Setup {
            operation: "truncate destination file",
            path: dst.to_path_buf(),
            source,
        })?;
    dst_file.sync_all().map_err(|source| CopyError::Setup {
        operation: "sync destination file",
        path: dst.to_path_buf(),
        source,
    })?;

    let stats = CopyStats {
        bytes_copied: total_size,
        duration: start.elapsed(),
    };
    info!(
        bytes = stats.bytes_copied,
        duration_ms = stats.duration.as_millis() as u64,
        "copy completed"
    );
    Ok(stats)
}

/// Reserve `size` bytes for the destination up front, so the transfer
/// cannot run out of space halfway and large files stay unfragmented.
///
/// Filesystems without `fallocate` support (EOPNOTSUPP) get a plain
/// `set_len` instead.
fn preallocate(file: &File, path: &Path, size: u64) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    // Safety: plain syscall on an owned, open descriptor.
    let ret = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, size as libc::off_t) };
    if ret == 0 {
        return Ok(());
    }
    let source = std::io::Error::last_os_error();
    match source.raw_os_error() {
        Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS) => {
            debug!("fallocate unsupported here, falling back to set_len");
            file.set_len(size).map_err(|source| CopyError::Preallocate {
                path: path.to_path_buf(),
                size,
                source,
            })
        }
        _ => Err(CopyError::Preallocate {
            path: path.to_path_buf(),
            size,
            source,
        }),
    }
}
