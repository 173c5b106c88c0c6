//! io_uring backend
//!
//! Submissions push SQEs onto the ring without entering the kernel; the
//! batch is submitted by the next completion poll (`submit_and_wait`),
//! which is also the engine's only suspension point. The cell id and
//! operation kind travel through the ring as `user_data`, so a completion
//! maps straight back to its pool cell.
//!
//! At construction the backend tries to register the pool's buffers with
//! the kernel and uses `ReadFixed`/`WriteFixed` opcodes when that
//! succeeds, skipping the per-request pin/unpin of user memory.
//! Registration is denied on some systems (memlock limits, seccomp); the
//! backend then silently degrades to the plain `Read`/`Write` opcodes.

use std::io;
use std::os::unix::io::RawFd;

use io_uring::{opcode, types, IoUring};

use crate::backend::{AioBackend, Completion, OpKind};
use crate::cells::CellId;
use crate::error::{CopyError, Result};
use crate::pool::BufferPool;

/// Bit set in `user_data` to mark a write completion.
const WRITE_TAG: u64 = 1 << 32;

/// Check whether io_uring can be used on this system.
///
/// Creating a tiny ring exercises the syscall itself, so this also detects
/// kernels where io_uring exists but is blocked by seccomp or sysctl.
#[must_use]
pub fn is_available() -> bool {
    IoUring::new(4).is_ok()
}

/// io_uring implementation of [`AioBackend`]
pub struct UringBackend {
    ring: IoUring,
    /// Whether the pool buffers are registered and fixed opcodes apply
    registered: bool,
}

impl UringBackend {
    /// Set up a ring with `queue_depth` submission entries and try to
    /// register `pool`'s buffers as fixed buffers.
    ///
    /// # Errors
    ///
    /// Returns `CopyError::BackendInit` if ring creation fails (old kernel,
    /// seccomp, resource limits). Buffer registration failure is not an
    /// error; the backend falls back to unregistered opcodes.
    pub fn new(queue_depth: usize, pool: &BufferPool) -> Result<Self> {
        let ring = IoUring::new(queue_depth as u32).map_err(|source| CopyError::BackendInit {
            backend: "io_uring",
            source,
        })?;

        let iovecs = pool.iovecs();
        // Safety: the iovecs describe the pool's live allocation, which
        // outlives the ring for the duration of the transfer; the pool is
        // dropped only after the backend.
        let registered = unsafe { ring.submitter().register_buffers(&iovecs) }.is_ok();
        if !registered {
            tracing::debug!("io_uring buffer registration unavailable, using plain opcodes");
        }

        Ok(Self { ring, registered })
    }

    fn push(&mut self, entry: io_uring::squeue::Entry, op: OpKind, offset: u64) -> Result<()> {
        // Safety: the entry's buffer pointer is kept alive and exclusive by
        // the caller per the submit_read/submit_write contract.
        unsafe { self.ring.submission().push(&entry) }.map_err(|_| CopyError::Submit {
            op,
            offset,
            source: io::Error::other("submission queue full"),
        })
    }
}

impl AioBackend for UringBackend {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    unsafe fn submit_read(
        &mut self,
        cell: CellId,
        fd: RawFd,
        offset: u64,
        buf: *mut u8,
        len: usize,
    ) -> Result<()> {
        let entry = if self.registered {
            opcode::ReadFixed::new(types::Fd(fd), buf, len as u32, cell)
                .offset(offset)
                .build()
        } else {
            opcode::Read::new(types::Fd(fd), buf, len as u32)
                .offset(offset)
                .build()
        }
        .user_data(u64::from(cell));
        self.push(entry, OpKind::Read, offset)
    }

    unsafe fn submit_write(
        &mut self,
        cell: CellId,
        fd: RawFd,
        offset: u64,
        buf: *const u8,
        len: usize,
    ) -> Result<()> {
        let entry = if self.registered {
            opcode::WriteFixed::new(types::Fd(fd), buf, len as u32, cell)
                .offset(offset)
                .build()
        } else {
            opcode::Write::new(types::Fd(fd), buf, len as u32)
                .offset(offset)
                .build()
        }
        .user_data(u64::from(cell) | WRITE_TAG);
        self.push(entry, OpKind::Write, offset)
    }

    fn poll_completions(&mut self, blocking: bool, out: &mut Vec<Completion>) -> Result<()> {
        // Submit everything pushed since the last poll; with `blocking`,
        // also park until at least one CQE is available.
        loop {
            let submitted = if blocking {
                self.ring.submit_and_wait(1)
            } else {
                self.ring.submit()
            };
            match submitted {
                Ok(_) => break,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(source) => {
                    return Err(CopyError::Poll {
                        backend: "io_uring",
                        source,
                    })
                }
            }
        }

        for cqe in self.ring.completion() {
            let data = cqe.user_data();
            out.push(Completion {
                cell: (data & u64::from(u16::MAX)) as CellId,
                kind: if data & WRITE_TAG != 0 {
                    OpKind::Write
                } else {
                    OpKind::Read
                },
                result: cqe.result(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn read_and_write_roundtrip_through_ring() {
        if !is_available() {
            eprintln!("skipping: io_uring not available");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("src.bin");
        let dst_path = dir.path().join("dst.bin");
        let payload = b"pipelined io_uring roundtrip";
        std::fs::write(&src_path, payload).unwrap();

        let pool = BufferPool::new(2, 4096).unwrap();
        let mut backend = UringBackend::new(2, &pool).unwrap();

        let src = std::fs::File::open(&src_path).unwrap();
        let dst = std::fs::File::create(&dst_path).unwrap();

        // Safety: cell 0's buffer is untouched until the completion below.
        unsafe {
            backend
                .submit_read(0, src.as_raw_fd(), 0, pool.cell_ptr(0), payload.len())
                .unwrap();
        }
        let mut completions = Vec::new();
        backend.poll_completions(true, &mut completions).unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].kind, OpKind::Read);
        assert_eq!(completions[0].bytes().unwrap(), payload.len());
        assert_eq!(&pool.cell(0)[..payload.len()], payload);

        // Safety: same exclusivity argument for the write-back.
        unsafe {
            backend
                .submit_write(0, dst.as_raw_fd(), 0, pool.cell_ptr(0), payload.len())
                .unwrap();
        }
        completions.clear();
        backend.poll_completions(true, &mut completions).unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].kind, OpKind::Write);
        assert_eq!(completions[0].bytes().unwrap(), payload.len());

        assert_eq!(std::fs::read(&dst_path).unwrap(), payload);
    }

    #[test]
    fn read_failure_reports_negative_result() {
        if !is_available() {
            eprintln!("skipping: io_uring not available");
            return;
        }

        let pool = BufferPool::new(1, 4096).unwrap();
        let mut backend = UringBackend::new(1, &pool).unwrap();

        // Bad file descriptor: completion carries -EBADF.
        unsafe {
            backend
                .submit_read(0, -1, 0, pool.cell_ptr(0), 4096)
                .unwrap();
        }
        let mut completions = Vec::new();
        backend.poll_completions(true, &mut completions).unwrap();
        assert_eq!(completions.len(), 1);
        let err = completions[0].bytes().unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }
}
