//! POSIX AIO backend
//!
//! The portable fallback: `aio_read`/`aio_write` submission with an
//! `aio_error`/`aio_return` scan over the outstanding control blocks, and
//! `aio_suspend` to park when nothing has finished yet. glibc services
//! these requests with its own thread pool, so the facility is available
//! on every Linux system regardless of kernel configuration.
//!
//! One `aiocb` per pool cell, reused read-after-write like the rest of the
//! engine. POSIX AIO reports no operation kind on completion, so the
//! backend remembers what it submitted per cell.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

use crate::backend::{AioBackend, Completion, OpKind};
use crate::cells::CellId;
use crate::error::{CopyError, Result};

/// POSIX AIO implementation of [`AioBackend`]
pub struct PosixAioBackend {
    cbs: Vec<libc::aiocb>,
    /// Operation outstanding per cell, `None` when the slot is free
    pending: Vec<Option<OpKind>>,
}

/// POSIX AIO has no kernel facility to probe; glibc implements it in
/// userspace. Present for symmetry with the other backends.
#[must_use]
pub fn is_available() -> bool {
    true
}

impl PosixAioBackend {
    /// Create a backend with `queue_depth` control-block slots.
    ///
    /// # Errors
    ///
    /// Infallible in practice; the signature matches the other backends so
    /// construction stays uniform.
    pub fn new(queue_depth: usize) -> Result<Self> {
        // Safety: aiocb is a plain C struct; all-zeroes is its documented
        // initial state before the submission functions fill it in.
        let cbs = vec![unsafe { mem::zeroed::<libc::aiocb>() }; queue_depth];
        Ok(Self {
            cbs,
            pending: vec![None; queue_depth],
        })
    }

    fn prepare(&mut self, cell: CellId, fd: RawFd, offset: u64, buf: *mut u8, len: usize) {
        debug_assert!(
            self.pending[cell as usize].is_none(),
            "cell {cell} already has a request in flight"
        );
        let cb = &mut self.cbs[cell as usize];
        // Safety: see `new`; re-zeroing clears state left by the previous
        // request in this slot.
        *cb = unsafe { mem::zeroed() };
        cb.aio_fildes = fd;
        cb.aio_buf = buf.cast();
        cb.aio_nbytes = len;
        cb.aio_offset = offset as libc::off_t;
    }

    /// Collect every finished request into `out`. Returns the number of
    /// requests still in progress.
    fn reap(&mut self, out: &mut Vec<Completion>) -> usize {
        let mut in_progress = 0;
        for cell in 0..self.cbs.len() {
            let Some(kind) = self.pending[cell] else {
                continue;
            };
            // Safety: the control block at `cell` holds a submitted request.
            let err = unsafe { libc::aio_error(&self.cbs[cell]) };
            if err == libc::EINPROGRESS {
                in_progress += 1;
                continue;
            }
            let result = if err == 0 {
                // Safety: fetching the return value exactly once per
                // completed request, as aio_return requires.
                (unsafe { libc::aio_return(&mut self.cbs[cell]) }) as i32
            } else {
                -err
            };
            out.push(Completion {
                cell: cell as CellId,
                kind,
                result,
            });
            self.pending[cell] = None;
        }
        in_progress
    }
}

impl AioBackend for PosixAioBackend {
    fn name(&self) -> &'static str {
        "posix-aio"
    }

    unsafe fn submit_read(
        &mut self,
        cell: CellId,
        fd: RawFd,
        offset: u64,
        buf: *mut u8,
        len: usize,
    ) -> Result<()> {
        self.prepare(cell, fd, offset, buf, len);
        // Safety: the aiocb and its buffer stay valid until completion per
        // the trait contract.
        let ret = unsafe { libc::aio_read(&mut self.cbs[cell as usize]) };
        if ret != 0 {
            return Err(CopyError::Submit {
                op: OpKind::Read,
                offset,
                source: io::Error::last_os_error(),
            });
        }
        self.pending[cell as usize] = Some(OpKind::Read);
        Ok(())
    }

    unsafe fn submit_write(
        &mut self,
        cell: CellId,
        fd: RawFd,
        offset: u64,
        buf: *const u8,
        len: usize,
    ) -> Result<()> {
        self.prepare(cell, fd, offset, buf.cast_mut(), len);
        // Safety: as submit_read.
        let ret = unsafe { libc::aio_write(&mut self.cbs[cell as usize]) };
        if ret != 0 {
            return Err(CopyError::Submit {
                op: OpKind::Write,
                offset,
                source: io::Error::last_os_error(),
            });
        }
        self.pending[cell as usize] = Some(OpKind::Write);
        Ok(())
    }

    fn poll_completions(&mut self, blocking: bool, out: &mut Vec<Completion>) -> Result<()> {
        loop {
            let before = out.len();
            let in_progress = self.reap(out);
            if out.len() > before || !blocking || in_progress == 0 {
                return Ok(());
            }

            // Nothing finished yet: park until at least one request does.
            let wait_list: Vec<*const libc::aiocb> = self
                .pending
                .iter()
                .enumerate()
                .filter(|(_, op)| op.is_some())
                .map(|(cell, _)| &self.cbs[cell] as *const libc::aiocb)
                .collect();
            // Safety: the list references live control blocks with
            // submitted requests; a null timeout waits indefinitely.
            let ret = unsafe {
                libc::aio_suspend(
                    wait_list.as_ptr(),
                    wait_list.len() as libc::c_int,
                    ptr::null(),
                )
            };
            if ret != 0 {
                let source = io::Error::last_os_error();
                if source.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(CopyError::Poll {
                    backend: "posix-aio",
                    source,
                });
            }
        }
    }
}
