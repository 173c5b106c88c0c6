//! Linux native AIO backend
//!
//! Drives the `io_setup`/`io_submit`/`io_getevents`/`io_destroy` syscall
//! family directly. glibc does not wrap these (they belong to libaio), so
//! the control block and event layouts from `<linux/aio_abi.h>` are
//! declared here and the calls go through `libc::syscall`.
//!
//! Each pool cell owns one `iocb` slot in a fixed arena; the cell id rides
//! in `aio_data` and the operation kind is recovered from the slot's
//! opcode, the same way the reference liburing-era tools read it back from
//! the completed control block.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use crate::backend::{AioBackend, Completion, OpKind};
use crate::cells::CellId;
use crate::error::{CopyError, Result};

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

type AioContext = libc::c_ulong;

/// `struct iocb` from `<linux/aio_abi.h>`, little-endian field order.
#[repr(C)]
#[derive(Clone, Copy)]
struct Iocb {
    aio_data: u64,
    aio_key: u32,
    aio_rw_flags: u32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

impl Iocb {
    const fn zeroed() -> Self {
        Self {
            aio_data: 0,
            aio_key: 0,
            aio_rw_flags: 0,
            aio_lio_opcode: 0,
            aio_reqprio: 0,
            aio_fildes: 0,
            aio_buf: 0,
            aio_nbytes: 0,
            aio_offset: 0,
            aio_reserved2: 0,
            aio_flags: 0,
            aio_resfd: 0,
        }
    }
}

/// `struct io_event` from `<linux/aio_abi.h>`
#[repr(C)]
#[derive(Clone, Copy)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

const ZERO_EVENT: IoEvent = IoEvent {
    data: 0,
    obj: 0,
    res: 0,
    res2: 0,
};

/// Check whether the kernel accepts native AIO contexts.
#[must_use]
pub fn is_available() -> bool {
    let mut ctx: AioContext = 0;
    // Safety: io_setup with a valid out-pointer; destroyed on success.
    let ret = unsafe { libc::syscall(libc::SYS_io_setup, 1, &mut ctx) };
    if ret == 0 {
        unsafe { libc::syscall(libc::SYS_io_destroy, ctx) };
        true
    } else {
        false
    }
}

/// Linux native AIO implementation of [`AioBackend`]
pub struct LinuxAioBackend {
    ctx: AioContext,
    iocbs: Vec<Iocb>,
    events: Vec<IoEvent>,
}

impl LinuxAioBackend {
    /// Create an AIO context sized for `queue_depth` concurrent requests.
    ///
    /// # Errors
    ///
    /// Returns `CopyError::BackendInit` when `io_setup` fails (context
    /// limit reached via `/proc/sys/fs/aio-max-nr`, or the syscall is
    /// filtered).
    pub fn new(queue_depth: usize) -> Result<Self> {
        let mut ctx: AioContext = 0;
        // Safety: io_setup writes the new context id through a valid pointer.
        let ret = unsafe { libc::syscall(libc::SYS_io_setup, queue_depth as libc::c_long, &mut ctx) };
        if ret != 0 {
            return Err(CopyError::BackendInit {
                backend: "linux-aio",
                source: io::Error::last_os_error(),
            });
        }
        Ok(Self {
            ctx,
            iocbs: vec![Iocb::zeroed(); queue_depth],
            events: vec![ZERO_EVENT; queue_depth],
        })
    }

    fn submit(&mut self, cell: CellId, op: OpKind, offset: u64) -> Result<()> {
        let iocb_ptr: *mut Iocb = &mut self.iocbs[cell as usize];
        let mut list = [iocb_ptr];
        // Safety: the iocb lives in the backend-owned arena for the whole
        // transfer and the referenced buffer is pinned by the caller's
        // submit contract.
        let ret = unsafe { libc::syscall(libc::SYS_io_submit, self.ctx, 1, list.as_mut_ptr()) };
        if ret == 1 {
            return Ok(());
        }
        let source = if ret < 0 {
            io::Error::last_os_error()
        } else {
            io::Error::other("io_submit accepted no requests")
        };
        Err(CopyError::Submit { op, offset, source })
    }
}

impl AioBackend for LinuxAioBackend {
    fn name(&self) -> &'static str {
        "linux-aio"
    }

    unsafe fn submit_read(
        &mut self,
        cell: CellId,
        fd: RawFd,
        offset: u64,
        buf: *mut u8,
        len: usize,
    ) -> Result<()> {
        let iocb = &mut self.iocbs[cell as usize];
        *iocb = Iocb::zeroed();
        iocb.aio_data = u64::from(cell);
        iocb.aio_lio_opcode = IOCB_CMD_PREAD;
        iocb.aio_fildes = fd as u32;
        iocb.aio_buf = buf as u64;
        iocb.aio_nbytes = len as u64;
        iocb.aio_offset = offset as i64;
        self.submit(cell, OpKind::Read, offset)
    }

    unsafe fn submit_write(
        &mut self,
        cell: CellId,
        fd: RawFd,
        offset: u64,
        buf: *const u8,
        len: usize,
    ) -> Result<()> {
        let iocb = &mut self.iocbs[cell as usize];
        *iocb = Iocb::zeroed();
        iocb.aio_data = u64::from(cell);
        iocb.aio_lio_opcode = IOCB_CMD_PWRITE;
        iocb.aio_fildes = fd as u32;
        iocb.aio_buf = buf as u64;
        iocb.aio_nbytes = len as u64;
        iocb.aio_offset = offset as i64;
        self.submit(cell, OpKind::Write, offset)
    }

    fn poll_completions(&mut self, blocking: bool, out: &mut Vec<Completion>) -> Result<()> {
        let min_nr: libc::c_long = if blocking { 1 } else { 0 };
        let got = loop {
            // Safety: the event buffer holds queue_depth entries; a null
            // timeout blocks until min_nr events are ready.
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_io_getevents,
                    self.ctx,
                    min_nr,
                    self.events.len() as libc::c_long,
                    self.events.as_mut_ptr(),
                    ptr::null::<libc::timespec>(),
                )
            };
            if ret >= 0 {
                break ret as usize;
            }
            let source = io::Error::last_os_error();
            if source.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(CopyError::Poll {
                backend: "linux-aio",
                source,
            });
        };

        for event in &self.events[..got] {
            let cell = event.data as CellId;
            let kind = if self.iocbs[cell as usize].aio_lio_opcode == IOCB_CMD_PREAD {
                OpKind::Read
            } else {
                OpKind::Write
            };
            out.push(Completion {
                cell,
                kind,
                result: event.res as i32,
            });
        }
        Ok(())
    }
}

impl Drop for LinuxAioBackend {
    fn drop(&mut self) {
        // Safety: ctx came from a successful io_setup and is destroyed once.
        unsafe { libc::syscall(libc::SYS_io_destroy, self.ctx) };
    }
}
