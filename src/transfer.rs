//! Pipelined transfer driver
//!
//! The core state machine of the copy engine. A [`Transfer`] owns the
//! session counters (read cursor, in-flight count) and drives a bounded
//! window of requests through a backend:
//!
//! 1. **Prime**: issue up to one read per pool cell, at consecutive
//!    offsets, until the window is full or the source is exhausted.
//! 2. **Drain**: wait for completions. A finished read flips its cell to a
//!    write of the exact same `(offset, size)` using the same buffer; a
//!    finished write reuses its cell for the next unread block, or
//!    releases it when no bytes remain.
//! 3. Terminate when the cursor has reached the source size and no cell
//!    has a request outstanding.
//!
//! Completions may arrive in any order across cells; because the byte
//! range travels with the cell, out-of-order completion never corrupts
//! data. At most `cell_count` requests are ever outstanding, which bounds
//! memory at `cell_count * block_size` and keeps the device queue full
//! without unbounded buffering.
//!
//! Errors are fail-fast: the first submission or completion failure aborts
//! the whole transfer with a typed error. There is no retry and no
//! partial-failure recovery.

use std::os::unix::io::RawFd;

use tracing::{debug, trace};

use crate::backend::{AioBackend, Completion, OpKind};
use crate::cells::{CellId, CellTracker};
use crate::error::{CopyError, Result};
use crate::pool::BufferPool;

/// One bulk-transfer session: counters plus the two file descriptors.
///
/// Mutated only by the driving thread; the backend's kernel-side
/// concurrency is opaque to it.
#[derive(Debug)]
pub struct Transfer {
    src_fd: RawFd,
    dst_fd: RawFd,
    total_size: u64,
    /// Next unread source offset; non-decreasing, never exceeds total_size
    cursor: u64,
    /// Requests submitted but not yet completed; equals the number of
    /// non-idle cells
    in_flight: usize,
    /// When non-zero, read request lengths are rounded up to this multiple
    /// (required for O_DIRECT sources); the recorded cell size stays exact
    request_align: usize,
    /// Lowest offset at which a read returned zero bytes, if any
    eof_at: Option<u64>,
}

impl Transfer {
    /// Create a session copying `total_size` bytes from `src_fd` to
    /// `dst_fd`.
    #[must_use]
    pub fn new(src_fd: RawFd, dst_fd: RawFd, total_size: u64) -> Self {
        Self {
            src_fd,
            dst_fd,
            total_size,
            cursor: 0,
            in_flight: 0,
            request_align: 0,
            eof_at: None,
        }
    }

    /// Round read request lengths up to `align` (for O_DIRECT sources,
    /// where the kernel rejects unaligned lengths). A padded read of the
    /// final block still completes with the exact remaining byte count, so
    /// the recorded cell size is unaffected.
    #[must_use]
    pub fn with_request_align(mut self, align: usize) -> Self {
        self.request_align = align;
        self
    }

    /// Next unread source offset
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Requests currently outstanding
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Run the transfer to completion.
    ///
    /// # Errors
    ///
    /// Any submission failure, completion failure, or short transfer
    /// aborts immediately with the corresponding [`CopyError`]. If the
    /// source shrinks mid-transfer the driver drains cleanly and reports a
    /// `ShortTransfer` at the end-of-file offset.
    pub fn run(
        &mut self,
        backend: &mut dyn AioBackend,
        pool: &BufferPool,
        cells: &mut CellTracker,
    ) -> Result<()> {
        debug!(
            total_size = self.total_size,
            cells = pool.cell_count(),
            block_size = pool.block_size(),
            backend = backend.name(),
            "starting transfer"
        );

        // Prime: one read per cell while unread bytes remain.
        for cell in 0..pool.cell_count() as CellId {
            if !self.issue_read(backend, pool, cells, cell)? {
                break;
            }
        }

        let mut completions: Vec<Completion> = Vec::with_capacity(pool.cell_count());
        while self.in_flight > 0 {
            completions.clear();
            backend.poll_completions(true, &mut completions)?;
            for completion in &completions {
                match completion.kind {
                    OpKind::Read => self.complete_read(backend, pool, cells, completion)?,
                    OpKind::Write => self.complete_write(backend, pool, cells, completion)?,
                }
            }
        }

        if let Some(offset) = self.eof_at {
            // A read hit end-of-file before the recorded size was reached,
            // i.e. the source shrank underneath the transfer.
            return Err(CopyError::ShortTransfer {
                op: OpKind::Read,
                offset,
                expected: (self.total_size - offset) as usize,
                got: 0,
            });
        }

        debug!(bytes = self.total_size, "transfer complete");
        Ok(())
    }

    /// Issue a read for the next unread block into `cell`. Returns `false`
    /// without submitting anything when the source is exhausted.
    fn issue_read(
        &mut self,
        backend: &mut dyn AioBackend,
        pool: &BufferPool,
        cells: &mut CellTracker,
        cell: CellId,
    ) -> Result<bool> {
        let remaining = self.total_size - self.cursor;
        if remaining == 0 {
            return Ok(false);
        }
        let size = pool.block_size().min(remaining as usize);
        let request_len = self.padded_len(size, pool.block_size());

        cells.mark_read_pending(cell, self.cursor, size);
        trace!(cell, offset = self.cursor, size, "submit read");
        // Safety: the cell is ReadPending from here until its completion is
        // observed, so nothing else touches its buffer.
        unsafe {
            backend.submit_read(cell, self.src_fd, self.cursor, pool.cell_ptr(cell), request_len)?;
        }

        self.cursor += size as u64;
        self.in_flight += 1;
        Ok(true)
    }

    /// Handle a finished read: flip the cell into a write of the same
    /// byte range, or release it on the zero-byte end-of-file case.
    fn complete_read(
        &mut self,
        backend: &mut dyn AioBackend,
        pool: &BufferPool,
        cells: &mut CellTracker,
        completion: &Completion,
    ) -> Result<()> {
        let cell = completion.cell;
        let offset = cells.offset(cell);
        let size = cells.size(cell);

        let got = completion.bytes().map_err(|source| CopyError::Completion {
            op: OpKind::Read,
            offset,
            source,
        })?;

        if got == 0 {
            // End-of-file under a shrinking source; nothing to write back.
            self.eof_at = Some(self.eof_at.map_or(offset, |o| o.min(offset)));
            cells.mark_idle(cell);
            self.in_flight -= 1;
            return Ok(());
        }
        if got < size {
            return Err(CopyError::ShortTransfer {
                op: OpKind::Read,
                offset,
                expected: size,
                got,
            });
        }

        cells.mark_write_pending(cell);
        trace!(cell, offset, size, "submit write");
        // Safety: the cell stays WritePending until this write completes;
        // the buffer holds exactly the bytes just read.
        unsafe { backend.submit_write(cell, self.dst_fd, offset, pool.cell_ptr(cell), size)? };
        Ok(())
    }

    /// Handle a finished write: reuse the cell for the next unread block,
    /// or release it when the source is exhausted.
    fn complete_write(
        &mut self,
        backend: &mut dyn AioBackend,
        pool: &BufferPool,
        cells: &mut CellTracker,
        completion: &Completion,
    ) -> Result<()> {
        let cell = completion.cell;
        let offset = cells.offset(cell);
        let size = cells.size(cell);

        let got = completion.bytes().map_err(|source| CopyError::Completion {
            op: OpKind::Write,
            offset,
            source,
        })?;
        if got != size {
            return Err(CopyError::ShortTransfer {
                op: OpKind::Write,
                offset,
                expected: size,
                got,
            });
        }

        cells.mark_idle(cell);
        self.in_flight -= 1;
        self.issue_read(backend, pool, cells, cell)?;
        Ok(())
    }

    fn padded_len(&self, size: usize, block_size: usize) -> usize {
        if self.request_align == 0 {
            return size;
        }
        size.div_ceil(self.request_align)
            .saturating_mul(self.request_align)
            .min(block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted in-memory backend: serves reads from a source buffer,
    /// applies writes to a destination buffer, and can reorder completion
    /// delivery or fail a read at a chosen offset.
    struct ScriptedBackend {
        src: Vec<u8>,
        dst: Vec<u8>,
        ready: VecDeque<(Completion, Op)>,
        /// Deliver completions newest-first to exercise out-of-order paths
        reversed: bool,
        /// Deliver at most this many completions per poll
        batch: usize,
        fail_read_at: Option<u64>,
        failure_delivered: bool,
        reads_after_failure: usize,
        outstanding_cells: Vec<bool>,
        max_in_flight_seen: usize,
        read_log: Vec<(u64, usize)>,
        write_log: Vec<(u64, usize)>,
    }

    enum Op {
        Read { buf: *mut u8, offset: u64, len: usize },
        Write,
    }

    impl ScriptedBackend {
        fn new(src: Vec<u8>, cell_count: usize) -> Self {
            let dst = vec![0; src.len()];
            Self {
                src,
                dst,
                ready: VecDeque::new(),
                reversed: false,
                batch: usize::MAX,
                fail_read_at: None,
                failure_delivered: false,
                reads_after_failure: 0,
                outstanding_cells: vec![false; cell_count],
                max_in_flight_seen: 0,
                read_log: Vec::new(),
                write_log: Vec::new(),
            }
        }

        fn track_submit(&mut self, cell: CellId) {
            // No buffer aliasing: a cell may never carry two requests.
            assert!(
                !self.outstanding_cells[cell as usize],
                "cell {cell} submitted twice"
            );
            self.outstanding_cells[cell as usize] = true;
            let in_flight = self.outstanding_cells.iter().filter(|&&b| b).count();
            self.max_in_flight_seen = self.max_in_flight_seen.max(in_flight);
        }
    }

    impl AioBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        unsafe fn submit_read(
            &mut self,
            cell: CellId,
            _fd: RawFd,
            offset: u64,
            buf: *mut u8,
            len: usize,
        ) -> Result<()> {
            if self.failure_delivered {
                self.reads_after_failure += 1;
            }
            self.track_submit(cell);
            self.read_log.push((offset, len));
            let completion = if self.fail_read_at == Some(offset) {
                Completion {
                    cell,
                    kind: OpKind::Read,
                    result: -libc::EIO,
                }
            } else {
                let end = (offset as usize + len).min(self.src.len());
                let n = end.saturating_sub(offset as usize);
                Completion {
                    cell,
                    kind: OpKind::Read,
                    result: n as i32,
                }
            };
            self.ready
                .push_back((completion, Op::Read { buf, offset, len }));
            Ok(())
        }

        unsafe fn submit_write(
            &mut self,
            cell: CellId,
            _fd: RawFd,
            offset: u64,
            buf: *const u8,
            len: usize,
        ) -> Result<()> {
            self.track_submit(cell);
            self.write_log.push((offset, len));
            // Capture the buffer contents at submission; the driver must
            // not touch the cell again until the completion comes back.
            let data = std::slice::from_raw_parts(buf, len);
            self.dst[offset as usize..offset as usize + len].copy_from_slice(data);
            self.ready.push_back((
                Completion {
                    cell,
                    kind: OpKind::Write,
                    result: len as i32,
                },
                Op::Write,
            ));
            Ok(())
        }

        fn poll_completions(&mut self, _blocking: bool, out: &mut Vec<Completion>) -> Result<()> {
            let mut pending: Vec<(Completion, Op)> = self.ready.drain(..).collect();
            if self.reversed {
                pending.reverse();
            }
            let overflow = pending.split_off(pending.len().min(self.batch));
            for item in overflow.into_iter().rev() {
                if self.reversed {
                    self.ready.push_back(item);
                } else {
                    self.ready.push_front(item);
                }
            }
            for (completion, op) in pending {
                if let Op::Read { buf, offset, len } = op {
                    if completion.result > 0 {
                        let n = completion.result as usize;
                        let src = &self.src[offset as usize..offset as usize + n.min(len)];
                        // Data lands in the cell buffer only now, at
                        // completion time, like a real backend.
                        unsafe {
                            std::slice::from_raw_parts_mut(buf, src.len()).copy_from_slice(src);
                        }
                    }
                }
                if completion.result < 0 {
                    self.failure_delivered = true;
                }
                self.outstanding_cells[completion.cell as usize] = false;
                out.push(completion);
            }
            Ok(())
        }
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn run_copy(src: Vec<u8>, cell_count: usize, block_size: usize) -> (ScriptedBackend, Transfer) {
        let total = src.len() as u64;
        let pool = BufferPool::new(cell_count, block_size).unwrap();
        let mut cells = CellTracker::new(cell_count);
        let mut backend = ScriptedBackend::new(src, cell_count);
        let mut transfer = Transfer::new(-1, -1, total);
        transfer.run(&mut backend, &pool, &mut cells).unwrap();
        assert_eq!(cells.busy_cells(), 0);
        (backend, transfer)
    }

    #[test]
    fn copies_bytes_faithfully() {
        let src = patterned(3 * 4096 + 7);
        let (backend, transfer) = run_copy(src.clone(), 2, 4096);
        assert_eq!(backend.dst, src);
        assert_eq!(transfer.in_flight(), 0);
        assert_eq!(transfer.cursor(), src.len() as u64);
    }

    #[test]
    fn empty_source_issues_no_requests() {
        let (backend, transfer) = run_copy(Vec::new(), 4, 4096);
        assert!(backend.read_log.is_empty());
        assert!(backend.write_log.is_empty());
        assert_eq!(transfer.cursor(), 0);
    }

    #[test]
    fn reads_partition_the_source_contiguously() {
        // 10000 bytes at block size 8192: one full block and one short
        // final block of 1808, each flipped to a write at the same offset.
        let src = patterned(10000);
        let (backend, transfer) = run_copy(src.clone(), 64, 8192);

        assert_eq!(backend.read_log, vec![(0, 8192), (8192, 1808)]);
        assert_eq!(backend.write_log, vec![(0, 8192), (8192, 1808)]);
        assert_eq!(transfer.cursor(), 10000);
        assert_eq!(transfer.in_flight(), 0);
        assert_eq!(backend.dst, src);
    }

    #[test]
    fn window_never_exceeds_cell_count() {
        let cell_count = 4;
        let src = patterned(64 * 512);
        let total = src.len() as u64;
        let pool = BufferPool::new(cell_count, 512).unwrap();
        let mut cells = CellTracker::new(cell_count);
        let mut backend = ScriptedBackend::new(src.clone(), cell_count);
        // Trickle one completion per poll to keep the window saturated.
        backend.batch = 1;
        let mut transfer = Transfer::new(-1, -1, total);
        transfer.run(&mut backend, &pool, &mut cells).unwrap();

        assert!(backend.max_in_flight_seen <= cell_count);
        assert_eq!(backend.max_in_flight_seen, cell_count);
        assert_eq!(backend.dst, src);
    }

    #[test]
    fn out_of_order_completion_preserves_data() {
        let src = patterned(16 * 1024 + 321);
        let total = src.len() as u64;
        let pool = BufferPool::new(8, 1024).unwrap();
        let mut cells = CellTracker::new(8);
        let mut backend = ScriptedBackend::new(src.clone(), 8);
        backend.reversed = true;
        let mut transfer = Transfer::new(-1, -1, total);
        transfer.run(&mut backend, &pool, &mut cells).unwrap();
        assert_eq!(backend.dst, src);
    }

    #[test]
    fn read_failure_aborts_without_further_reads() {
        let fail_offset = 2 * 4096;
        let src = patterned(32 * 4096);
        let total = src.len() as u64;
        let pool = BufferPool::new(2, 4096).unwrap();
        let mut cells = CellTracker::new(2);
        let mut backend = ScriptedBackend::new(src, 2);
        backend.fail_read_at = Some(fail_offset as u64);
        let mut transfer = Transfer::new(-1, -1, total);

        let err = transfer.run(&mut backend, &pool, &mut cells).unwrap_err();
        match err {
            CopyError::Completion {
                op: OpKind::Read,
                offset,
                source,
            } => {
                assert_eq!(offset, fail_offset as u64);
                assert_eq!(source.raw_os_error(), Some(libc::EIO));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Fail-fast: once the failure was delivered, nothing new went out.
        assert_eq!(backend.reads_after_failure, 0);
        // No write may cover the failed block.
        assert!(backend
            .write_log
            .iter()
            .all(|&(offset, _)| offset != fail_offset as u64));
    }

    #[test]
    fn shrunken_source_surfaces_short_transfer() {
        // Report 3 blocks to the transfer but back it with only 2.
        let src = patterned(2 * 4096);
        let pool = BufferPool::new(1, 4096).unwrap();
        let mut cells = CellTracker::new(1);
        let mut backend = ScriptedBackend::new(src, 1);
        let mut transfer = Transfer::new(-1, -1, 3 * 4096);

        let err = transfer.run(&mut backend, &pool, &mut cells).unwrap_err();
        assert!(matches!(
            err,
            CopyError::ShortTransfer {
                op: OpKind::Read,
                ..
            }
        ));
        assert_eq!(cells.busy_cells(), 0);
    }

    #[test]
    fn request_align_pads_final_read_only_in_length() {
        let src = patterned(4096 + 100);
        let total = src.len() as u64;
        let pool = BufferPool::new(2, 4096).unwrap();
        let mut cells = CellTracker::new(2);
        let mut backend = ScriptedBackend::new(src.clone(), 2);
        let mut transfer = Transfer::new(-1, -1, total).with_request_align(512);
        transfer.run(&mut backend, &pool, &mut cells).unwrap();

        // The final read request is padded to the alignment, but the write
        // covers only the exact bytes.
        assert_eq!(backend.read_log, vec![(0, 4096), (4096, 512)]);
        assert_eq!(backend.write_log, vec![(0, 4096), (4096, 100)]);
        assert_eq!(backend.dst, src);
    }
}
