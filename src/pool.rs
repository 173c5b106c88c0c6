//! Aligned I/O buffer pool
//!
//! One contiguous allocation of `cell_count * block_size` bytes, aligned
//! for unbuffered/direct I/O and carved into fixed cells. Each cell backs
//! exactly one in-flight request at a time; the pool itself never grows or
//! shrinks during a transfer.
//!
//! The pool hands out raw pointers for request submission because the
//! kernel keeps using the memory after the submitting call returns. The
//! cell state tracker guarantees exclusivity: a cell's buffer is only ever
//! referenced by the single request recorded against that cell.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::cells::CellId;
use crate::error::{CopyError, Result};

/// Alignment applied to the pool allocation, sufficient for direct I/O on
/// common block devices (page-sized).
pub const BUFFER_ALIGNMENT: usize = 4096;

/// Fixed arena of equally sized, aligned I/O buffers
#[derive(Debug)]
pub struct BufferPool {
    base: NonNull<u8>,
    layout: Layout,
    cell_count: usize,
    block_size: usize,
}

impl BufferPool {
    /// Allocate a pool of `cell_count` buffers of `block_size` bytes each,
    /// zero-initialized and aligned to [`BUFFER_ALIGNMENT`].
    ///
    /// # Errors
    ///
    /// Returns `CopyError::InvalidConfig` for a zero cell count or block
    /// size, and `CopyError::BufferAllocation` if the allocator cannot
    /// provide the memory. Both are fatal: the transfer cannot proceed
    /// without its I/O buffers.
    pub fn new(cell_count: usize, block_size: usize) -> Result<Self> {
        if cell_count == 0 || block_size == 0 {
            return Err(CopyError::InvalidConfig(format!(
                "buffer pool requires non-zero cell count and block size (got {cell_count} x {block_size})"
            )));
        }
        if cell_count > usize::from(CellId::MAX) {
            return Err(CopyError::InvalidConfig(format!(
                "cell count {cell_count} exceeds the cell id range"
            )));
        }
        let total = cell_count
            .checked_mul(block_size)
            .ok_or_else(|| CopyError::InvalidConfig("buffer pool size overflows".to_string()))?;

        let layout = Layout::from_size_align(total, BUFFER_ALIGNMENT).map_err(|_| {
            CopyError::InvalidConfig(format!("invalid buffer pool layout: {total} bytes"))
        })?;

        // Safety: layout has non-zero size (checked above).
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(CopyError::BufferAllocation {
            count: cell_count,
            size: block_size,
        })?;

        Ok(Self {
            base,
            layout,
            cell_count,
            block_size,
        })
    }

    /// Number of cells in the pool (the pipeline depth N)
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cell_count
    }

    /// Fixed per-cell buffer size in bytes
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Raw pointer to the start of `cell`'s buffer, for request submission.
    ///
    /// The pointer stays valid for the lifetime of the pool; the caller is
    /// responsible for not touching the buffer while a request referencing
    /// it is in flight.
    #[must_use]
    pub fn cell_ptr(&self, cell: CellId) -> *mut u8 {
        let idx = cell as usize;
        assert!(idx < self.cell_count, "cell {cell} out of range");
        // Safety: idx * block_size is within the allocation.
        unsafe { self.base.as_ptr().add(idx * self.block_size) }
    }

    /// Borrow `cell`'s buffer as a slice. Only sound while the cell has no
    /// request in flight.
    #[must_use]
    pub fn cell(&self, cell: CellId) -> &[u8] {
        // Safety: pointer and length are within the single live allocation.
        unsafe { std::slice::from_raw_parts(self.cell_ptr(cell), self.block_size) }
    }

    /// Mutably borrow `cell`'s buffer. Only sound while the cell has no
    /// request in flight.
    pub fn cell_mut(&mut self, cell: CellId) -> &mut [u8] {
        // Safety: as above, and &mut self prevents overlapping borrows.
        unsafe { std::slice::from_raw_parts_mut(self.cell_ptr(cell), self.block_size) }
    }

    /// Per-cell iovec table describing the whole pool, in cell order.
    ///
    /// Used to register the buffers with backends that support it
    /// (io_uring fixed buffers).
    #[must_use]
    pub fn iovecs(&self) -> Vec<libc::iovec> {
        (0..self.cell_count)
            .map(|idx| libc::iovec {
                iov_base: self.cell_ptr(idx as CellId).cast(),
                iov_len: self.block_size,
            })
            .collect()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        // Safety: base was allocated with exactly this layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_geometry() {
        let pool = BufferPool::new(8, 8192).unwrap();
        assert_eq!(pool.cell_count(), 8);
        assert_eq!(pool.block_size(), 8192);
        assert_eq!(pool.iovecs().len(), 8);
    }

    #[test]
    fn buffers_are_aligned_and_zeroed() {
        let pool = BufferPool::new(4, 4096).unwrap();
        for cell in 0..4 {
            let ptr = pool.cell_ptr(cell);
            assert_eq!(ptr as usize % BUFFER_ALIGNMENT, 0);
            assert!(pool.cell(cell).iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn cells_do_not_overlap() {
        let mut pool = BufferPool::new(3, 512).unwrap();
        for cell in 0..3u16 {
            pool.cell_mut(cell).fill(cell as u8 + 1);
        }
        for cell in 0..3u16 {
            assert!(pool.cell(cell).iter().all(|&b| b == cell as u8 + 1));
        }
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        assert!(BufferPool::new(0, 4096).is_err());
        assert!(BufferPool::new(4, 0).is_err());
    }
}
