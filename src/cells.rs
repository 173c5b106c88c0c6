//! Per-cell transfer state tracking
//!
//! Each buffer-pool cell cycles through `Idle -> ReadPending ->
//! WritePending -> Idle` for every block it carries. The tracker records
//! the stage together with the `(offset, size)` pair of the block, which
//! stays fixed from the moment the read is issued until the matching write
//! completes. This is what lets the write target the exact byte range just
//! read, without re-deriving it.
//!
//! Invalid transitions are programming errors in the driver, not runtime
//! conditions, and panic with a description of the bad transition.

/// Dense index of a cell within the buffer pool.
///
/// Cell ids travel through backend completions as plain integers; they are
/// never raw buffer addresses, so a reused buffer can never be reached
/// through a stale reference.
pub type CellId = u16;

/// Lifecycle stage of one cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellStage {
    /// No request outstanding; the cell's buffer is free for reuse
    #[default]
    Idle,
    /// A read into the cell's buffer has been submitted and not yet completed
    ReadPending,
    /// A write from the cell's buffer has been submitted and not yet completed
    WritePending,
}

#[derive(Debug, Clone, Copy, Default)]
struct Cell {
    stage: CellStage,
    offset: u64,
    size: usize,
}

/// Stage/offset/size records for every cell in the pool
#[derive(Debug)]
pub struct CellTracker {
    cells: Vec<Cell>,
}

impl CellTracker {
    /// Create a tracker with `cell_count` cells, all Idle.
    #[must_use]
    pub fn new(cell_count: usize) -> Self {
        Self {
            cells: vec![Cell::default(); cell_count],
        }
    }

    /// Current stage of `cell`
    #[must_use]
    pub fn stage(&self, cell: CellId) -> CellStage {
        self.cells[cell as usize].stage
    }

    /// File offset of the block the cell currently carries
    #[must_use]
    pub fn offset(&self, cell: CellId) -> u64 {
        self.cells[cell as usize].offset
    }

    /// Valid byte count of the block the cell currently carries
    #[must_use]
    pub fn size(&self, cell: CellId) -> usize {
        self.cells[cell as usize].size
    }

    /// Number of cells with an outstanding request
    #[must_use]
    pub fn busy_cells(&self) -> usize {
        self.cells
            .iter()
            .filter(|c| c.stage != CellStage::Idle)
            .count()
    }

    /// Transition `Idle -> ReadPending`, recording the block the read targets.
    ///
    /// # Panics
    ///
    /// Panics if the cell is not Idle: a cell may never have two requests
    /// in flight at once.
    pub fn mark_read_pending(&mut self, cell: CellId, offset: u64, size: usize) {
        let c = &mut self.cells[cell as usize];
        assert_eq!(
            c.stage,
            CellStage::Idle,
            "cell {cell} already has a request in flight"
        );
        c.stage = CellStage::ReadPending;
        c.offset = offset;
        c.size = size;
    }

    /// Transition `ReadPending -> WritePending`, keeping `(offset, size)`
    /// unchanged so the write covers exactly the bytes just read.
    ///
    /// # Panics
    ///
    /// Panics if the cell has no completed read to flip.
    pub fn mark_write_pending(&mut self, cell: CellId) {
        let c = &mut self.cells[cell as usize];
        assert_eq!(
            c.stage,
            CellStage::ReadPending,
            "cell {cell} has no pending read to convert to a write"
        );
        c.stage = CellStage::WritePending;
    }

    /// Release the cell back to Idle: from WritePending after the write
    /// completes, or from ReadPending when a read returns zero bytes (the
    /// end-of-file degenerate case).
    ///
    /// # Panics
    ///
    /// Panics if the cell is already Idle.
    pub fn mark_idle(&mut self, cell: CellId) {
        let c = &mut self.cells[cell as usize];
        assert_ne!(c.stage, CellStage::Idle, "cell {cell} is already idle");
        c.stage = CellStage::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_start_idle() {
        let tracker = CellTracker::new(4);
        for cell in 0..4 {
            assert_eq!(tracker.stage(cell), CellStage::Idle);
        }
        assert_eq!(tracker.busy_cells(), 0);
    }

    #[test]
    fn full_cycle_preserves_offset_and_size() {
        let mut tracker = CellTracker::new(2);

        tracker.mark_read_pending(1, 8192, 1808);
        assert_eq!(tracker.stage(1), CellStage::ReadPending);
        assert_eq!(tracker.offset(1), 8192);
        assert_eq!(tracker.size(1), 1808);
        assert_eq!(tracker.busy_cells(), 1);

        tracker.mark_write_pending(1);
        assert_eq!(tracker.stage(1), CellStage::WritePending);
        assert_eq!(tracker.offset(1), 8192);
        assert_eq!(tracker.size(1), 1808);

        tracker.mark_idle(1);
        assert_eq!(tracker.stage(1), CellStage::Idle);
        assert_eq!(tracker.busy_cells(), 0);
    }

    #[test]
    fn eof_read_releases_directly_to_idle() {
        let mut tracker = CellTracker::new(1);
        tracker.mark_read_pending(0, 0, 4096);
        tracker.mark_idle(0);
        assert_eq!(tracker.stage(0), CellStage::Idle);
    }

    #[test]
    #[should_panic(expected = "already has a request in flight")]
    fn double_read_submission_panics() {
        let mut tracker = CellTracker::new(1);
        tracker.mark_read_pending(0, 0, 4096);
        tracker.mark_read_pending(0, 4096, 4096);
    }

    #[test]
    #[should_panic(expected = "no pending read")]
    fn write_without_read_panics() {
        let mut tracker = CellTracker::new(1);
        tracker.mark_write_pending(0);
    }

    #[test]
    #[should_panic(expected = "already idle")]
    fn idle_release_of_idle_cell_panics() {
        let mut tracker = CellTracker::new(1);
        tracker.mark_idle(0);
    }
}
