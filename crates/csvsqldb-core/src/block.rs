//! Block & BlockManager (C2).
//!
//! The original engine packs rows into a raw byte buffer with a one-byte
//! marker in front of every value, row, and block boundary. Per spec.md
//! §9's redesign guidance this is reimplemented as an arena of typed value
//! cells: a block owns a flat `Vec<Variant>` of cells (row-major, `row_len`
//! cells per row) plus an explicit row count, so there is no marker byte to
//! walk and no aliasing between a cell's lifetime and the buffer's.
//! `has_capacity_for` keeps the "two cells of headroom" invariant as a
//! direct analogue of the original's two-byte trailer reservation.

use crate::error::{Error, Result};
use crate::value::Variant;

pub const DEFAULT_MAX_ACTIVE_BLOCKS: usize = 100;
/// Cells per block, not bytes — the "1 MiB default capacity" of the
/// original expressed in the arena's unit of allocation.
pub const DEFAULT_BLOCK_CAPACITY: usize = 128 * 1024;

/// A fixed-capacity arena of row cells. Rows are variable width (the row
/// width is fixed per-stream by the caller, not by the block itself), so
/// `row_offsets` records where each row starts in `cells`.
#[derive(Debug)]
pub struct Block {
    number: usize,
    capacity: usize,
    cells: Vec<Variant>,
    row_offsets: Vec<usize>,
    continued: bool,
    ended: bool,
}

impl Block {
    /// Public so a CSV reader's producer thread — which, per spec.md §5,
    /// owns its own block collection and is never touched by the consumer's
    /// `BlockManager` — can build blocks directly and hand them across the
    /// channel; the consumer then calls `BlockManager::adopt`.
    pub fn new(number: usize, capacity: usize) -> Block {
        Block {
            number,
            capacity,
            cells: Vec::with_capacity(capacity.min(1024)),
            row_offsets: Vec::new(),
            continued: false,
            ended: false,
        }
    }

    pub fn block_number(&self) -> usize {
        self.number
    }

    /// True only if `cells.len() + n + 2 <= capacity`, reserving headroom
    /// for a trailing row the caller is mid-way through appending.
    pub fn has_capacity_for(&self, n: usize) -> bool {
        self.cells.len() + n + 2 <= self.capacity
    }

    /// Appends one value to the row currently being built. The caller is
    /// responsible for calling `next_row` once a full row has been pushed;
    /// overflow is the caller's problem to detect via `has_capacity_for`
    /// before pushing — blocks do not chain themselves.
    pub fn add_value(&mut self, value: Variant) {
        self.cells.push(value);
    }

    pub fn next_row(&mut self) {
        self.row_offsets.push(self.cells.len());
    }

    /// Marks this block as "continued in the next block".
    pub fn mark_next_block(&mut self) {
        self.continued = true;
    }

    pub fn is_continued(&self) -> bool {
        self.continued
    }

    /// Marks this block as the final block of a stream.
    pub fn end_blocks(&mut self) {
        self.ended = true;
    }

    pub fn is_end(&self) -> bool {
        self.ended
    }

    /// Un-marks this block as the final block. Used when concatenating
    /// several per-file block streams into one logical table scan: each
    /// file's reader ends its own last block, but only the last file's
    /// last block should end the scan's stream.
    pub fn clear_end(&mut self) {
        self.ended = false;
    }

    pub fn row_count(&self) -> usize {
        self.row_offsets.len()
    }

    /// Returns the cells of row `idx`, where `row_width` is the number of
    /// columns per row (constant for a given stream).
    pub fn row(&self, idx: usize, row_width: usize) -> &[Variant] {
        let start = idx * row_width;
        &self.cells[start..start + row_width]
    }

    pub fn cells(&self) -> &[Variant] {
        &self.cells
    }
}

/// Owns the set of live blocks for one producer (e.g. one table scan or one
/// materializing operator) and enforces the active-block budget.
pub struct BlockManager {
    capacity: usize,
    max_active_blocks: usize,
    blocks: Vec<Option<Block>>,
    active_blocks: usize,
    max_used_blocks: usize,
    total_blocks: usize,
    next_number: usize,
}

impl BlockManager {
    pub fn new(max_active_blocks: usize, capacity: usize) -> BlockManager {
        BlockManager {
            capacity,
            max_active_blocks,
            blocks: Vec::new(),
            active_blocks: 0,
            max_used_blocks: 0,
            total_blocks: 0,
            next_number: 0,
        }
    }

    pub fn with_defaults() -> BlockManager {
        BlockManager::new(DEFAULT_MAX_ACTIVE_BLOCKS, DEFAULT_BLOCK_CAPACITY)
    }

    pub fn create_block(&mut self) -> Result<usize> {
        if self.active_blocks + 1 > self.max_active_blocks {
            log::debug!(
                "block manager refused a new block: {} active blocks already at the {} limit",
                self.active_blocks,
                self.max_active_blocks
            );
            return Err(Error::exception("exceeded maximum number of active blocks"));
        }
        let number = self.next_number;
        self.next_number += 1;
        let block = Block::new(number, self.capacity);
        if self.blocks.len() <= number {
            self.blocks.resize_with(number + 1, || None);
        }
        self.blocks[number] = Some(block);
        self.active_blocks += 1;
        if self.active_blocks > self.max_used_blocks {
            self.max_used_blocks = self.active_blocks;
            log::trace!("block manager high-water mark: {} active blocks", self.max_used_blocks);
        }
        self.total_blocks += 1;
        Ok(number)
    }

    /// Registers a block built outside this manager (e.g. by a CSV reader's
    /// producer thread) under a freshly assigned number, enforcing the same
    /// active-block budget as `create_block`.
    pub fn adopt(&mut self, mut block: Block) -> Result<usize> {
        if self.active_blocks + 1 > self.max_active_blocks {
            log::debug!(
                "block manager refused an adopted block: {} active blocks already at the {} limit",
                self.active_blocks,
                self.max_active_blocks
            );
            return Err(Error::exception("exceeded maximum number of active blocks"));
        }
        let number = self.next_number;
        self.next_number += 1;
        block.number = number;
        if self.blocks.len() <= number {
            self.blocks.resize_with(number + 1, || None);
        }
        self.blocks[number] = Some(block);
        self.active_blocks += 1;
        if self.active_blocks > self.max_used_blocks {
            self.max_used_blocks = self.active_blocks;
            log::trace!("block manager high-water mark: {} active blocks", self.max_used_blocks);
        }
        self.total_blocks += 1;
        Ok(number)
    }

    pub fn get_block(&self, number: usize) -> Result<&Block> {
        self.blocks
            .get(number)
            .and_then(|b| b.as_ref())
            .ok_or_else(|| Error::index(format!("no block with number {number}")))
    }

    pub fn get_block_mut(&mut self, number: usize) -> Result<&mut Block> {
        self.blocks
            .get_mut(number)
            .and_then(|b| b.as_mut())
            .ok_or_else(|| Error::index(format!("no block with number {number}")))
    }

    pub fn release(&mut self, number: usize) {
        if let Some(slot) = self.blocks.get_mut(number) {
            if slot.take().is_some() {
                self.active_blocks = self.active_blocks.saturating_sub(1);
            }
        }
    }

    pub fn active_blocks(&self) -> usize {
        self.active_blocks
    }

    pub fn max_active_blocks(&self) -> usize {
        self.max_active_blocks
    }

    pub fn max_used_blocks(&self) -> usize {
        self.max_used_blocks
    }

    pub fn block_capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }
}

impl Default for BlockManager {
    fn default() -> Self {
        BlockManager::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_block_enforces_budget() {
        let mut mgr = BlockManager::new(1, 16);
        mgr.create_block().unwrap();
        let err = mgr.create_block().unwrap_err();
        assert_eq!(
            err.to_string(),
            "exceeded maximum number of active blocks"
        );
        assert_eq!(mgr.active_blocks(), 1);
    }

    #[test]
    fn release_decrements_active() {
        let mut mgr = BlockManager::new(2, 16);
        let n = mgr.create_block().unwrap();
        mgr.create_block().unwrap();
        mgr.release(n);
        assert_eq!(mgr.active_blocks(), 1);
    }

    #[test]
    fn row_round_trip_preserves_nulls() {
        let mut mgr = BlockManager::with_defaults();
        let n = mgr.create_block().unwrap();
        let block = mgr.get_block_mut(n).unwrap();
        block.add_value(Variant::int(1));
        block.add_value(Variant::Int(None));
        block.next_row();
        assert_eq!(block.row_count(), 1);
        let row = block.row(0, 2);
        assert_eq!(row[0].as_int().unwrap(), 1);
        assert!(row[1].is_null());
    }
}
