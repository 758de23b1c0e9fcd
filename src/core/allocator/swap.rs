//! Atomic block relocation
//!
//! A swap moves the role of one block onto a freshly chosen block without
//! ever counting either block twice. [`SwapCapable::swap`] only records the
//! intent in two side bitmaps:
//!
//! - `swap_in`: blocks claimed for new contents, still clear in the block map
//! - `swap_out`: blocks being retired, still set in the block map
//!
//! [`SwapCapable::swap_commit`] then folds both sets into the block map and
//! the pool counters in one step.

use crate::core::allocator::bitmap::RawBitmap;
use crate::core::allocator::reservation::Reservation;
use crate::core::transaction::Transaction;
use crate::error::Result;

/// Pending swap-in/swap-out bits, sized like the block map
#[derive(Debug, Clone)]
pub(crate) struct SwapSet {
    swap_in: RawBitmap,
    swap_out: RawBitmap,
    in_count: u64,
    out_count: u64,
}

impl SwapSet {
    pub(crate) fn new(size: u64, bits_per_block: u64) -> Self {
        SwapSet {
            swap_in: RawBitmap::new(size, bits_per_block),
            swap_out: RawBitmap::new(size, bits_per_block),
            in_count: 0,
            out_count: 0,
        }
    }

    pub(crate) fn swap_in(&self) -> &RawBitmap {
        &self.swap_in
    }

    pub(crate) fn swap_out(&self) -> &RawBitmap {
        &self.swap_out
    }

    pub(crate) fn in_count(&self) -> u64 {
        self.in_count
    }

    pub(crate) fn out_count(&self) -> u64 {
        self.out_count
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.in_count == 0 && self.out_count == 0
    }

    pub(crate) fn add_in(&mut self, index: u64) {
        debug_assert!(!self.swap_in.get(index));
        self.swap_in.set(index);
        self.in_count += 1;
    }

    pub(crate) fn add_out(&mut self, index: u64) {
        debug_assert!(!self.swap_out.get(index));
        self.swap_out.set(index);
        self.out_count += 1;
    }

    pub(crate) fn resize(&mut self, size: u64) {
        self.swap_in.grow(size);
        self.swap_out.grow(size);
    }

    pub(crate) fn clear(&mut self) {
        self.swap_in.reset();
        self.swap_out.reset();
        self.in_count = 0;
        self.out_count = 0;
    }
}

/// Allocators whose volume supports relocating blocks
pub trait SwapCapable {
    /// Claim a new block for contents currently held by `old_index`
    ///
    /// Consumes one unit of `reservation`. The new block is recorded in the
    /// swap-in set and `old_index` (if any) in the swap-out set; neither the
    /// block map nor the pool counters change until
    /// [`SwapCapable::swap_commit`].
    fn swap(&self, reservation: &mut Reservation<'_>, old_index: Option<u64>) -> Result<u64>;

    /// Apply every pending swap to the block map and pool counters
    fn swap_commit(&self, transaction: &mut dyn Transaction) -> Result<()>;

    /// Number of pending (swap-in, swap-out) blocks
    fn swap_pending(&self) -> (u64, u64);
}
