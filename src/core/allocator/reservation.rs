//! Reservation tickets
//!
//! A [`Reservation`] is a claim on blocks that have been promised but not yet
//! placed. [`BlockAllocator::reserve`] raises the allocator's reserved count
//! and hands back a ticket; each `allocate` or `swap` through the ticket
//! places one block and consumes one unit. Units still held when the ticket
//! is dropped go back to the allocator's free pool.
//!
//! The ticket borrows the allocator that issued it, so it cannot outlive it.

use crate::core::allocator::swap::SwapCapable;
use crate::core::allocator::BlockAllocator;
use crate::core::transaction::Transaction;
use crate::error::{ensure_invariant, Result};

pub struct Reservation<'a> {
    allocator: &'a BlockAllocator,
    remaining: u64,
}

impl<'a> Reservation<'a> {
    pub(crate) fn new(allocator: &'a BlockAllocator, count: u64) -> Self {
        Reservation {
            allocator,
            remaining: count,
        }
    }

    /// Units not yet placed
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Place one block; see [`BlockAllocator::allocate`]
    pub fn allocate(&mut self, transaction: &mut dyn Transaction) -> Result<u64> {
        let allocator = self.allocator;
        allocator.allocate(self, transaction)
    }

    /// Claim a relocation target for `old_index`; see [`SwapCapable::swap`]
    pub fn swap(&mut self, old_index: Option<u64>) -> Result<u64> {
        let allocator = self.allocator;
        allocator.swap(self, old_index)
    }

    /// Move `count` units into a new ticket on the same allocator
    pub fn split(&mut self, count: u64) -> Result<Reservation<'a>> {
        ensure_invariant!(
            count <= self.remaining,
            "cannot split {} units from a reservation holding {}",
            count,
            self.remaining
        );
        self.remaining -= count;
        Ok(Reservation::new(self.allocator, count))
    }

    /// Fold another ticket's units into this one
    pub fn merge(&mut self, mut other: Reservation<'a>) -> Result<()> {
        ensure_invariant!(
            std::ptr::eq(self.allocator, other.allocator),
            "cannot merge reservations issued by different allocators"
        );
        self.remaining += std::mem::take(&mut other.remaining);
        Ok(())
    }

    pub(crate) fn issued_by(&self, allocator: &BlockAllocator) -> bool {
        std::ptr::eq(self.allocator, allocator)
    }

    pub(crate) fn consume(&mut self) {
        debug_assert!(self.remaining > 0);
        self.remaining -= 1;
    }
}

impl std::fmt::Debug for Reservation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.remaining > 0 {
            self.allocator.unreserve(std::mem::take(&mut self.remaining));
        }
    }
}
