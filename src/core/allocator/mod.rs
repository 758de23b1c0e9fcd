//! Bitmap block allocator
//!
//! [`BlockAllocator`] hands out data blocks from a single pool described by
//! an on-disk bitmap (the block map). Placement is two-phase:
//!
//! 1. [`BlockAllocator::reserve`] promises `n` blocks and returns a
//!    [`Reservation`]. If the pool cannot cover the promise, the volume is
//!    extended first (extensible volumes only).
//! 2. Each [`Reservation::allocate`] picks a concrete block, sets its bit and
//!    enqueues the bitmap and superblock deltas into the caller's transaction.
//!
//! Relocation of existing blocks goes through [`SwapCapable`], which defers
//! every bitmap change to a single [`SwapCapable::swap_commit`].
//!
//! Block indices handed out and accepted here are relative to the data pool;
//! [`VolumeMetadata::data_block`] maps them to volume blocks.

pub mod bitmap;
pub mod extent;
pub mod reservation;
pub mod swap;

use crate::config::AllocatorConfig;
use crate::core::metadata::VolumeMetadata;
use crate::core::superblock::SuperblockManager;
use crate::core::transaction::Transaction;
use crate::core::volume::VolumeBackingStore;
use crate::error::{ensure_invariant, invariant_violation, AllocError, Result};
use bitmap::RawBitmap;
use extent::Extent;
use parking_lot::Mutex;
use reservation::Reservation;
use swap::{SwapCapable, SwapSet};
use tracing::{debug, info, warn};

/// Hook run after the volume has granted new slices, with the new pool size
///
/// Lets the owner resize structures that track data blocks. An error aborts
/// the extension before the pool grows.
pub type GrowCallback = Box<dyn FnMut(u64) -> anyhow::Result<()> + Send>;

/// Allocation statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AllocationStats {
    pub pool_total: u64,
    pub pool_used: u64,
    pub reserved: u64,
    pub available: u64,
    pub swap_in: u64,
    pub swap_out: u64,

    /// 0.0 when allocated blocks form one run, 1.0 when no two are adjacent
    pub fragmentation: f64,
}

struct AllocatorState {
    bitmap: RawBitmap,
    swap: SwapSet,
    metadata: VolumeMetadata,
    superblock: Box<dyn SuperblockManager>,
    volume: Box<dyn VolumeBackingStore>,
    on_grow: Option<GrowCallback>,

    /// Blocks promised to live reservations
    reserved: u64,

    /// No clear, non-pending bit exists below this index
    first_free: u64,
}

/// Bitmap allocator for one data pool
pub struct BlockAllocator {
    config: AllocatorConfig,
    state: Mutex<AllocatorState>,
}

impl BlockAllocator {
    /// Mount an allocator over an existing volume
    ///
    /// Reads the block map described by the superblock, trims it to
    /// `pool_total` bits and positions the free-block hint at the first clear
    /// bit.
    pub fn create<V, S>(config: AllocatorConfig, volume: V, superblock: S) -> Result<Self>
    where
        V: VolumeBackingStore + 'static,
        S: SuperblockManager + 'static,
    {
        config.validate()?;

        let info = superblock.info();
        info.validate()?;
        if info.block_size != config.block_size {
            return Err(AllocError::InvalidBlockSize(info.block_size));
        }
        if volume.block_size() != config.block_size {
            return Err(AllocError::InvalidBlockSize(volume.block_size()));
        }
        if info.using_fvm() && info.slice_size != config.slice_size {
            return Err(AllocError::Config(format!(
                "configured slice size {} does not match the volume's {}",
                config.slice_size, info.slice_size
            )));
        }

        let metadata = VolumeMetadata::from_superblock(&info);
        let mut volume: Box<dyn VolumeBackingStore> = Box::new(volume);
        let bitmap = load_bitmap(volume.as_mut(), &metadata, info.pool_total)?;

        let allocated = bitmap.count_all();
        if allocated != info.pool_used {
            warn!(
                "Block map has {} blocks set but superblock records {} in use",
                allocated, info.pool_used
            );
        }

        let first_free = bitmap
            .find_first_clear(0, bitmap.size())
            .unwrap_or(bitmap.size());
        let swap = SwapSet::new(bitmap.size(), metadata.bits_per_block());

        info!(
            "Mounted block allocator: {} of {} blocks in use{}",
            info.pool_used,
            info.pool_total,
            if info.using_fvm() { " (extensible)" } else { "" }
        );

        Ok(BlockAllocator {
            config,
            state: Mutex::new(AllocatorState {
                bitmap,
                swap,
                metadata,
                superblock: Box::new(superblock),
                volume,
                on_grow: None,
                reserved: 0,
                first_free,
            }),
        })
    }

    /// Install the hook run on every successful volume extension
    ///
    /// The callback runs while the allocator's state lock is held. It must not
    /// call back into this allocator (not even read-only accessors such as
    /// [`BlockAllocator::pool_total`]) or it will deadlock.
    pub fn set_grow_callback<F>(&self, callback: F)
    where
        F: FnMut(u64) -> anyhow::Result<()> + Send + 'static,
    {
        self.state.lock().on_grow = Some(Box::new(callback));
    }

    /// Re-read the block map from the volume
    ///
    /// Only valid while nothing is reserved and no swap is pending.
    pub fn reload(&self) -> Result<()> {
        let mut state = self.state.lock();
        ensure_invariant!(
            state.reserved == 0 && state.swap.is_empty(),
            "reload with {} blocks reserved and swaps pending",
            state.reserved
        );

        let info = state.superblock.info();
        let metadata = VolumeMetadata::from_superblock(&info);
        let bitmap = load_bitmap(state.volume.as_mut(), &metadata, info.pool_total)?;

        state.first_free = bitmap
            .find_first_clear(0, bitmap.size())
            .unwrap_or(bitmap.size());
        state.swap = SwapSet::new(bitmap.size(), metadata.bits_per_block());
        state.bitmap = bitmap;
        state.metadata = metadata;
        debug!("Reloaded block map ({} blocks)", info.pool_total);
        Ok(())
    }

    /// Promise `count` blocks to the caller
    ///
    /// Extends the volume once if the pool is short; fails with
    /// [`AllocError::NoSpace`] if it is still short afterwards.
    pub fn reserve(
        &self,
        transaction: &mut dyn Transaction,
        count: u64,
    ) -> Result<Reservation<'_>> {
        let mut state = self.state.lock();

        let available = state.available();
        if available < count {
            let shortfall = count - available;
            let slices = self
                .config
                .grow_slices
                .max(state.metadata.slices_for_blocks(shortfall));
            debug!(
                "Reserve of {} blocks is {} short, extending by {} slices",
                count, shortfall, slices
            );
            state.extend_by(transaction, slices)?;

            if state.available() < count {
                return Err(AllocError::NoSpace);
            }
        }

        state.reserved += count;
        Ok(Reservation::new(self, count))
    }

    /// Place one block against `reservation`
    ///
    /// Returns the pool-relative index of the new block. The bitmap delta and
    /// the updated superblock are enqueued into `transaction`.
    pub fn allocate(
        &self,
        reservation: &mut Reservation<'_>,
        transaction: &mut dyn Transaction,
    ) -> Result<u64> {
        ensure_invariant!(
            reservation.issued_by(self),
            "reservation used with an allocator that did not issue it"
        );
        ensure_invariant!(
            reservation.remaining() > 0,
            "allocate called on an exhausted reservation"
        );

        let mut state = self.state.lock();
        let index = state.find(self.config.find_chunk_bits)?;

        state.bitmap.set(index);
        state.persist_range(transaction, index, 1);
        state.superblock.pool_allocate(1);
        state.take_reserved();
        state.advance_first_free(index);
        state.superblock.write(transaction);
        drop(state);

        reservation.consume();
        debug!("Allocated block {}", index);
        Ok(index)
    }

    /// Release an allocated block
    pub fn free(&self, transaction: &mut dyn Transaction, index: u64) -> Result<()> {
        let mut state = self.state.lock();
        ensure_invariant!(
            index < state.bitmap.size() && state.bitmap.get(index),
            "free of unallocated block {}",
            index
        );
        ensure_invariant!(
            !state.swap.swap_out().get(index),
            "free of block {} while it is pending swap-out",
            index
        );

        state.bitmap.clear(index);
        state.persist_range(transaction, index, 1);
        state.superblock.pool_release(1);
        state.superblock.write(transaction);
        if index < state.first_free {
            state.first_free = index;
        }

        debug!("Freed block {}", index);
        Ok(())
    }

    /// Grow the pool by the configured number of slices
    pub fn extend(&self, transaction: &mut dyn Transaction) -> Result<()> {
        let slices = self.config.grow_slices;
        self.state.lock().extend_by(transaction, slices)
    }

    /// Blocks neither allocated, reserved, nor pending swap-in
    pub fn available(&self) -> u64 {
        self.state.lock().available()
    }

    pub fn reserved(&self) -> u64 {
        self.state.lock().reserved
    }

    /// Lower bound for the next free block search
    pub fn first_free(&self) -> u64 {
        self.state.lock().first_free
    }

    pub fn pool_total(&self) -> u64 {
        self.state.lock().superblock.info().pool_total
    }

    pub fn pool_used(&self) -> u64 {
        self.state.lock().superblock.info().pool_used
    }

    /// True if `index` is set in the block map
    ///
    /// Pending swap-ins are not visible until committed.
    pub fn is_allocated(&self, index: u64) -> bool {
        let state = self.state.lock();
        index < state.bitmap.size() && state.bitmap.get(index)
    }

    /// Check that every block in `start..end` is allocated
    ///
    /// On failure returns the first unallocated index.
    pub fn check_allocated(&self, start: u64, end: u64) -> std::result::Result<(), u64> {
        let state = self.state.lock();
        let size = state.bitmap.size();
        match state.bitmap.find_first_clear(start, end) {
            Some(index) => Err(index),
            None if end > size => Err(start.max(size)),
            None => Ok(()),
        }
    }

    /// Runs of allocated blocks, in ascending order
    pub fn allocated_regions(&self) -> Vec<Extent> {
        self.state.lock().bitmap.set_runs().collect()
    }

    pub fn stats(&self) -> AllocationStats {
        let state = self.state.lock();
        let info = state.superblock.info();

        let allocated = state.bitmap.count_all();
        let runs = state.bitmap.set_runs().count() as u64;
        let fragmentation = if allocated <= 1 {
            0.0
        } else {
            (runs - 1) as f64 / (allocated - 1) as f64
        };

        AllocationStats {
            pool_total: info.pool_total,
            pool_used: info.pool_used,
            reserved: state.reserved,
            available: state.available(),
            swap_in: state.swap.in_count(),
            swap_out: state.swap.out_count(),
            fragmentation,
        }
    }

    pub fn metadata(&self) -> VolumeMetadata {
        self.state.lock().metadata
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Return `count` promised blocks to the free pool
    pub(crate) fn unreserve(&self, count: u64) {
        let mut state = self.state.lock();
        debug_assert!(state.reserved >= count);
        state.reserved = state.reserved.saturating_sub(count);
    }
}

impl SwapCapable for BlockAllocator {
    fn swap(&self, reservation: &mut Reservation<'_>, old_index: Option<u64>) -> Result<u64> {
        ensure_invariant!(
            reservation.issued_by(self),
            "reservation used with an allocator that did not issue it"
        );
        ensure_invariant!(
            reservation.remaining() > 0,
            "swap called on an exhausted reservation"
        );

        let mut state = self.state.lock();
        if let Some(old) = old_index {
            ensure_invariant!(
                old < state.bitmap.size() && state.bitmap.get(old),
                "swap-out of unallocated block {}",
                old
            );
            ensure_invariant!(
                !state.swap.swap_out().get(old),
                "block {} is already pending swap-out",
                old
            );
        }

        let index = state.find(self.config.find_chunk_bits)?;
        state.swap.add_in(index);
        if let Some(old) = old_index {
            state.swap.add_out(old);
        }
        state.take_reserved();
        state.advance_first_free(index);
        drop(state);

        reservation.consume();
        debug!("Swapped block {:?} for {}", old_index, index);
        Ok(index)
    }

    fn swap_commit(&self, transaction: &mut dyn Transaction) -> Result<()> {
        let mut state = self.state.lock();
        if state.swap.is_empty() {
            return Ok(());
        }

        let (in_count, out_count) = (state.swap.in_count(), state.swap.out_count());
        ensure_invariant!(
            in_count >= out_count,
            "{} swap-outs pending against {} swap-ins",
            out_count,
            in_count
        );

        let incoming: Vec<Extent> = state.swap.swap_in().set_runs().collect();
        for run in incoming {
            ensure_invariant!(
                state.bitmap.none_set(run.start, run.end()),
                "swap-in run {}..{} is already allocated",
                run.start,
                run.end()
            );
            state.bitmap.set_range(run.start, run.end());
            state.persist_range(transaction, run.start, run.length);
        }

        let outgoing: Vec<Extent> = state.swap.swap_out().set_runs().collect();
        for run in outgoing {
            if run.start < state.first_free {
                state.first_free = run.start;
            }
            ensure_invariant!(
                state.bitmap.all_set(run.start, run.end()),
                "swap-out run {}..{} is not allocated",
                run.start,
                run.end()
            );
            state.bitmap.clear_range(run.start, run.end());
            state.persist_range(transaction, run.start, run.length);
        }

        state.superblock.pool_allocate(in_count - out_count);
        state.superblock.write(transaction);
        state.swap.clear();

        debug!(
            "Committed swap: {} blocks in, {} blocks out",
            in_count, out_count
        );
        Ok(())
    }

    fn swap_pending(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.swap.in_count(), state.swap.out_count())
    }
}

impl std::fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BlockAllocator")
            .field("pool_size", &state.bitmap.size())
            .field("reserved", &state.reserved)
            .field("first_free", &state.first_free)
            .finish()
    }
}

impl AllocatorState {
    fn available(&self) -> u64 {
        self.superblock
            .info()
            .pool_free()
            .saturating_sub(self.reserved)
            .saturating_sub(self.swap.in_count())
    }

    fn take_reserved(&mut self) {
        debug_assert!(self.reserved > 0);
        self.reserved = self.reserved.saturating_sub(1);
    }

    fn advance_first_free(&mut self, placed: u64) {
        if placed >= self.first_free {
            self.first_free = placed + 1;
        }
    }

    /// First block clear in both the block map and the swap-in set
    ///
    /// The swap-in set is consulted one window of `chunk_bits` at a time so a
    /// long pending run is skipped without a bit-by-bit walk.
    fn find(&self, chunk_bits: u64) -> Result<u64> {
        let size = self.bitmap.size();
        let mut start = self.first_free;

        loop {
            let Some(candidate) = self.bitmap.find_first_clear(start, size) else {
                return Err(invariant_violation(format!(
                    "no free block at or after {} despite a reservation",
                    start
                )));
            };

            let window_end = candidate.saturating_add(chunk_bits).min(size);
            match self.swap.swap_in().find_first_clear(candidate, window_end) {
                Some(index) if index == candidate => return Ok(candidate),
                Some(index) => start = index,
                None => start = window_end,
            }
        }
    }

    /// Enqueue the block-map blocks covering `start..start + count`
    fn persist_range(&self, transaction: &mut dyn Transaction, start: u64, count: u64) {
        if count == 0 {
            return;
        }
        let first = self.bitmap.block_of(start);
        let last = self.bitmap.block_of(start + count - 1);
        let blocks = last - first + 1;

        transaction.enqueue(
            self.bitmap.block_bytes(first, blocks),
            first,
            self.metadata.block_map_block(first),
            blocks,
        );
    }

    fn extend_by(&mut self, transaction: &mut dyn Transaction, slices: u64) -> Result<()> {
        if !self.metadata.using_fvm() {
            return Err(AllocError::NoSpace);
        }

        let info = self.superblock.info();
        let old_total = self.bitmap.size();
        let Some(new_total) = info
            .data_slices
            .checked_add(slices)
            .and_then(|total| self.metadata.checked_slices_to_blocks(total))
        else {
            warn!(
                "Cannot extend by {} slices: pool size overflows",
                slices
            );
            return Err(AllocError::NoSpace);
        };

        // The block map itself never grows past the slices set aside for it
        let map_blocks = self.metadata.block_map_blocks(new_total);
        if map_blocks > self.metadata.block_map_capacity() {
            warn!(
                "Cannot extend to {} blocks: block map needs {} blocks, {} available",
                new_total,
                map_blocks,
                self.metadata.block_map_capacity()
            );
            return Err(AllocError::NoSpace);
        }

        let slice_offset = self.metadata.blocks_to_slices(self.metadata.data_start())?;
        self.volume
            .extend(slice_offset + info.data_slices, slices)
            .map_err(AllocError::Volume)?;

        if let Some(on_grow) = self.on_grow.as_mut() {
            on_grow(new_total).map_err(AllocError::Volume)?;
        }

        self.bitmap.grow(map_blocks * self.metadata.bits_per_block());
        self.bitmap.shrink(new_total);
        self.swap.resize(new_total);

        self.superblock.add_data_slices(slices);
        self.superblock.set_pool_total(new_total);
        self.superblock.write(transaction);
        self.persist_range(transaction, old_total, new_total - old_total);

        info!(
            "Extended data pool from {} to {} blocks ({} slices added)",
            old_total, new_total, slices
        );
        Ok(())
    }
}

fn load_bitmap(
    volume: &mut dyn VolumeBackingStore,
    metadata: &VolumeMetadata,
    pool_total: u64,
) -> Result<RawBitmap> {
    let map_blocks = metadata.block_map_blocks(pool_total);
    if map_blocks > metadata.block_map_capacity() {
        return Err(AllocError::Corrupted(format!(
            "{} blocks need {} block-map blocks, volume reserves {}",
            pool_total,
            map_blocks,
            metadata.block_map_capacity()
        )));
    }

    let mut image = vec![0u8; (map_blocks * metadata.block_size() as u64) as usize];
    volume
        .read_blocks(metadata.metadata_start(), &mut image)
        .map_err(AllocError::Volume)?;
    RawBitmap::from_block_bytes(&image, pool_total, metadata.bits_per_block())
}
