//! Volume layout and slice arithmetic
//!
//! Pure conversions between data blocks, block-map blocks and volume slices.
//! The filesystem never asks for sub-slice growth, so block to slice
//! conversions must be exact; an inexact conversion is reported as an
//! invariant violation rather than silently rounded.

use crate::core::allocator::bitmap::RawBitmap;
use crate::core::superblock::Superblock;
use crate::error::{ensure_invariant, Result};

/// Layout view of a mounted volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeMetadata {
    block_size: u32,
    using_fvm: bool,
    slice_size: u64,
    metadata_start: u64,
    data_start: u64,
    block_map_slices: u64,
}

impl VolumeMetadata {
    pub fn from_superblock(superblock: &Superblock) -> Self {
        VolumeMetadata {
            block_size: superblock.block_size,
            using_fvm: superblock.using_fvm(),
            slice_size: superblock.slice_size,
            metadata_start: superblock.block_map_start,
            data_start: superblock.data_start,
            block_map_slices: superblock.block_map_slices,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// True if the volume can be extended in slices
    pub fn using_fvm(&self) -> bool {
        self.using_fvm
    }

    pub fn slice_size(&self) -> u64 {
        self.slice_size
    }

    /// First block of the block map
    pub fn metadata_start(&self) -> u64 {
        self.metadata_start
    }

    /// First data block
    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    /// Bits described by one block-map block
    pub fn bits_per_block(&self) -> u64 {
        self.block_size as u64 * 8
    }

    /// Units of `unit_size` bytes held by `slices` slices
    pub fn units_per_slice(&self, slices: u64, unit_size: u64) -> u64 {
        slices * self.slice_size / unit_size
    }

    /// Data blocks held by one slice (0 on fixed-size volumes)
    pub fn blocks_per_slice(&self) -> u64 {
        self.units_per_slice(1, self.block_size as u64)
    }

    /// Data blocks held by `slices` slices
    pub fn slices_to_blocks(&self, slices: u64) -> u64 {
        self.units_per_slice(slices, self.block_size as u64)
    }

    /// Data blocks held by `slices` slices, or None if that overflows
    pub fn checked_slices_to_blocks(&self, slices: u64) -> Option<u64> {
        slices
            .checked_mul(self.slice_size)
            .map(|bytes| bytes / self.block_size as u64)
    }

    /// Exact conversion from blocks to slices
    pub fn blocks_to_slices(&self, blocks: u64) -> Result<u64> {
        let blocks_per_slice = self.blocks_per_slice();
        ensure_invariant!(
            self.using_fvm && blocks_per_slice > 0,
            "slice conversion requested on a fixed-size volume"
        );
        ensure_invariant!(
            blocks % blocks_per_slice == 0,
            "{} blocks is not a whole number of {}-block slices",
            blocks,
            blocks_per_slice
        );
        Ok(blocks / blocks_per_slice)
    }

    /// Slices needed to hold `blocks` blocks, rounding up
    pub fn slices_for_blocks(&self, blocks: u64) -> u64 {
        match self.blocks_per_slice() {
            0 => 0,
            per_slice => blocks.div_ceil(per_slice),
        }
    }

    /// Block-map blocks needed to describe a pool of `pool_blocks`
    pub fn block_map_blocks(&self, pool_blocks: u64) -> u64 {
        RawBitmap::blocks_for_bits(pool_blocks, self.bits_per_block())
    }

    /// Block-map blocks available without growing the map's own footprint
    pub fn block_map_capacity(&self) -> u64 {
        if self.using_fvm {
            self.slices_to_blocks(self.block_map_slices)
        } else {
            self.data_start - self.metadata_start
        }
    }

    /// Volume block holding data block `index`
    pub fn data_block(&self, index: u64) -> u64 {
        self.data_start + index
    }

    /// Volume block holding block-map block `relative`
    pub fn block_map_block(&self, relative: u64) -> u64 {
        self.metadata_start + relative
    }
}
