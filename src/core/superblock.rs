//! On-disk superblock and the pool-counter handle
//!
//! The superblock occupies block 0 of the volume. It records the volume
//! layout (where the block map and the data region start, slice geometry for
//! extensible volumes) and the two pool counters the allocator keeps in step
//! with the bitmap:
//!
//! - `pool_total`: number of data blocks described by the block map
//! - `pool_used`: number of those blocks currently allocated
//!
//! The counters are owned here, not by the allocator. The allocator reaches
//! them through a [`SuperblockManager`] handle and only through its named
//! mutators.

use crate::core::allocator::bitmap::RawBitmap;
use crate::core::transaction::Transaction;
use crate::error::{AllocError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

pub const MAGIC: [u8; 8] = *b"BLKMAP\x00\x01";
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Block holding the superblock
pub const SUPERBLOCK_BLOCK: u64 = 0;

/// First block of the block map on extensible volumes
pub const FVM_BLOCK_MAP_START: u64 = 0x10000;

/// First data block on extensible volumes
pub const FVM_DATA_START: u64 = 0x20000;

/// Volume is backed by a dynamically extensible store
pub const FLAG_FVM: u32 = 1 << 0;

/// Encoded size of the superblock fields, checksum included
const ENCODED_LEN: usize = 8 + 2 + 2 + 4 + 4 + 8 * 7 + 4;

/// Volume superblock (block 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    /// Magic number: "BLKMAP\x00\x01"
    pub magic: [u8; 8],

    pub version_major: u16,
    pub version_minor: u16,

    /// Block size in bytes
    pub block_size: u32,

    /// Feature flags (`FLAG_FVM`)
    pub flags: u32,

    /// Bytes per extensible slice (0 on fixed-size volumes)
    pub slice_size: u64,

    /// Data blocks described by the block map
    pub pool_total: u64,

    /// Data blocks currently allocated
    pub pool_used: u64,

    /// First block of the block map
    pub block_map_start: u64,

    /// First data block
    pub data_start: u64,

    /// Slices set aside for the block map (extensible volumes only)
    pub block_map_slices: u64,

    /// Slices backing the data region (extensible volumes only)
    pub data_slices: u64,
}

impl Superblock {
    /// Layout for a fixed-size volume: superblock, block map, then data
    pub fn new_fixed(block_size: u32, pool_total: u64) -> Self {
        let bits_per_block = block_size as u64 * 8;
        let block_map_blocks = RawBitmap::blocks_for_bits(pool_total, bits_per_block).max(1);
        Superblock {
            magic: MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            block_size,
            flags: 0,
            slice_size: 0,
            pool_total,
            pool_used: 0,
            block_map_start: SUPERBLOCK_BLOCK + 1,
            data_start: SUPERBLOCK_BLOCK + 1 + block_map_blocks,
            block_map_slices: 0,
            data_slices: 0,
        }
    }

    /// Layout for an extensible volume
    ///
    /// The block map lives at [`FVM_BLOCK_MAP_START`] in `block_map_slices`
    /// slices; data lives at [`FVM_DATA_START`] in `data_slices` slices.
    pub fn new_extensible(
        block_size: u32,
        slice_size: u64,
        block_map_slices: u64,
        data_slices: u64,
    ) -> Self {
        let blocks_per_slice = slice_size / block_size as u64;
        Superblock {
            magic: MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            block_size,
            flags: FLAG_FVM,
            slice_size,
            pool_total: data_slices * blocks_per_slice,
            pool_used: 0,
            block_map_start: FVM_BLOCK_MAP_START,
            data_start: FVM_DATA_START,
            block_map_slices,
            data_slices,
        }
    }

    /// True if the volume can grow in slices
    pub fn using_fvm(&self) -> bool {
        self.flags & FLAG_FVM != 0
    }

    /// Free data blocks according to the counters
    pub fn pool_free(&self) -> u64 {
        self.pool_total.saturating_sub(self.pool_used)
    }

    /// Validate magic, version and layout
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(AllocError::InvalidMagic);
        }

        if self.version_major != VERSION_MAJOR || self.version_minor != VERSION_MINOR {
            return Err(AllocError::UnsupportedVersion {
                major: self.version_major,
                minor: self.version_minor,
            });
        }

        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(AllocError::InvalidBlockSize(self.block_size));
        }

        if self.pool_used > self.pool_total {
            return Err(AllocError::Corrupted(format!(
                "pool used ({}) exceeds pool total ({})",
                self.pool_used, self.pool_total
            )));
        }

        if self.block_map_start >= self.data_start {
            return Err(AllocError::Corrupted(format!(
                "block map start {} is not below data start {}",
                self.block_map_start, self.data_start
            )));
        }

        if self.using_fvm() {
            let block_size = self.block_size as u64;
            if self.slice_size == 0 || self.slice_size % block_size != 0 {
                return Err(AllocError::Corrupted(format!(
                    "slice size {} is not a multiple of block size {}",
                    self.slice_size, block_size
                )));
            }
            let blocks_per_slice = self.slice_size / block_size;
            if self.data_start % blocks_per_slice != 0 {
                return Err(AllocError::Corrupted(format!(
                    "data start {} is not aligned to {}-block slices",
                    self.data_start, blocks_per_slice
                )));
            }
            if self.data_slices.checked_mul(blocks_per_slice) != Some(self.pool_total) {
                return Err(AllocError::Corrupted(format!(
                    "{} data slices do not describe {} blocks",
                    self.data_slices, self.pool_total
                )));
            }
            let block_map_end = self
                .block_map_slices
                .checked_mul(blocks_per_slice)
                .and_then(|blocks| blocks.checked_add(self.block_map_start));
            if block_map_end.map_or(true, |end| end > self.data_start) {
                return Err(AllocError::Corrupted(
                    "block map slices overlap the data region".into(),
                ));
            }
        }

        Ok(())
    }

    /// Serialize to one block, little endian, with a trailing CRC32
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.block_size as usize);

        bytes.extend_from_slice(&self.magic);
        bytes.extend_from_slice(&self.version_major.to_le_bytes());
        bytes.extend_from_slice(&self.version_minor.to_le_bytes());
        bytes.extend_from_slice(&self.block_size.to_le_bytes());
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        for value in [
            self.slice_size,
            self.pool_total,
            self.pool_used,
            self.block_map_start,
            self.data_start,
            self.block_map_slices,
            self.data_slices,
        ] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }

        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());

        // Pad to one block
        bytes.resize((self.block_size as usize).max(ENCODED_LEN), 0);
        bytes
    }

    /// Deserialize and validate
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENCODED_LEN {
            return Err(AllocError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Insufficient bytes for superblock",
            )));
        }

        let body = &bytes[..ENCODED_LEN - 4];
        let stored = u32::from_le_bytes(read_array(bytes, ENCODED_LEN - 4));
        if crc32fast::hash(body) != stored {
            return Err(AllocError::ChecksumMismatch);
        }

        let mut offset = 0;
        let magic = read_array::<8>(bytes, offset);
        offset += 8;
        let version_major = u16::from_le_bytes(read_array(bytes, offset));
        offset += 2;
        let version_minor = u16::from_le_bytes(read_array(bytes, offset));
        offset += 2;
        let block_size = u32::from_le_bytes(read_array(bytes, offset));
        offset += 4;
        let flags = u32::from_le_bytes(read_array(bytes, offset));
        offset += 4;

        let mut next_u64 = || {
            let value = u64::from_le_bytes(read_array(bytes, offset));
            offset += 8;
            value
        };

        let superblock = Superblock {
            magic,
            version_major,
            version_minor,
            block_size,
            flags,
            slice_size: next_u64(),
            pool_total: next_u64(),
            pool_used: next_u64(),
            block_map_start: next_u64(),
            data_start: next_u64(),
            block_map_slices: next_u64(),
            data_slices: next_u64(),
        };

        superblock.validate()?;
        Ok(superblock)
    }
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

/// Owner of the pool counters, as seen by the allocator
///
/// The allocator never writes superblock fields directly; every change goes
/// through one of these named mutators and is then persisted with
/// [`SuperblockManager::write`].
pub trait SuperblockManager: Send {
    /// Snapshot of the current superblock
    fn info(&self) -> Superblock;

    /// Account `blocks` newly allocated data blocks
    fn pool_allocate(&mut self, blocks: u64);

    /// Account `blocks` released data blocks
    fn pool_release(&mut self, blocks: u64);

    /// Record a new data pool size
    fn set_pool_total(&mut self, blocks: u64);

    /// Record `slices` additional data slices
    fn add_data_slices(&mut self, slices: u64);

    /// Append the current superblock to `transaction`
    fn write(&mut self, transaction: &mut dyn Transaction);
}

/// Shared, cloneable superblock handle
///
/// The filesystem keeps one clone to read the counters while the allocator
/// holds another to update them.
#[derive(Debug, Clone)]
pub struct SharedSuperblock {
    inner: Arc<Mutex<Superblock>>,
}

impl SharedSuperblock {
    pub fn new(superblock: Superblock) -> Self {
        SharedSuperblock {
            inner: Arc::new(Mutex::new(superblock)),
        }
    }

    pub fn pool_used(&self) -> u64 {
        self.inner.lock().pool_used
    }

    pub fn pool_total(&self) -> u64 {
        self.inner.lock().pool_total
    }
}

impl SuperblockManager for SharedSuperblock {
    fn info(&self) -> Superblock {
        *self.inner.lock()
    }

    fn pool_allocate(&mut self, blocks: u64) {
        let mut sb = self.inner.lock();
        debug_assert!(sb.pool_used + blocks <= sb.pool_total);
        sb.pool_used += blocks;
    }

    fn pool_release(&mut self, blocks: u64) {
        let mut sb = self.inner.lock();
        debug_assert!(sb.pool_used >= blocks);
        sb.pool_used = sb.pool_used.saturating_sub(blocks);
    }

    fn set_pool_total(&mut self, blocks: u64) {
        let mut sb = self.inner.lock();
        debug_assert!(blocks >= sb.pool_used);
        sb.pool_total = blocks;
    }

    fn add_data_slices(&mut self, slices: u64) {
        self.inner.lock().data_slices += slices;
    }

    fn write(&mut self, transaction: &mut dyn Transaction) {
        let bytes = self.inner.lock().to_bytes();
        transaction.enqueue(bytes, 0, SUPERBLOCK_BLOCK, 1);
    }
}
