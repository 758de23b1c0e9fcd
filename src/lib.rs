//! # blockmap - Bitmap Block Allocator for Journaled Volumes
//!
//! `blockmap-rs` manages the data-block pool of a journaled filesystem. Every
//! data block is one bit in an on-disk bitmap (the block map); allocation
//! changes are never written directly but enqueued into the caller's
//! metadata transaction together with the updated superblock counters.
//!
//! - **Two-phase allocation**: reserve capacity up front, place blocks later
//! - **Extensible volumes**: the pool grows by whole slices on demand
//! - **Atomic relocation**: swap blocks without double counting, commit at once
//! - **Checked invariants**: contract violations panic in debug builds and
//!   return [`AllocError::InvariantViolation`] in release builds
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blockmap_rs::{
//!     AllocatorConfig, BlockAllocator, MemoryVolume, Result, SharedSuperblock, Superblock,
//!     WriteTransaction,
//! };
//!
//! # fn main() -> Result<()> {
//! let config = AllocatorConfig::default();
//! let superblock = SharedSuperblock::new(Superblock::new_fixed(config.block_size, 4096));
//! let volume = MemoryVolume::new(config.block_size);
//! let allocator = BlockAllocator::create(config, volume.clone(), superblock)?;
//!
//! let mut txn = WriteTransaction::new();
//! let mut ticket = allocator.reserve(&mut txn, 2)?;
//! let first = ticket.allocate(&mut txn)?;
//! let second = ticket.allocate(&mut txn)?;
//! assert_eq!((first, second), (0, 1));
//!
//! // Unused units would return to the pool here
//! drop(ticket);
//! txn.commit(&mut volume.clone())?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Relocating Blocks
//!
//! ```rust,no_run
//! use blockmap_rs::{BlockAllocator, SwapCapable, Transaction, Result};
//!
//! fn relocate(allocator: &BlockAllocator, txn: &mut dyn Transaction, old: u64) -> Result<u64> {
//!     let mut ticket = allocator.reserve(txn, 1)?;
//!     let new = ticket.swap(Some(old))?;
//!     drop(ticket);
//!     allocator.swap_commit(txn)?;
//!     Ok(new)
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;

pub use crate::config::AllocatorConfig;
pub use crate::core::{
    allocator::{
        bitmap::RawBitmap,
        extent::Extent,
        reservation::Reservation,
        swap::SwapCapable,
        AllocationStats, BlockAllocator, GrowCallback,
    },
    metadata::VolumeMetadata,
    superblock::{SharedSuperblock, Superblock, SuperblockManager},
    transaction::{EnqueuedWrite, Transaction, WriteTransaction},
    volume::{FileVolume, MemoryVolume, VolumeBackingStore},
};
pub use crate::error::{AllocError, Result};
