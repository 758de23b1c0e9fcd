//! Allocator core
//!
//! - [`allocator`] - bitmap allocator, reservations and the swap protocol
//! - [`metadata`] - volume layout and slice arithmetic
//! - [`superblock`] - on-disk superblock and the pool-counter handle
//! - [`transaction`] - pending metadata writes
//! - [`volume`] - block device backing stores

pub mod allocator;
pub mod metadata;
pub mod superblock;
pub mod transaction;
pub mod volume;
