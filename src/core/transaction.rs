//! Write-transaction sink
//!
//! The allocator never writes to the volume itself. Bitmap deltas and
//! superblock updates are enqueued into a [`Transaction`] that the caller
//! commits alongside the rest of its metadata.

use crate::core::volume::VolumeBackingStore;
use crate::error::{AllocError, Result};

/// Append-only sink for pending metadata writes
pub trait Transaction {
    /// Schedule a write of `block_count` blocks of `data`
    ///
    /// `relative_block` is the offset of the first block inside the metadata
    /// structure being written (e.g. the block map); `absolute_block` is where
    /// that block lives on the volume.
    fn enqueue(&mut self, data: Vec<u8>, relative_block: u64, absolute_block: u64, block_count: u64);
}

/// One queued write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuedWrite {
    pub data: Vec<u8>,
    pub relative_block: u64,
    pub absolute_block: u64,
    pub block_count: u64,
}

/// In-memory transaction that records writes in order
#[derive(Debug, Default)]
pub struct WriteTransaction {
    writes: Vec<EnqueuedWrite>,
}

impl WriteTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> &[EnqueuedWrite] {
        &self.writes
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Writes that touch `absolute_block`
    pub fn writes_covering(&self, absolute_block: u64) -> impl Iterator<Item = &EnqueuedWrite> {
        self.writes.iter().filter(move |write| {
            absolute_block >= write.absolute_block
                && absolute_block < write.absolute_block + write.block_count
        })
    }

    /// Apply every queued write to `volume`, in order
    pub fn commit(self, volume: &mut dyn VolumeBackingStore) -> Result<()> {
        let block_size = volume.block_size() as u64;
        tracing::debug!("Committing {} queued writes", self.writes.len());

        for write in self.writes {
            let expected = write.block_count * block_size;
            if write.data.len() as u64 > expected {
                return Err(AllocError::Corrupted(format!(
                    "write to block {} carries {} bytes for {} blocks",
                    write.absolute_block,
                    write.data.len(),
                    write.block_count
                )));
            }

            let mut data = write.data;
            data.resize(expected as usize, 0);
            volume
                .write_blocks(write.absolute_block, &data)
                .map_err(AllocError::Volume)?;
        }
        Ok(())
    }
}

impl Transaction for WriteTransaction {
    fn enqueue(&mut self, data: Vec<u8>, relative_block: u64, absolute_block: u64, block_count: u64) {
        self.writes.push(EnqueuedWrite {
            data,
            relative_block,
            absolute_block,
            block_count,
        });
    }
}
