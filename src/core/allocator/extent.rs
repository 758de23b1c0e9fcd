//! Contiguous block runs
//!
//! Allocated-region reports and bitmap persistence both speak in extents: a
//! starting block plus a length.

/// An extent representing a contiguous range of blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Starting block index
    pub start: u64,
    /// Number of contiguous blocks
    pub length: u64,
}

impl Extent {
    pub fn new(start: u64, length: u64) -> Self {
        Extent { start, length }
    }

    /// One past the last block
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}
