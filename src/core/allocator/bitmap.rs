//! Growable bitmap backing the block allocator
//!
//! Each bit represents one data block:
//! - 0 = free block
//! - 1 = allocated block
//!
//! Storage is kept block-aligned: the word vector always covers a whole number
//! of metadata blocks (`bits_per_block` bits each) so that any range of the
//! bitmap can be written back to the volume one metadata block at a time.
//! The logical `size` may be smaller than the storage capacity; bits past
//! `size` are kept clear.

use crate::core::allocator::extent::Extent;
use crate::error::{AllocError, Result};

const WORD_BITS: u64 = u64::BITS as u64;

/// Block-aligned bitmap with range and scan operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBitmap {
    /// Bitmap words (each word = 64 bits = 64 blocks)
    words: Vec<u64>,

    /// Number of live bits
    size: u64,

    /// Bits described by one metadata block (`block_size * 8`)
    bits_per_block: u64,
}

impl RawBitmap {
    /// Create an all-clear bitmap of `size` bits
    pub fn new(size: u64, bits_per_block: u64) -> Self {
        debug_assert!(bits_per_block > 0 && bits_per_block % WORD_BITS == 0);
        let mut bitmap = RawBitmap {
            words: Vec::new(),
            size: 0,
            bits_per_block,
        };
        bitmap.grow(size);
        bitmap
    }

    /// Rebuild a bitmap from its on-disk block image
    ///
    /// `bytes` must cover every metadata block needed for `size` bits. Bits
    /// past `size` are discarded.
    pub fn from_block_bytes(bytes: &[u8], size: u64, bits_per_block: u64) -> Result<Self> {
        let mut bitmap = RawBitmap::new(size, bits_per_block);
        let needed = bitmap.words.len() * 8;
        if bytes.len() < needed {
            return Err(AllocError::Corrupted(format!(
                "block map image holds {} bytes, {} required for {} blocks",
                bytes.len(),
                needed,
                size
            )));
        }

        for (word, chunk) in bitmap.words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }
        bitmap.clear_tail();
        Ok(bitmap)
    }

    /// Number of metadata blocks needed to describe `bits` bits
    pub fn blocks_for_bits(bits: u64, bits_per_block: u64) -> u64 {
        bits.div_ceil(bits_per_block)
    }

    /// Number of live bits
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of bits the backing storage can hold
    pub fn capacity(&self) -> u64 {
        self.words.len() as u64 * WORD_BITS
    }

    /// Number of metadata blocks backing this bitmap
    pub fn storage_blocks(&self) -> u64 {
        self.capacity() / self.bits_per_block
    }

    pub fn bits_per_block(&self) -> u64 {
        self.bits_per_block
    }

    /// Check if a bit is set; bits past `size` read as clear
    pub fn get(&self, index: u64) -> bool {
        if index >= self.size {
            return false;
        }
        let (word_idx, bit) = Self::locate(index);
        (self.words[word_idx] & (1u64 << bit)) != 0
    }

    pub fn set(&mut self, index: u64) {
        self.set_range(index, index + 1);
    }

    pub fn clear(&mut self, index: u64) {
        self.clear_range(index, index + 1);
    }

    /// Set every bit in `[start, end)`
    pub fn set_range(&mut self, start: u64, end: u64) {
        debug_assert!(end <= self.size, "set_range past end: {} > {}", end, self.size);
        self.apply_range(start, end.min(self.size), true);
    }

    /// Clear every bit in `[start, end)`
    pub fn clear_range(&mut self, start: u64, end: u64) {
        self.apply_range(start, end.min(self.size), false);
    }

    /// Clear every bit
    pub fn reset(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
    }

    /// True if every bit in `[start, end)` is set
    pub fn all_set(&self, start: u64, end: u64) -> bool {
        end <= self.size && self.find_first_clear(start, end).is_none()
    }

    /// True if no bit in `[start, end)` is set
    pub fn none_set(&self, start: u64, end: u64) -> bool {
        self.find_first_set(start, end).is_none()
    }

    /// Lowest clear bit in `[start, end)`
    pub fn find_first_clear(&self, start: u64, end: u64) -> Option<u64> {
        self.find_first(start, end, false)
    }

    /// Lowest set bit in `[start, end)`
    pub fn find_first_set(&self, start: u64, end: u64) -> Option<u64> {
        self.find_first(start, end, true)
    }

    /// Count every set bit
    pub fn count_all(&self) -> u64 {
        self.words.iter().map(|word| word.count_ones() as u64).sum()
    }

    /// Grow to `new_size` bits
    ///
    /// Storage is rounded up to whole metadata blocks; added bits are clear.
    /// A smaller `new_size` is ignored (use [`RawBitmap::shrink`]).
    pub fn grow(&mut self, new_size: u64) {
        if new_size < self.size {
            return;
        }
        let capacity = new_size.div_ceil(self.bits_per_block) * self.bits_per_block;
        let num_words = (capacity / WORD_BITS) as usize;
        if num_words > self.words.len() {
            self.words.resize(num_words, 0u64);
        }
        self.size = new_size;
    }

    /// Logically trim to `new_size` bits, keeping storage
    ///
    /// Bits past the new size are cleared.
    pub fn shrink(&mut self, new_size: u64) {
        if new_size >= self.size {
            return;
        }
        self.size = new_size;
        self.clear_tail();
    }

    /// Iterate over maximal runs of set bits
    pub fn set_runs(&self) -> SetRuns<'_> {
        SetRuns {
            bitmap: self,
            position: 0,
        }
    }

    /// Metadata block containing bit `index`
    pub fn block_of(&self, index: u64) -> u64 {
        index / self.bits_per_block
    }

    /// Little-endian image of `block_count` metadata blocks starting at `first_block`
    pub fn block_bytes(&self, first_block: u64, block_count: u64) -> Vec<u8> {
        let words_per_block = (self.bits_per_block / WORD_BITS) as usize;
        let start = first_block as usize * words_per_block;
        let end = (start + block_count as usize * words_per_block).min(self.words.len());
        let start = start.min(end);

        let mut bytes = Vec::with_capacity((end - start) * 8);
        for word in &self.words[start..end] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    fn find_first(&self, start: u64, end: u64, want_set: bool) -> Option<u64> {
        let end = end.min(self.size);
        if start >= end {
            return None;
        }

        let (mut word_idx, bit) = Self::locate(start);
        let mut word = self.search_word(word_idx, want_set) & (u64::MAX << bit);
        loop {
            if word != 0 {
                let index = word_idx as u64 * WORD_BITS + word.trailing_zeros() as u64;
                return (index < end).then_some(index);
            }
            word_idx += 1;
            if word_idx as u64 * WORD_BITS >= end {
                return None;
            }
            word = self.search_word(word_idx, want_set);
        }
    }

    fn search_word(&self, word_idx: usize, want_set: bool) -> u64 {
        let word = self.words[word_idx];
        if want_set {
            word
        } else {
            !word
        }
    }

    fn apply_range(&mut self, start: u64, end: u64, set: bool) {
        let mut index = start;
        while index < end {
            let (word_idx, bit) = Self::locate(index);
            let span = (WORD_BITS - bit).min(end - index);
            let mask = Self::mask(bit, span);
            if set {
                self.words[word_idx] |= mask;
            } else {
                self.words[word_idx] &= !mask;
            }
            index += span;
        }
    }

    fn clear_tail(&mut self) {
        let capacity = self.capacity();
        let size = self.size;
        self.apply_range(size, capacity, false);
    }

    fn locate(index: u64) -> (usize, u64) {
        ((index / WORD_BITS) as usize, index % WORD_BITS)
    }

    fn mask(bit: u64, span: u64) -> u64 {
        if span == WORD_BITS {
            u64::MAX
        } else {
            ((1u64 << span) - 1) << bit
        }
    }
}

/// Iterator over runs of set bits, produced by [`RawBitmap::set_runs`]
pub struct SetRuns<'a> {
    bitmap: &'a RawBitmap,
    position: u64,
}

impl Iterator for SetRuns<'_> {
    type Item = Extent;

    fn next(&mut self) -> Option<Extent> {
        let size = self.bitmap.size();
        let start = self.bitmap.find_first_set(self.position, size)?;
        let end = self.bitmap.find_first_clear(start, size).unwrap_or(size);
        self.position = end;
        Some(Extent::new(start, end - start))
    }
}
