//! Volume backing stores
//!
//! The allocator consumes a volume through [`VolumeBackingStore`]: raw block
//! reads and writes, plus a request to grow by whole slices. Errors from the
//! store are opaque to the allocator and travel as [`anyhow::Error`].
//!
//! Two stores are provided:
//! - [`MemoryVolume`]: sparse in-memory blocks, used by tests and tooling
//! - [`FileVolume`]: a regular file addressed in blocks

use anyhow::{bail, ensure, Context};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Block device contract required by the allocator
pub trait VolumeBackingStore: Send {
    /// Size of one block in bytes
    fn block_size(&self) -> u32;

    /// Fill `buf` (a whole number of blocks) starting at `block`
    fn read_blocks(&mut self, block: u64, buf: &mut [u8]) -> anyhow::Result<()>;

    /// Write `data` (a whole number of blocks) starting at `block`
    fn write_blocks(&mut self, block: u64, data: &[u8]) -> anyhow::Result<()>;

    /// Grow the volume by `slice_count` slices, mapped starting at slice
    /// `slice_offset`
    fn extend(&mut self, slice_offset: u64, slice_count: u64) -> anyhow::Result<()>;
}

/// Slice budget shared by both stores
#[derive(Debug, Clone, Copy, Default)]
struct SliceBudget {
    /// Slices granted by `extend` so far
    granted: u64,

    /// Maximum slices that may be granted (None = unlimited)
    limit: Option<u64>,
}

impl SliceBudget {
    fn grant(&mut self, slice_count: u64) -> anyhow::Result<()> {
        let requested = self.granted + slice_count;
        if let Some(limit) = self.limit {
            if requested > limit {
                bail!(
                    "volume cannot grant {} slices: {} of {} already in use",
                    slice_count,
                    self.granted,
                    limit
                );
            }
        }
        self.granted = requested;
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryInner {
    blocks: BTreeMap<u64, Vec<u8>>,
    budget: SliceBudget,
}

/// Sparse in-memory volume
///
/// Clones share the same storage. Unwritten blocks read as zeros.
#[derive(Debug, Clone)]
pub struct MemoryVolume {
    block_size: u32,
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryVolume {
    pub fn new(block_size: u32) -> Self {
        MemoryVolume {
            block_size,
            inner: Arc::new(Mutex::new(MemoryInner {
                blocks: BTreeMap::new(),
                budget: SliceBudget::default(),
            })),
        }
    }

    /// Volume that refuses to grant more than `limit` extra slices
    pub fn with_slice_limit(block_size: u32, limit: u64) -> Self {
        let volume = Self::new(block_size);
        volume.inner.lock().budget.limit = Some(limit);
        volume
    }

    /// Slices granted by `extend` so far
    pub fn slices_granted(&self) -> u64 {
        self.inner.lock().budget.granted
    }

    /// Number of blocks that have been written at least once
    pub fn written_blocks(&self) -> usize {
        self.inner.lock().blocks.len()
    }
}

impl VolumeBackingStore for MemoryVolume {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read_blocks(&mut self, block: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        let block_size = self.block_size as usize;
        ensure!(
            buf.len() % block_size == 0,
            "read of {} bytes is not block aligned",
            buf.len()
        );

        let inner = self.inner.lock();
        for (i, chunk) in buf.chunks_mut(block_size).enumerate() {
            match inner.blocks.get(&(block + i as u64)) {
                Some(data) => chunk.copy_from_slice(data),
                None => chunk.fill(0),
            }
        }
        Ok(())
    }

    fn write_blocks(&mut self, block: u64, data: &[u8]) -> anyhow::Result<()> {
        let block_size = self.block_size as usize;
        ensure!(
            data.len() % block_size == 0,
            "write of {} bytes is not block aligned",
            data.len()
        );

        let mut inner = self.inner.lock();
        for (i, chunk) in data.chunks(block_size).enumerate() {
            inner.blocks.insert(block + i as u64, chunk.to_vec());
        }
        Ok(())
    }

    fn extend(&mut self, slice_offset: u64, slice_count: u64) -> anyhow::Result<()> {
        tracing::debug!("Mapping {} slices at slice {}", slice_count, slice_offset);
        self.inner.lock().budget.grant(slice_count)
    }
}

#[derive(Debug)]
struct FileInner {
    file: File,
    budget: SliceBudget,
}

/// File-backed volume
///
/// Blocks are addressed by offset `block * block_size`; the file is sparse
/// where nothing has been written. Clones share the same open file.
#[derive(Debug, Clone)]
pub struct FileVolume {
    path: PathBuf,
    block_size: u32,
    inner: Arc<Mutex<FileInner>>,
}

impl FileVolume {
    /// Create (or truncate) a volume file
    pub fn create<P: AsRef<Path>>(path: P, block_size: u32) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self::from_file(path, file, block_size))
    }

    /// Open an existing volume file
    pub fn open<P: AsRef<Path>>(path: P, block_size: u32) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self::from_file(path, file, block_size))
    }

    fn from_file<P: AsRef<Path>>(path: P, file: File, block_size: u32) -> Self {
        FileVolume {
            path: path.as_ref().to_path_buf(),
            block_size,
            inner: Arc::new(Mutex::new(FileInner {
                file,
                budget: SliceBudget::default(),
            })),
        }
    }

    /// Cap the number of slices `extend` may grant
    pub fn set_slice_limit(&self, limit: Option<u64>) {
        self.inner.lock().budget.limit = limit;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync all writes to disk
    pub fn sync(&self) -> std::io::Result<()> {
        self.inner.lock().file.sync_all()
    }
}

impl VolumeBackingStore for FileVolume {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read_blocks(&mut self, block: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        let offset = block * self.block_size as u64;
        let mut inner = self.inner.lock();
        let len = inner.file.metadata()?.len();

        buf.fill(0);
        if offset >= len {
            return Ok(());
        }

        // Reads past the end of a sparse file see zeros
        let available = ((len - offset) as usize).min(buf.len());
        inner.file.seek(SeekFrom::Start(offset))?;
        inner
            .file
            .read_exact(&mut buf[..available])
            .with_context(|| format!("reading {} bytes at block {}", available, block))?;
        Ok(())
    }

    fn write_blocks(&mut self, block: u64, data: &[u8]) -> anyhow::Result<()> {
        let offset = block * self.block_size as u64;
        let mut inner = self.inner.lock();
        inner.file.seek(SeekFrom::Start(offset))?;
        inner
            .file
            .write_all(data)
            .with_context(|| format!("writing {} bytes at block {}", data.len(), block))?;
        inner.file.flush()?;
        Ok(())
    }

    fn extend(&mut self, slice_offset: u64, slice_count: u64) -> anyhow::Result<()> {
        tracing::debug!("Mapping {} slices at slice {}", slice_count, slice_offset);
        self.inner.lock().budget.grant(slice_count)
    }
}
