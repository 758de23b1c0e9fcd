//! Volume extension tests
//!
//! Extensible volumes grow the data pool in whole slices, either explicitly
//! or when a reservation cannot otherwise be covered.

use blockmap_rs::{
    AllocError, AllocatorConfig, BlockAllocator, MemoryVolume, SharedSuperblock, Superblock,
    SuperblockManager, VolumeBackingStore, WriteTransaction,
};
use std::sync::{Arc, Mutex};

const BLOCK_SIZE: u32 = 4096;
const SLICE_SIZE: u64 = 256 * 1024;
const BLOCKS_PER_SLICE: u64 = SLICE_SIZE / BLOCK_SIZE as u64;

fn config() -> AllocatorConfig {
    AllocatorConfig {
        block_size: BLOCK_SIZE,
        slice_size: SLICE_SIZE,
        grow_slices: 1,
        find_chunk_bits: 1024,
    }
}

fn mount(data_slices: u64, volume: MemoryVolume) -> (BlockAllocator, SharedSuperblock) {
    let superblock = SharedSuperblock::new(Superblock::new_extensible(
        BLOCK_SIZE, SLICE_SIZE, 1, data_slices,
    ));
    let alloc = BlockAllocator::create(config(), volume, superblock.clone()).unwrap();
    (alloc, superblock)
}

#[test]
fn test_reserve_triggers_growth() {
    let volume = MemoryVolume::new(BLOCK_SIZE);
    let (alloc, superblock) = mount(2, volume.clone());
    let mut txn = WriteTransaction::new();

    let mut ticket = alloc.reserve(&mut txn, 2 * BLOCKS_PER_SLICE).unwrap();
    for _ in 0..2 * BLOCKS_PER_SLICE {
        ticket.allocate(&mut txn).unwrap();
    }
    drop(ticket);
    assert_eq!(volume.slices_granted(), 0);

    let mut ticket = alloc.reserve(&mut txn, 1).unwrap();
    assert_eq!(volume.slices_granted(), 1);
    assert_eq!(superblock.pool_total(), 3 * BLOCKS_PER_SLICE);
    assert_eq!(superblock.info().data_slices, 3);
    assert_eq!(ticket.allocate(&mut txn).unwrap(), 2 * BLOCKS_PER_SLICE);
}

#[test]
fn test_growth_is_monotonic() {
    let volume = MemoryVolume::new(BLOCK_SIZE);
    let (alloc, _) = mount(1, volume);
    let mut txn = WriteTransaction::new();

    let mut ticket = alloc.reserve(&mut txn, 10).unwrap();
    for _ in 0..10 {
        ticket.allocate(&mut txn).unwrap();
    }
    drop(ticket);

    let mut last = alloc.pool_total();
    for _ in 0..5 {
        alloc.extend(&mut txn).unwrap();
        let total = alloc.pool_total();
        assert_eq!(total, last + BLOCKS_PER_SLICE);
        last = total;

        // Existing allocations survive every extension
        assert_eq!(alloc.check_allocated(0, 10), Ok(()));
        assert_eq!(alloc.pool_used(), 10);
    }
}

#[test]
fn test_growth_covers_large_shortfall() {
    let volume = MemoryVolume::new(BLOCK_SIZE);
    let (alloc, _) = mount(1, volume.clone());
    let mut txn = WriteTransaction::new();

    let wanted = 5 * BLOCKS_PER_SLICE + 1;
    let ticket = alloc.reserve(&mut txn, wanted).unwrap();
    assert_eq!(ticket.remaining(), wanted);
    assert_eq!(volume.slices_granted(), 5);
    assert_eq!(alloc.pool_total(), 6 * BLOCKS_PER_SLICE);
}

#[test]
fn test_extension_requests_slices_after_data() {
    struct Recorder {
        inner: MemoryVolume,
        requests: Arc<Mutex<Vec<(u64, u64)>>>,
    }

    impl VolumeBackingStore for Recorder {
        fn block_size(&self) -> u32 {
            self.inner.block_size()
        }

        fn read_blocks(&mut self, block: u64, buf: &mut [u8]) -> anyhow::Result<()> {
            self.inner.read_blocks(block, buf)
        }

        fn write_blocks(&mut self, block: u64, data: &[u8]) -> anyhow::Result<()> {
            self.inner.write_blocks(block, data)
        }

        fn extend(&mut self, slice_offset: u64, slice_count: u64) -> anyhow::Result<()> {
            self.requests.lock().unwrap().push((slice_offset, slice_count));
            Ok(())
        }
    }

    let requests = Arc::new(Mutex::new(Vec::new()));
    let volume = Recorder {
        inner: MemoryVolume::new(BLOCK_SIZE),
        requests: requests.clone(),
    };
    let superblock = SharedSuperblock::new(Superblock::new_extensible(BLOCK_SIZE, SLICE_SIZE, 1, 3));
    let alloc = BlockAllocator::create(config(), volume, superblock).unwrap();
    let data_slice = alloc.metadata().blocks_to_slices(alloc.metadata().data_start()).unwrap();

    let mut txn = WriteTransaction::new();
    alloc.extend(&mut txn).unwrap();
    alloc.extend(&mut txn).unwrap();
    assert_eq!(
        *requests.lock().unwrap(),
        vec![(data_slice + 3, 1), (data_slice + 4, 1)]
    );
}

#[test]
fn test_refused_growth_reports_volume_error() {
    let volume = MemoryVolume::with_slice_limit(BLOCK_SIZE, 1);
    let (alloc, _) = mount(1, volume.clone());
    let mut txn = WriteTransaction::new();

    let _first = alloc.reserve(&mut txn, 2 * BLOCKS_PER_SLICE).unwrap();
    let err = alloc.reserve(&mut txn, 1).unwrap_err();
    assert!(matches!(err, AllocError::Volume(_)));
    assert_eq!(alloc.pool_total(), 2 * BLOCKS_PER_SLICE);
    assert_eq!(alloc.reserved(), 2 * BLOCKS_PER_SLICE);
}

#[test]
fn test_grow_callback_sees_new_size() {
    let volume = MemoryVolume::new(BLOCK_SIZE);
    let (alloc, _) = mount(1, volume);
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let sink = sizes.clone();
    alloc.set_grow_callback(move |pool| {
        sink.lock().unwrap().push(pool);
        Ok(())
    });

    let mut txn = WriteTransaction::new();
    let _ticket = alloc.reserve(&mut txn, 3 * BLOCKS_PER_SLICE).unwrap();
    assert_eq!(*sizes.lock().unwrap(), vec![3 * BLOCKS_PER_SLICE]);
}

#[test]
fn test_grow_callback_failure_keeps_pool() {
    let volume = MemoryVolume::new(BLOCK_SIZE);
    let (alloc, superblock) = mount(1, volume);
    alloc.set_grow_callback(|_| Err(anyhow::anyhow!("inode table is full")));

    let mut txn = WriteTransaction::new();
    let err = alloc.reserve(&mut txn, BLOCKS_PER_SLICE + 1).unwrap_err();
    assert!(matches!(err, AllocError::Volume(_)));
    assert_eq!(superblock.pool_total(), BLOCKS_PER_SLICE);
    assert_eq!(alloc.reserved(), 0);
    assert!(txn.is_empty());
}

#[test]
fn test_fixed_volume_never_grows() {
    let superblock = SharedSuperblock::new(Superblock::new_fixed(BLOCK_SIZE, 32));
    let alloc = BlockAllocator::create(config(), MemoryVolume::new(BLOCK_SIZE), superblock).unwrap();
    let mut txn = WriteTransaction::new();

    assert!(matches!(alloc.extend(&mut txn), Err(AllocError::NoSpace)));
    assert!(matches!(alloc.reserve(&mut txn, 33), Err(AllocError::NoSpace)));
}
