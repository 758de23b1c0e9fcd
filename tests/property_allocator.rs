//! Property-based tests for allocator correctness
//!
//! Uses proptest to verify allocator invariants hold across many random
//! operation sequences

use blockmap_rs::{
    AllocatorConfig, BlockAllocator, MemoryVolume, Reservation, SharedSuperblock, Superblock,
    SwapCapable, WriteTransaction,
};
use proptest::prelude::*;
use std::collections::BTreeSet;

const BLOCK_SIZE: u32 = 512;
const SLICE_SIZE: u64 = 16 * 1024;

fn config() -> AllocatorConfig {
    AllocatorConfig {
        block_size: BLOCK_SIZE,
        slice_size: SLICE_SIZE,
        grow_slices: 1,
        find_chunk_bits: 64,
    }
}

fn fixed(pool: u64) -> (BlockAllocator, SharedSuperblock) {
    let superblock = SharedSuperblock::new(Superblock::new_fixed(BLOCK_SIZE, pool));
    let alloc =
        BlockAllocator::create(config(), MemoryVolume::new(BLOCK_SIZE), superblock.clone())
            .unwrap();
    (alloc, superblock)
}

#[derive(Debug, Clone)]
enum Op {
    Reserve(u64),
    Allocate(usize),
    Free(usize),
    DropTicket(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..12).prop_map(Op::Reserve),
        any::<usize>().prop_map(Op::Allocate),
        any::<usize>().prop_map(Op::Free),
        any::<usize>().prop_map(Op::DropTicket),
    ]
}

proptest! {
    #[test]
    fn prop_counters_match_model(
        pool in 16u64..300,
        ops in prop::collection::vec(op_strategy(), 1..120)
    ) {
        let (alloc, superblock) = fixed(pool);
        let mut txn = WriteTransaction::new();
        let mut tickets: Vec<Reservation<'_>> = Vec::new();
        let mut allocated = BTreeSet::new();

        for op in ops {
            match op {
                Op::Reserve(count) => {
                    let available = pool - allocated.len() as u64 - alloc.reserved();
                    match alloc.reserve(&mut txn, count) {
                        Ok(ticket) => {
                            prop_assert!(count <= available);
                            tickets.push(ticket);
                        }
                        Err(_) => prop_assert!(count > available),
                    }
                }
                Op::Allocate(pick) => {
                    let live: Vec<usize> = (0..tickets.len())
                        .filter(|&i| tickets[i].remaining() > 0)
                        .collect();
                    if live.is_empty() {
                        continue;
                    }
                    let ticket = &mut tickets[live[pick % live.len()]];
                    let index = ticket.allocate(&mut txn).unwrap();
                    prop_assert!(index < pool);
                    prop_assert!(allocated.insert(index), "block {} allocated twice", index);
                }
                Op::Free(pick) => {
                    if allocated.is_empty() {
                        continue;
                    }
                    let index = *allocated.iter().nth(pick % allocated.len()).unwrap();
                    alloc.free(&mut txn, index).unwrap();
                    allocated.remove(&index);
                }
                Op::DropTicket(pick) => {
                    if tickets.is_empty() {
                        continue;
                    }
                    tickets.swap_remove(pick % tickets.len());
                }
            }

            let outstanding: u64 = tickets.iter().map(|t| t.remaining()).sum();
            prop_assert_eq!(alloc.reserved(), outstanding);
            prop_assert_eq!(superblock.pool_used(), allocated.len() as u64);
            prop_assert_eq!(
                alloc.available(),
                pool - allocated.len() as u64 - outstanding
            );
            let lowest_free = (0..pool).find(|i| !allocated.contains(i)).unwrap_or(pool);
            prop_assert!(alloc.first_free() <= lowest_free);
        }

        drop(tickets);
        prop_assert_eq!(alloc.reserved(), 0);
        let regions: u64 = alloc.allocated_regions().iter().map(|r| r.length).sum();
        prop_assert_eq!(regions, allocated.len() as u64);
    }

    #[test]
    fn prop_free_then_allocate_returns_lowest(
        pool in 8u64..200,
        frees in prop::collection::btree_set(0u64..200, 1..8)
    ) {
        let (alloc, _) = fixed(pool);
        let mut txn = WriteTransaction::new();
        let mut ticket = alloc.reserve(&mut txn, pool).unwrap();
        for _ in 0..pool {
            ticket.allocate(&mut txn).unwrap();
        }
        drop(ticket);

        let frees: Vec<u64> = frees.into_iter().filter(|&i| i < pool).collect();
        prop_assume!(!frees.is_empty());
        for &index in &frees {
            alloc.free(&mut txn, index).unwrap();
        }

        let mut ticket = alloc.reserve(&mut txn, frees.len() as u64).unwrap();
        for &expected in &frees {
            prop_assert_eq!(ticket.allocate(&mut txn).unwrap(), expected);
        }
    }

    #[test]
    fn prop_swap_is_atomic(
        pool in 32u64..256,
        used in 1u64..32,
        swaps in prop::collection::vec(any::<Option<u8>>(), 1..16),
        refill in any::<u8>()
    ) {
        prop_assume!(used + swaps.len() as u64 + 1 <= pool);
        let (alloc, superblock) = fixed(pool);
        let mut txn = WriteTransaction::new();

        let mut ticket = alloc.reserve(&mut txn, used).unwrap();
        for _ in 0..used {
            ticket.allocate(&mut txn).unwrap();
        }
        drop(ticket);
        let before = alloc.allocated_regions();

        let mut swapped_out = BTreeSet::new();
        let mut swapped_in = BTreeSet::new();
        let mut ticket = alloc.reserve(&mut txn, swaps.len() as u64 + 1).unwrap();
        for old in swaps {
            let old = old
                .map(|o| o as u64 % used)
                .filter(|o| !swapped_out.contains(o));
            let new = ticket.swap(old).unwrap();
            prop_assert!(!alloc.is_allocated(new));
            prop_assert!(swapped_in.insert(new));
            if let Some(o) = old {
                swapped_out.insert(o);
            }
        }

        // Free and refill a settled block while swaps are pending. The
        // freed block is the lowest hole, so it comes straight back.
        let settled: Vec<u64> = (0..used).filter(|i| !swapped_out.contains(i)).collect();
        if !settled.is_empty() {
            let hole = settled[refill as usize % settled.len()];
            alloc.free(&mut txn, hole).unwrap();
            let placed = ticket.allocate(&mut txn).unwrap();
            prop_assert_eq!(placed, hole);
            prop_assert!(!swapped_in.contains(&placed));
        }
        drop(ticket);

        // Nothing visible before commit
        prop_assert_eq!(alloc.allocated_regions(), before);
        prop_assert_eq!(superblock.pool_used(), used);

        alloc.swap_commit(&mut txn).unwrap();
        let expected = used + swapped_in.len() as u64 - swapped_out.len() as u64;
        prop_assert_eq!(superblock.pool_used(), expected);
        for index in &swapped_in {
            prop_assert!(alloc.is_allocated(*index));
        }
        for index in &swapped_out {
            prop_assert!(!alloc.is_allocated(*index));
        }
        prop_assert_eq!(alloc.swap_pending(), (0, 0));
    }

    #[test]
    fn prop_extend_is_monotonic(
        data_slices in 1u64..4,
        requests in prop::collection::vec(1u64..200, 1..10)
    ) {
        let superblock = SharedSuperblock::new(Superblock::new_extensible(
            BLOCK_SIZE, SLICE_SIZE, 1, data_slices,
        ));
        let alloc =
            BlockAllocator::create(config(), MemoryVolume::new(BLOCK_SIZE), superblock.clone())
                .unwrap();
        let blocks_per_slice = SLICE_SIZE / BLOCK_SIZE as u64;
        let mut txn = WriteTransaction::new();

        let mut last_total = alloc.pool_total();
        let mut placed = 0u64;
        for count in requests {
            let mut ticket = alloc.reserve(&mut txn, count).unwrap();
            for _ in 0..count {
                ticket.allocate(&mut txn).unwrap();
            }
            placed += count;

            let total = alloc.pool_total();
            prop_assert!(total >= last_total);
            prop_assert_eq!(total % blocks_per_slice, 0);
            prop_assert_eq!(alloc.check_allocated(0, placed), Ok(()));
            last_total = total;
        }
        prop_assert_eq!(superblock.pool_used(), placed);
    }
}
