//! Rebuilding the bucket array for a new capacity.
//!
//! Every strategy leaves the arena untouched apart from `next` links and
//! returns how many entries it placed, which the caller checks against the
//! table's population.

use alloc::vec::Vec;

use crate::buckets::BucketTable;
use crate::entry::EntryRef;
use crate::error::TryReserveError;
use crate::error::try_reserve_exact;
use crate::free_list::EntryLinks;

/// How a rehash redistributes chains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RehashStrategy {
    /// Exact doubling: each chain splits on the one new mask bit.
    DoublingSplit,
    /// Every entry is pushed onto a freshly allocated array.
    Scatter,
    /// The array is resized in place and only entries whose index changes
    /// are moved.
    Partition,
}

impl RehashStrategy {
    pub(crate) fn select(old: usize, new: usize, live: usize, max_chunk_entries: usize) -> Self {
        if old.checked_mul(2) == Some(new) {
            RehashStrategy::DoublingSplit
        } else if new >= live.saturating_mul(2) || live > max_chunk_entries {
            RehashStrategy::Scatter
        } else {
            RehashStrategy::Partition
        }
    }
}

/// Rebuilds `buckets` with `capacity` chains using `strategy`. On error
/// nothing has been modified.
pub(crate) fn rehash<L: EntryLinks + ?Sized>(
    buckets: &mut BucketTable,
    links: &mut L,
    capacity: usize,
    strategy: RehashStrategy,
) -> Result<usize, TryReserveError> {
    debug_assert_eq!(capacity, BucketTable::normalize(capacity));
    match strategy {
        RehashStrategy::DoublingSplit => doubling_split(buckets, links, capacity),
        RehashStrategy::Scatter => scatter(buckets, links, capacity),
        RehashStrategy::Partition => partition(buckets, links, capacity),
    }
}

fn doubling_split<L: EntryLinks + ?Sized>(
    buckets: &mut BucketTable,
    links: &mut L,
    capacity: usize,
) -> Result<usize, TryReserveError> {
    let old = buckets.len();
    debug_assert_eq!(old * 2, capacity);
    let mut fresh = BucketTable::try_with_capacity(capacity)?;

    let mut placed = 0;
    for index in 0..old {
        let mut low_tail: Option<EntryRef> = None;
        let mut high_tail: Option<EntryRef> = None;
        let mut cur = buckets.head(index);
        while let Some(node) = cur {
            cur = links.next(node);
            links.set_next(node, None);

            let (bucket, tail) = if links.hash(node) as usize & old == 0 {
                (index, &mut low_tail)
            } else {
                (index + old, &mut high_tail)
            };
            match *tail {
                Some(prev) => links.set_next(prev, Some(node)),
                None => fresh.set_head(bucket, Some(node)),
            }
            *tail = Some(node);
            placed += 1;
        }
    }

    *buckets = fresh;
    Ok(placed)
}

fn scatter<L: EntryLinks + ?Sized>(
    buckets: &mut BucketTable,
    links: &mut L,
    capacity: usize,
) -> Result<usize, TryReserveError> {
    let mut fresh = BucketTable::try_with_capacity(capacity)?;

    let mut placed = 0;
    for index in 0..buckets.len() {
        let mut cur = buckets.head(index);
        while let Some(node) = cur {
            cur = links.next(node);
            let bucket = fresh.index_for(links.hash(node));
            fresh.push_front(links, bucket, node);
            placed += 1;
        }
    }

    *buckets = fresh;
    Ok(placed)
}

fn partition<L: EntryLinks + ?Sized>(
    buckets: &mut BucketTable,
    links: &mut L,
    capacity: usize,
) -> Result<usize, TryReserveError> {
    let old = buckets.len();

    // Reserve whatever the resize needs before the first link changes.
    let mut shrunk: Option<Vec<Option<EntryRef>>> = None;
    if capacity > old {
        buckets.try_grow_in_place(capacity)?;
    } else if capacity < old {
        let mut heads = Vec::new();
        try_reserve_exact(&mut heads, capacity)?;
        shrunk = Some(heads);
    }
    let mask = capacity - 1;

    let mut placed = 0;
    let mut pending: Option<EntryRef> = None;
    for index in 0..old {
        let mut kept_tail: Option<EntryRef> = None;
        let mut cur = buckets.head(index);
        buckets.set_head(index, None);
        while let Some(node) = cur {
            cur = links.next(node);
            let bucket = links.hash(node) as usize & mask;
            if bucket == index {
                links.set_next(node, None);
                match kept_tail {
                    Some(prev) => links.set_next(prev, Some(node)),
                    None => buckets.set_head(index, Some(node)),
                }
                kept_tail = Some(node);
                placed += 1;
            } else {
                links.set_next(node, pending);
                pending = Some(node);
            }
        }
    }

    match shrunk {
        Some(heads) => buckets.shrink_into(heads, capacity),
        None => buckets.set_mask(capacity),
    }

    while let Some(node) = pending {
        pending = links.next(node);
        let bucket = buckets.index_for(links.hash(node));
        buckets.push_front(links, bucket, node);
        placed += 1;
    }

    Ok(placed)
}
