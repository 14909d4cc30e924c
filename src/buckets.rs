use alloc::vec::Vec;

use crate::entry::EntryRef;
use crate::error::TryReserveError;
use crate::error::try_reserve_exact;
use crate::free_list::EntryLinks;

/// Smallest bucket array a table ever uses.
pub const MIN_BUCKET_CAPACITY: usize = 8;

/// Largest bucket array a table ever uses. Hashes are 32 bits wide, so more
/// buckets than this could not be addressed evenly anyway.
pub const MAX_BUCKET_CAPACITY: usize = 1 << 30;

/// Power-of-two array of chain heads.
#[derive(Debug)]
pub(crate) struct BucketTable {
    heads: Vec<Option<EntryRef>>,
    mask: usize,
}

impl BucketTable {
    /// Rounds a requested capacity to the power of two the table will use.
    pub(crate) fn normalize(capacity: usize) -> usize {
        capacity
            .clamp(MIN_BUCKET_CAPACITY, MAX_BUCKET_CAPACITY)
            .next_power_of_two()
    }

    /// Allocates an empty table of exactly `capacity` buckets, which must
    /// already be normalized.
    pub(crate) fn try_with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        debug_assert_eq!(capacity, Self::normalize(capacity));
        let mut heads = Vec::new();
        try_reserve_exact(&mut heads, capacity)?;
        heads.resize(capacity, None);
        Ok(BucketTable {
            heads,
            mask: capacity - 1,
        })
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.heads.len()
    }

    #[inline(always)]
    pub(crate) fn mask(&self) -> usize {
        self.mask
    }

    #[inline(always)]
    pub(crate) fn index_for(&self, hash: u32) -> usize {
        hash as usize & self.mask
    }

    #[inline(always)]
    pub(crate) fn head(&self, index: usize) -> Option<EntryRef> {
        self.heads[index]
    }

    #[inline(always)]
    pub(crate) fn set_head(&mut self, index: usize, head: Option<EntryRef>) {
        self.heads[index] = head;
    }

    /// Detaches every chain.
    pub(crate) fn clear(&mut self) {
        self.heads.fill(None);
    }

    pub(crate) fn push_front<L: EntryLinks + ?Sized>(
        &mut self,
        links: &mut L,
        index: usize,
        node: EntryRef,
    ) {
        links.set_next(node, self.heads[index]);
        self.heads[index] = Some(node);
    }

    pub(crate) fn push_back<L: EntryLinks + ?Sized>(
        &mut self,
        links: &mut L,
        index: usize,
        node: EntryRef,
    ) {
        links.set_next(node, None);
        let Some(mut tail) = self.heads[index] else {
            self.heads[index] = Some(node);
            return;
        };
        while let Some(next) = links.next(tail) {
            tail = next;
        }
        links.set_next(tail, Some(node));
    }

    /// Unlinks `node` from chain `index`, given its predecessor in that chain.
    pub(crate) fn unlink<L: EntryLinks + ?Sized>(
        &mut self,
        links: &mut L,
        index: usize,
        prev: Option<EntryRef>,
        node: EntryRef,
    ) {
        let next = links.next(node);
        match prev {
            Some(prev) => {
                debug_assert_eq!(links.next(prev), Some(node));
                links.set_next(prev, next);
            }
            None => {
                debug_assert_eq!(self.heads[index], Some(node));
                self.heads[index] = next;
            }
        }
        links.set_next(node, None);
    }

    /// Grows the array in place to `capacity` empty-tailed buckets.
    pub(crate) fn try_grow_in_place(&mut self, capacity: usize) -> Result<(), TryReserveError> {
        debug_assert!(capacity >= self.heads.len());
        let additional = capacity - self.heads.len();
        try_reserve_exact(&mut self.heads, additional)?;
        self.heads.resize(capacity, None);
        Ok(())
    }

    /// Adopts a new mask once a rehash has placed every chain.
    pub(crate) fn set_mask(&mut self, capacity: usize) {
        debug_assert_eq!(capacity, self.heads.len());
        self.mask = capacity - 1;
    }

    /// Moves the first `capacity` chains into `heads`, an empty vector with
    /// room reserved for them, and adopts it as the head array.
    pub(crate) fn shrink_into(&mut self, mut heads: Vec<Option<EntryRef>>, capacity: usize) {
        debug_assert!(heads.is_empty() && heads.capacity() >= capacity);
        heads.extend_from_slice(&self.heads[..capacity]);
        self.heads = heads;
        self.mask = capacity - 1;
    }

    /// Number of chains with at least one entry.
    #[cfg(any(test, feature = "stats"))]
    pub(crate) fn occupied(&self) -> usize {
        self.heads.iter().filter(|h| h.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::free_list::tests::FlatLinks;
    use crate::free_list::tests::slot;

    fn chain(table: &BucketTable, links: &FlatLinks, index: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = table.head(index);
        while let Some(node) = cur {
            out.push(node.slot());
            cur = links.next(node);
        }
        out
    }

    #[test]
    fn normalize_rounds_and_clamps() {
        assert_eq!(BucketTable::normalize(0), MIN_BUCKET_CAPACITY);
        assert_eq!(BucketTable::normalize(9), 16);
        assert_eq!(BucketTable::normalize(32), 32);
        assert_eq!(BucketTable::normalize(usize::MAX), MAX_BUCKET_CAPACITY);
    }

    #[test]
    fn index_uses_mask() {
        let table = BucketTable::try_with_capacity(16).unwrap();
        assert_eq!(table.len(), 16);
        assert_eq!(table.mask(), 15);
        assert_eq!(table.index_for(0x1234_5678), 0x8);
    }

    #[test]
    fn push_front_reverses_and_push_back_appends() {
        let mut links = FlatLinks::with_hashes(&[0; 4]);
        let mut table = BucketTable::try_with_capacity(8).unwrap();

        table.push_front(&mut links, 3, slot(0));
        table.push_front(&mut links, 3, slot(1));
        table.push_back(&mut links, 3, slot(2));
        assert_eq!(chain(&table, &links, 3), vec![1, 0, 2]);

        table.push_back(&mut links, 5, slot(3));
        assert_eq!(chain(&table, &links, 5), vec![3]);
        assert_eq!(table.occupied(), 2);
    }

    #[test]
    fn unlink_head_middle_tail() {
        let mut links = FlatLinks::with_hashes(&[0; 3]);
        let mut table = BucketTable::try_with_capacity(8).unwrap();
        for i in 0..3 {
            table.push_back(&mut links, 0, slot(i));
        }

        table.unlink(&mut links, 0, Some(slot(0)), slot(1));
        assert_eq!(chain(&table, &links, 0), vec![0, 2]);
        table.unlink(&mut links, 0, None, slot(0));
        assert_eq!(chain(&table, &links, 0), vec![2]);
        table.unlink(&mut links, 0, None, slot(2));
        assert!(table.head(0).is_none());
    }

    #[test]
    fn grow_in_place_keeps_existing_heads() {
        let mut links = FlatLinks::with_hashes(&[0; 1]);
        let mut table = BucketTable::try_with_capacity(8).unwrap();
        table.push_front(&mut links, 7, slot(0));

        table.try_grow_in_place(32).unwrap();
        table.set_mask(32);
        assert_eq!(table.len(), 32);
        assert_eq!(table.head(7), Some(slot(0)));
        assert!(table.head(31).is_none());
    }
}
